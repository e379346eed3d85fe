//! The linear stack-machine intermediate representation.
//!
//! The parser emits a flat `Vec<Instruction>` with *symbolic* jump targets
//! ([`Target::Label`]); the optimizer rewrites that vector in place; the
//! [`linker`](crate::ir::linker) then resolves every target to an absolute
//! instruction index. A parallel span vector maps each instruction back to
//! its source position for error attribution.

pub(crate) mod builder;
pub(crate) mod linker;

use std::fmt;
use std::sync::Arc;

use strum::IntoStaticStr;

pub(crate) use crate::lexer::expr::CmpOp;
use crate::span::Span;
use crate::value::Value;

/// A symbolic label allocated by the builder.
///
/// Declared by exactly one [`Instruction::Label`]; any number of jumps may
/// reference it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub(crate) struct LabelId(pub u32);

impl fmt::Display for LabelId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "L{}", self.0)
    }
}

/// A jump destination: symbolic before linking, absolute after.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Target {
    Label(LabelId),
    Index(usize),
}

impl fmt::Display for Target {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Label(label) => write!(f, "{label}"),
            Self::Index(index) => write!(f, "@{index}"),
        }
    }
}

/// The pending-interrupt kind raised by `break` and `continue`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum InterruptKind {
    Break,
    Continue,
}

/// Static configuration of a `for` loop, carried by [`Instruction::ForInit`].
///
/// The flags describe which modifier values the loop evaluated onto the
/// stack; `ForInit` pops them in reverse evaluation order.
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct ForInitArgs {
    /// The loop variable name.
    pub var: Arc<str>,
    /// Loop identity for `offset: continue` registers: `"<var>-<collection>"`.
    pub loop_name: Arc<str>,
    pub has_limit: bool,
    pub has_offset: bool,
    /// `offset: continue` resumes from the loop's register instead of an
    /// explicit offset value.
    pub offset_continue: bool,
    pub reversed: bool,
}

/// Static configuration of a `tablerow` loop.
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct TablerowInitArgs {
    pub var: Arc<str>,
    pub loop_name: Arc<str>,
    pub has_cols: bool,
    pub has_limit: bool,
    pub has_offset: bool,
}

/// How a partial call binds its `with`/`for` argument.
#[derive(Debug, Clone, PartialEq)]
pub(crate) enum PartialBinding {
    /// No `with` or `for`; the binding slot on the stack holds nil.
    None,
    /// `with <expr> [as <name>]`: bind the single value.
    With(Option<Arc<str>>),
    /// `for <expr> [as <name>]`: render once per item of the value.
    For(Option<Arc<str>>),
}

/// Static portion of a `render`/`include` call.
///
/// Argument expressions are spliced inline before the call instruction; at
/// runtime the call pops the keyword-argument hash, the binding value and,
/// when `name` is `None`, the dynamically computed partial name.
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct PartialCall {
    /// Literal partial name, or `None` when the name is computed at runtime.
    pub name: Option<Arc<str>>,
    pub binding: PartialBinding,
}

/// A partial body resolved and compiled at optimization time.
///
/// Produced by the partial-inlining pass for literal-name calls whose bodies
/// could not be spliced but could be pre-compiled; the VM skips the loader
/// and parser entirely.
#[derive(Debug, Clone)]
pub(crate) struct InlinePartial {
    pub name: Arc<str>,
    pub template: Arc<CompiledTemplate>,
    pub binding: PartialBinding,
}

impl PartialEq for InlinePartial {
    fn eq(&self, other: &Self) -> bool {
        self.name == other.name && self.binding == other.binding && Arc::ptr_eq(&self.template, &other.template)
    }
}

/// One IR instruction.
///
/// Operands are embedded in the variants; string operands are `Arc<str>` so
/// rewriting passes clone instructions freely.
#[derive(Debug, Clone, PartialEq, IntoStaticStr)]
pub(crate) enum Instruction {
    // -- Output ----------------------------------------------------------
    /// Appends a literal string to the current output target.
    WriteRaw(Arc<str>),
    /// Pops a value and appends its output conversion.
    WriteValue,

    // -- Constants -------------------------------------------------------
    ConstNil,
    ConstTrue,
    ConstFalse,
    ConstInt(i64),
    ConstFloat(f64),
    ConstString(Arc<str>),
    /// An inclusive integer range with compile-time bounds.
    ConstRange(i64, i64),
    ConstEmpty,
    ConstBlank,

    // -- Variable access -------------------------------------------------
    /// Pushes the variable's value; a miss pushes nil.
    FindVar(Arc<str>),
    /// Pops a name value, resolves it as a variable.
    FindVarDynamic,
    /// Fused variable + constant lookup path.
    FindVarPath(Arc<str>, Arc<[Arc<str>]>),
    /// Pops key then container, pushes the element.
    LookupKey,
    /// Pops a container, pushes the element at the constant key.
    LookupConstKey(Arc<str>),
    /// Collapsed chain of constant-key lookups.
    LookupConstPath(Arc<[Arc<str>]>),
    /// Specialized `size`/`first`/`last` access.
    LookupCommand(Arc<str>),

    // -- Control flow ----------------------------------------------------
    /// Parse-time marker; becomes `Noop` at link time.
    Label(LabelId),
    Jump(Target),
    /// Pops a value; jumps when it is falsy.
    JumpIfFalse(Target),
    /// Pops a value; jumps when it is truthy.
    JumpIfTrue(Target),
    /// Peeks (does not pop) the top value; jumps when it iterates empty.
    JumpIfEmpty(Target),
    /// Jumps when the pending interrupt is a `break`; falls through on
    /// `continue` or no interrupt.
    JumpIfInterrupt(Target),
    Halt,
    Noop,

    // -- Comparison and logic --------------------------------------------
    /// Pops `b` then `a`, pushes `a <op> b`.
    Compare(CmpOp),
    /// `when` clause comparison: like `==` but sentinels only match their
    /// exact structural counterparts.
    CaseCompare,
    /// Pops needle then haystack, pushes the membership test.
    Contains,
    BoolNot,
    IsTruthy,

    // -- Scope and assignment --------------------------------------------
    PushScope,
    PopScope,
    /// Pops a value, binds it in the root frame.
    Assign(Arc<str>),
    /// Pops a value, binds it in the innermost frame.
    AssignLocal(Arc<str>),

    // -- Loops -----------------------------------------------------------
    /// Pops modifier values and the collection, materializes the iteration
    /// sequence onto the iterator stack.
    ForInit(Arc<ForInitArgs>),
    /// Advances the innermost iterator: pushes the next item and falls
    /// through, or jumps to `brk` on exhaustion. `cont` delimits the body
    /// for the optimizer.
    ForNext { cont: Target, brk: Target },
    /// Pops the iterator stack and records the `offset: continue` register.
    ForEnd,
    PushForloop,
    PopForloop,
    TablerowInit(Arc<TablerowInitArgs>),
    TablerowNext { cont: Target, brk: Target },
    TablerowEnd,
    PushInterrupt(InterruptKind),
    PopInterrupt,

    // -- Filters ---------------------------------------------------------
    /// Pops `argc` arguments then the input, pushes the filter result.
    CallFilter { name: Arc<str>, argc: u8 },

    // -- Capture ---------------------------------------------------------
    PushCapture,
    /// Closes the capture and pushes the captured string.
    PopCapture,

    // -- Partials --------------------------------------------------------
    /// Renders a partial in an isolated scope.
    RenderPartial(Arc<PartialCall>),
    /// Renders a partial in the caller's scope.
    IncludePartial(Arc<PartialCall>),
    /// `RenderPartial` with a pre-compiled body.
    ConstRender(Arc<InlinePartial>),
    /// `IncludePartial` with a pre-compiled body.
    ConstInclude(Arc<InlinePartial>),

    // -- Counters and cycles ---------------------------------------------
    /// Pushes the counter value, then increments it.
    Increment(Arc<str>),
    /// Decrements the counter, then pushes it.
    Decrement(Arc<str>),
    /// Pops `argc` cycle values, pushes the one selected by the group's
    /// position, advances the position.
    CycleStep { key: Arc<str>, argc: u8 },
    /// Like `CycleStep` but pops the group name value first pushed below the
    /// cycle values.
    CycleStepVar { argc: u8 },

    // -- Stack -----------------------------------------------------------
    Dup,
    Pop,
    /// Pops `count` key/value pairs (key pushed first), pushes a hash.
    BuildHash(u16),
    StoreTemp(u8),
    LoadTemp(u8),
    /// Pops end then start, pushes the integer range.
    NewRange,

    // -- Misc ------------------------------------------------------------
    /// Pops a captured body; writes it only when it differs from the last
    /// body seen at this site.
    IfchangedCheck(u32),
}

impl Instruction {
    /// The opcode's name, for tracing and disassembly.
    pub(crate) fn opcode_name(&self) -> &'static str {
        self.into()
    }

    /// Net value-stack effect of executing this instruction once.
    ///
    /// Conditional jumps report their fall-through effect; the parser and
    /// builder reconcile branch depths explicitly at labels.
    pub(crate) fn stack_effect(&self) -> i16 {
        match self {
            Self::WriteValue
            | Self::JumpIfFalse(_)
            | Self::JumpIfTrue(_)
            | Self::Compare(_)
            | Self::CaseCompare
            | Self::Contains
            | Self::Assign(_)
            | Self::AssignLocal(_)
            | Self::Pop
            | Self::StoreTemp(_)
            | Self::NewRange
            | Self::LookupKey
            | Self::IfchangedCheck(_) => -1,

            Self::ConstNil
            | Self::ConstTrue
            | Self::ConstFalse
            | Self::ConstInt(_)
            | Self::ConstFloat(_)
            | Self::ConstString(_)
            | Self::ConstRange(_, _)
            | Self::ConstEmpty
            | Self::ConstBlank
            | Self::FindVar(_)
            | Self::FindVarPath(_, _)
            | Self::ForNext { .. }
            | Self::TablerowNext { .. }
            | Self::PopCapture
            | Self::Increment(_)
            | Self::Decrement(_)
            | Self::Dup
            | Self::LoadTemp(_) => 1,

            Self::ForInit(args) => -1 - i16::from(args.has_limit) - i16::from(args.has_offset),
            Self::TablerowInit(args) => {
                -1 - i16::from(args.has_cols) - i16::from(args.has_limit) - i16::from(args.has_offset)
            }
            Self::CallFilter { argc, .. } => -i16::from(*argc),
            Self::CycleStep { argc, .. } => 1 - i16::from(*argc),
            Self::CycleStepVar { argc } => -i16::from(*argc),
            Self::BuildHash(count) => 1 - 2 * count.cast_signed(),
            Self::RenderPartial(call) | Self::IncludePartial(call) => {
                -2 - i16::from(call.name.is_none())
            }
            Self::ConstRender(_) | Self::ConstInclude(_) => -2,

            _ => 0,
        }
    }

    /// True for instructions that neither read nor write anything outside
    /// the value stack. Pure instructions are candidates for constant
    /// folding, hoisting and value numbering.
    pub(crate) fn is_pure(&self) -> bool {
        matches!(
            self,
            Self::ConstNil
                | Self::ConstTrue
                | Self::ConstFalse
                | Self::ConstInt(_)
                | Self::ConstFloat(_)
                | Self::ConstString(_)
                | Self::ConstRange(_, _)
                | Self::ConstEmpty
                | Self::ConstBlank
                | Self::FindVar(_)
                | Self::FindVarPath(_, _)
                | Self::LookupKey
                | Self::LookupConstKey(_)
                | Self::LookupConstPath(_)
                | Self::LookupCommand(_)
                | Self::Compare(_)
                | Self::CaseCompare
                | Self::Contains
                | Self::BoolNot
                | Self::IsTruthy
                | Self::Dup
                | Self::NewRange
        )
    }

    /// If this instruction pushes a compile-time constant, returns it.
    pub(crate) fn as_const(&self) -> Option<Value> {
        match self {
            Self::ConstNil => Some(Value::Nil),
            Self::ConstTrue => Some(Value::Bool(true)),
            Self::ConstFalse => Some(Value::Bool(false)),
            Self::ConstInt(i) => Some(Value::Int(*i)),
            Self::ConstFloat(f) => Some(Value::Float(*f)),
            Self::ConstString(s) => Some(Value::Str(s.clone())),
            Self::ConstRange(a, b) => Some(Value::Range(crate::value::RangeValue { start: *a, end: *b })),
            Self::ConstEmpty => Some(Value::Empty),
            Self::ConstBlank => Some(Value::Blank),
            _ => None,
        }
    }

    /// The inverse of [`as_const`](Self::as_const): the instruction that
    /// pushes `value`. `None` for values with no literal form (drops).
    pub(crate) fn for_const(value: &Value) -> Option<Self> {
        match value {
            Value::Nil => Some(Self::ConstNil),
            Value::Bool(true) => Some(Self::ConstTrue),
            Value::Bool(false) => Some(Self::ConstFalse),
            Value::Int(i) => Some(Self::ConstInt(*i)),
            Value::Float(f) => Some(Self::ConstFloat(*f)),
            Value::Decimal(d) => Some(Self::ConstString(Arc::from(d.to_string()))),
            Value::Str(s) => Some(Self::ConstString(s.clone())),
            Value::Range(r) => Some(Self::ConstRange(r.start, r.end)),
            Value::Empty => Some(Self::ConstEmpty),
            Value::Blank => Some(Self::ConstBlank),
            Value::Array(_) | Value::Map(_) | Value::Drop(_) => None,
        }
    }

    /// The jump target, for instructions that have one.
    pub(crate) fn target(&self) -> Option<Target> {
        match self {
            Self::Jump(t) | Self::JumpIfFalse(t) | Self::JumpIfTrue(t) | Self::JumpIfEmpty(t) | Self::JumpIfInterrupt(t) => {
                Some(*t)
            }
            Self::ForNext { brk, .. } | Self::TablerowNext { brk, .. } => Some(*brk),
            _ => None,
        }
    }

    /// Rewrites every jump target through `f`.
    pub(crate) fn map_targets(&mut self, mut f: impl FnMut(Target) -> Target) {
        match self {
            Self::Jump(t) | Self::JumpIfFalse(t) | Self::JumpIfTrue(t) | Self::JumpIfEmpty(t) | Self::JumpIfInterrupt(t) => {
                *t = f(*t);
            }
            Self::ForNext { cont, brk } | Self::TablerowNext { cont, brk } => {
                *cont = f(*cont);
                *brk = f(*brk);
            }
            _ => {}
        }
    }
}

/// The compiled, linked artifact: an immutable instruction vector plus its
/// span table. Shareable across threads; a render never mutates it.
#[derive(Debug)]
pub struct CompiledTemplate {
    pub(crate) name: Option<Arc<str>>,
    pub(crate) code: Vec<Instruction>,
    pub(crate) spans: Vec<Span>,
    /// Number of temporary slots the register allocator assigned.
    pub(crate) temp_slots: u8,
}

impl CompiledTemplate {
    /// Number of instructions in the template.
    #[must_use]
    pub fn len(&self) -> usize {
        self.code.len()
    }

    /// True when the template compiled to no instructions (impossible in
    /// practice: linked templates always end in `Halt`).
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.code.is_empty()
    }

    /// Human-readable listing of the instruction vector, for debugging and
    /// optimizer tests.
    #[must_use]
    pub fn disassemble(&self) -> String {
        use fmt::Write;
        let mut out = String::new();
        for (index, instruction) in self.code.iter().enumerate() {
            let _ = writeln!(out, "{index:>4}  {instruction:?}");
        }
        out
    }
}

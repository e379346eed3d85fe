//! The stack virtual machine.
//!
//! Executes a linked instruction vector against a [`Scope`]. The VM owns the
//! value stack, the iterator stack and the temporary slots; everything a
//! template can observe or mutate lives in the scope, so the compiled
//! template itself stays immutable and shareable.
//!
//! Error recovery: in lax mode a recoverable runtime or filter error writes
//! the standard inline error text at the current output position, the
//! failing instruction's stack effect is repaired, and execution continues
//! at the next instruction. Resource errors and strict mode abort the run.

pub(crate) mod iterate;
pub(crate) mod partials;

use std::sync::Arc;

use ahash::AHashMap;
use smallvec::SmallVec;

use crate::error::{ErrorMode, RunError, RunResult, TemplateError};
use crate::filters;
use crate::ir::{CompiledTemplate, Instruction, InterruptKind, Target};
use crate::partials::PartialSource;
use crate::resource::ResourceTracker;
use crate::scope::{CaptureFrame, ForloopFrame, Interrupt, Scope, TablerowFrame};
use crate::template::TemplateOptions;
use crate::tracer::VmTracer;
use crate::value::{RangeValue, Value};
use self::iterate::LoopIter;

/// Per-render state shared across nested partial executions.
pub(crate) struct RenderSession<'a, T: ResourceTracker, Tr: VmTracer> {
    pub partials: &'a dyn PartialSource,
    pub options: &'a TemplateOptions,
    pub tracker: T,
    pub tracer: Tr,
    /// Partials compiled during this render, keyed by name.
    pub partial_cache: AHashMap<String, Arc<CompiledTemplate>>,
}

/// Where the program counter goes after an instruction.
enum Flow {
    Next,
    Jump(usize),
    Halt,
}

/// One executing template: program counter plus the three VM stacks.
struct Vm<'t> {
    template: &'t CompiledTemplate,
    pc: usize,
    stack: Vec<Value>,
    iters: Vec<LoopIter>,
    temps: Vec<Value>,
}

/// Executes `template` against `scope`, appending to `out`.
pub(crate) fn run<T: ResourceTracker, Tr: VmTracer>(
    template: &CompiledTemplate,
    scope: &mut Scope,
    out: &mut String,
    session: &mut RenderSession<'_, T, Tr>,
) -> Result<(), TemplateError> {
    let mut vm = Vm {
        template,
        pc: 0,
        stack: Vec::with_capacity(8),
        iters: Vec::new(),
        temps: vec![Value::Nil; usize::from(template.temp_slots)],
    };

    while vm.pc < template.code.len() {
        let instruction = &template.code[vm.pc];
        session.tracer.on_instruction(vm.pc, instruction.opcode_name());
        if let Err(err) = session.tracker.on_instruction() {
            return Err(RunError::from(err).into_template_error(template.name.clone(), vm.line()));
        }
        match vm.step(instruction, scope, out, session) {
            Ok(Flow::Next) => vm.pc += 1,
            Ok(Flow::Jump(target)) => vm.pc = target,
            Ok(Flow::Halt) => break,
            Err(err) => {
                if session.options.error_mode == ErrorMode::Strict || !err.is_recoverable() {
                    return Err(err.into_template_error(template.name.clone(), vm.line()));
                }
                let text = err.inline_text(template.name.as_deref(), vm.line());
                session.tracer.on_inline_error(&text);
                if let Err(resource) = vm.write(&text, scope, out, session) {
                    return Err(resource.into_template_error(template.name.clone(), vm.line()));
                }
                vm.repair_stack(&template.code[vm.pc], scope);
                vm.pc += 1;
            }
        }
    }
    debug_assert!(vm.stack.is_empty(), "value stack not empty at halt");
    Ok(())
}

impl<'t> Vm<'t> {
    /// Source line of the current instruction.
    fn line(&self) -> u32 {
        self.template.spans.get(self.pc).map_or(0, |span| span.line)
    }

    fn pop(&mut self) -> RunResult<Value> {
        self.stack
            .pop()
            .ok_or_else(|| RunError::runtime("value stack underflow"))
    }

    /// Appends to the innermost capture buffer, or the main output.
    fn write<T: ResourceTracker, Tr: VmTracer>(
        &mut self,
        text: &str,
        scope: &mut Scope,
        out: &mut String,
        session: &mut RenderSession<'_, T, Tr>,
    ) -> RunResult<()> {
        session.tracker.on_output(text.len())?;
        match scope.captures.last_mut() {
            Some(capture) => capture.buffer.push_str(text),
            None => out.push_str(text),
        }
        Ok(())
    }

    /// Restores the stack balance of a failed instruction so lax-mode
    /// execution can continue. Fallible instructions pop their operands
    /// before they can fail, so only the push side needs repair.
    fn repair_stack(&mut self, instruction: &Instruction, scope: &mut Scope) {
        match instruction {
            Instruction::Compare(_) | Instruction::CaseCompare | Instruction::Contains => {
                self.stack.push(Value::Bool(false));
            }
            Instruction::CallFilter { .. }
            | Instruction::FindVar(_)
            | Instruction::FindVarDynamic
            | Instruction::FindVarPath(_, _)
            | Instruction::NewRange => self.stack.push(Value::Nil),
            Instruction::ForInit(args) => self.iters.push(LoopIter::empty(args.loop_name.clone())),
            Instruction::TablerowInit(args) => {
                self.iters.push(LoopIter::empty(args.loop_name.clone()));
                scope.tablerows.push(TablerowFrame {
                    length: 0,
                    index0: 0,
                    cols: 1,
                });
            }
            _ => {}
        }
    }

    fn jump(target: Target) -> RunResult<Flow> {
        match target {
            Target::Index(index) => Ok(Flow::Jump(index)),
            Target::Label(label) => Err(RunError::runtime(format!("jump to unlinked label {label}"))),
        }
    }

    #[expect(clippy::too_many_lines, reason = "single fetch-decode-dispatch match")]
    fn step<T: ResourceTracker, Tr: VmTracer>(
        &mut self,
        instruction: &Instruction,
        scope: &mut Scope,
        out: &mut String,
        session: &mut RenderSession<'_, T, Tr>,
    ) -> RunResult<Flow> {
        match instruction {
            // -- Output ----------------------------------------------------
            Instruction::WriteRaw(text) => {
                let text = text.clone();
                self.write(&text, scope, out, session)?;
            }
            Instruction::WriteValue => {
                let value = self.pop()?;
                let text = value.to_output_string();
                self.write(&text, scope, out, session)?;
            }

            // -- Constants -------------------------------------------------
            Instruction::ConstNil => self.stack.push(Value::Nil),
            Instruction::ConstTrue => self.stack.push(Value::Bool(true)),
            Instruction::ConstFalse => self.stack.push(Value::Bool(false)),
            Instruction::ConstInt(i) => self.stack.push(Value::Int(*i)),
            Instruction::ConstFloat(f) => self.stack.push(Value::Float(*f)),
            Instruction::ConstString(s) => self.stack.push(Value::Str(s.clone())),
            Instruction::ConstRange(start, end) => self.stack.push(Value::Range(RangeValue {
                start: *start,
                end: *end,
            })),
            Instruction::ConstEmpty => self.stack.push(Value::Empty),
            Instruction::ConstBlank => self.stack.push(Value::Blank),

            // -- Variable access -------------------------------------------
            Instruction::FindVar(name) => {
                let value = self.find_var(name, scope, session)?;
                self.stack.push(value);
            }
            Instruction::FindVarDynamic => {
                let name = self.pop()?.to_output_string();
                let value = self.find_var(&name, scope, session)?;
                self.stack.push(value);
            }
            Instruction::FindVarPath(name, path) => {
                let mut value = self.find_var(name, scope, session)?;
                for key in path.iter() {
                    value = lookup_key(&value, &Value::Str(key.clone()));
                }
                self.stack.push(value);
            }
            Instruction::LookupKey => {
                let key = self.pop()?;
                let container = self.pop()?;
                self.stack.push(lookup_key(&container, &key));
            }
            Instruction::LookupConstKey(key) => {
                let container = self.pop()?;
                self.stack.push(lookup_key(&container, &Value::Str(key.clone())));
            }
            Instruction::LookupConstPath(path) => {
                let mut value = self.pop()?;
                for key in path.iter() {
                    value = lookup_key(&value, &Value::Str(key.clone()));
                }
                self.stack.push(value);
            }
            Instruction::LookupCommand(name) => {
                let container = self.pop()?;
                self.stack.push(lookup_command(&container, name));
            }

            // -- Control flow ----------------------------------------------
            Instruction::Label(_) | Instruction::Noop => {}
            Instruction::Jump(target) => return Self::jump(*target),
            Instruction::JumpIfFalse(target) => {
                if !self.pop()?.is_truthy() {
                    return Self::jump(*target);
                }
            }
            Instruction::JumpIfTrue(target) => {
                if self.pop()?.is_truthy() {
                    return Self::jump(*target);
                }
            }
            Instruction::JumpIfEmpty(target) => {
                let empty = self.stack.last().is_none_or(Value::iterates_empty);
                if empty {
                    return Self::jump(*target);
                }
            }
            Instruction::JumpIfInterrupt(target) => {
                if scope.pending_interrupt() == Some(Interrupt::Break) {
                    return Self::jump(*target);
                }
            }
            Instruction::Halt => return Ok(Flow::Halt),

            // -- Comparison and logic --------------------------------------
            Instruction::Compare(op) => {
                let b = self.pop()?;
                let a = self.pop()?;
                let result = filters::compare_values(&a, &b, *op)?;
                self.stack.push(Value::Bool(result));
            }
            Instruction::CaseCompare => {
                let b = self.pop()?;
                let a = self.pop()?;
                self.stack.push(Value::Bool(a.case_eq(&b)));
            }
            Instruction::Contains => {
                let needle = self.pop()?;
                let haystack = self.pop()?;
                self.stack.push(Value::Bool(haystack.contains(&needle)));
            }
            Instruction::BoolNot => {
                let value = self.pop()?;
                self.stack.push(Value::Bool(!value.is_truthy()));
            }
            Instruction::IsTruthy => {
                let value = self.pop()?;
                self.stack.push(Value::Bool(value.is_truthy()));
            }

            // -- Scope and assignment --------------------------------------
            Instruction::PushScope => scope.push_frame(),
            Instruction::PopScope => scope.pop_frame(),
            Instruction::Assign(name) => {
                let value = self.pop()?;
                scope.assign(name, value);
            }
            Instruction::AssignLocal(name) => {
                let value = self.pop()?;
                scope.assign_local(name, value);
            }

            // -- Loops -----------------------------------------------------
            Instruction::ForInit(args) => {
                let collection = self.pop()?;
                let limit = if args.has_limit { Some(self.pop()?) } else { None };
                let offset = if args.has_offset { Some(self.pop()?) } else { None };
                let items = iterate::materialize(&collection);

                let offset_value = if args.offset_continue {
                    let resume = scope.for_offsets.get(args.loop_name.as_ref()).copied().unwrap_or(0);
                    Some(Value::Int(i64::try_from(resume).unwrap_or(i64::MAX)))
                } else {
                    offset
                };
                let (items, from) =
                    iterate::apply_modifiers(items, offset_value.as_ref(), limit.as_ref(), args.reversed)?;
                scope.for_offsets.insert(args.loop_name.to_string(), from + items.len());
                self.iters.push(LoopIter {
                    items,
                    index: 0,
                    loop_name: args.loop_name.clone(),
                });
            }
            Instruction::ForNext { cont: _, brk } => {
                let iter = self
                    .iters
                    .last_mut()
                    .ok_or_else(|| RunError::runtime("iterator stack underflow"))?;
                match iter.next() {
                    Some(item) => {
                        if let Some(frame) = scope.forloops.last_mut() {
                            frame.index0 = iter.index - 1;
                        }
                        self.stack.push(item);
                    }
                    None => return Self::jump(*brk),
                }
            }
            Instruction::ForEnd => {
                self.iters.pop();
            }
            Instruction::PushForloop => {
                let iter = self
                    .iters
                    .last()
                    .ok_or_else(|| RunError::runtime("iterator stack underflow"))?;
                scope.forloops.push(ForloopFrame {
                    name: iter.loop_name.clone(),
                    length: iter.items.len(),
                    index0: 0,
                });
            }
            Instruction::PopForloop => {
                scope.forloops.pop();
            }
            Instruction::TablerowInit(args) => {
                let collection = self.pop()?;
                let limit = if args.has_limit { Some(self.pop()?) } else { None };
                let cols = if args.has_cols { Some(self.pop()?) } else { None };
                let offset = if args.has_offset { Some(self.pop()?) } else { None };
                let items = iterate::materialize(&collection);
                let (items, _) = iterate::apply_modifiers(items, offset.as_ref(), limit.as_ref(), false)?;
                let cols = match cols {
                    Some(value) => {
                        let cols = value.as_int().ok_or_else(|| RunError::runtime("invalid integer"))?;
                        usize::try_from(cols.max(1)).unwrap_or(1)
                    }
                    None => items.len().max(1),
                };
                scope.tablerows.push(TablerowFrame {
                    length: items.len(),
                    index0: 0,
                    cols,
                });
                self.iters.push(LoopIter {
                    items,
                    index: 0,
                    loop_name: args.loop_name.clone(),
                });
                self.write("<tr class=\"row1\">\n", scope, out, session)?;
            }
            Instruction::TablerowNext { cont: _, brk } => {
                let iter = self
                    .iters
                    .last_mut()
                    .ok_or_else(|| RunError::runtime("iterator stack underflow"))?;
                let Some(item) = iter.next() else {
                    return Self::jump(*brk);
                };
                let index = iter.index - 1;
                let (cols, row_open) = {
                    let frame = scope
                        .tablerows
                        .last_mut()
                        .ok_or_else(|| RunError::runtime("tablerow state underflow"))?;
                    frame.index0 = index;
                    (frame.cols, index > 0 && index % frame.cols == 0)
                };
                if index > 0 {
                    self.write("</td>", scope, out, session)?;
                }
                if row_open {
                    let row = index / cols + 1;
                    let text = format!("</tr>\n<tr class=\"row{row}\">");
                    self.write(&text, scope, out, session)?;
                }
                let col = index % cols + 1;
                let text = format!("<td class=\"col{col}\">");
                self.write(&text, scope, out, session)?;
                self.stack.push(item);
            }
            Instruction::TablerowEnd => {
                let emitted = self.iters.pop().is_some_and(|iter| iter.index > 0);
                scope.tablerows.pop();
                if emitted {
                    self.write("</td>", scope, out, session)?;
                }
                self.write("</tr>\n", scope, out, session)?;
            }
            Instruction::PushInterrupt(kind) => {
                scope.push_interrupt(match kind {
                    InterruptKind::Break => Interrupt::Break,
                    InterruptKind::Continue => Interrupt::Continue,
                });
            }
            Instruction::PopInterrupt => scope.pop_interrupt(),

            // -- Filters ---------------------------------------------------
            Instruction::CallFilter { name, argc } => {
                let mut args: SmallVec<[Value; 4]> = SmallVec::with_capacity(usize::from(*argc));
                for _ in 0..*argc {
                    args.push(self.pop()?);
                }
                args.reverse();
                let input = self.pop()?;
                let result = self.call_filter(name, &input, &args, session)?;
                self.stack.push(result);
            }

            // -- Capture ---------------------------------------------------
            Instruction::PushCapture => {
                scope.captures.push(CaptureFrame {
                    buffer: String::new(),
                    interrupt_depth: scope.interrupt_depth(),
                });
            }
            Instruction::PopCapture => {
                let frame = scope
                    .captures
                    .pop()
                    .ok_or_else(|| RunError::runtime("capture stack underflow"))?;
                // An interrupt raised inside a capture reaches the enclosing
                // loop only when there is one; otherwise it dies with the
                // capture.
                if scope.forloops.is_empty() && scope.tablerows.is_empty() {
                    scope.truncate_interrupts(frame.interrupt_depth);
                }
                self.stack.push(Value::from(frame.buffer));
            }

            // -- Partials --------------------------------------------------
            Instruction::RenderPartial(call) => self.exec_partial_call(call, true, scope, out, session)?,
            Instruction::IncludePartial(call) => self.exec_partial_call(call, false, scope, out, session)?,
            Instruction::ConstRender(inline) => self.exec_inline_partial(inline, true, scope, out, session)?,
            Instruction::ConstInclude(inline) => self.exec_inline_partial(inline, false, scope, out, session)?,

            // -- Counters and cycles ---------------------------------------
            Instruction::Increment(name) => {
                let counter = scope.counters.entry(name.to_string()).or_insert(0);
                self.stack.push(Value::Int(*counter));
                *counter += 1;
            }
            Instruction::Decrement(name) => {
                let counter = scope.counters.entry(name.to_string()).or_insert(0);
                *counter -= 1;
                self.stack.push(Value::Int(*counter));
            }
            Instruction::CycleStep { key, argc } => {
                let values = self.pop_cycle_values(*argc)?;
                self.cycle_step(key.as_ref(), &values, scope);
            }
            Instruction::CycleStepVar { argc } => {
                let values = self.pop_cycle_values(*argc)?;
                let group = self.pop()?.to_output_string();
                let key = format!("name:{group}");
                self.cycle_step(&key, &values, scope);
            }

            // -- Stack -----------------------------------------------------
            Instruction::Dup => {
                let top = self
                    .stack
                    .last()
                    .cloned()
                    .ok_or_else(|| RunError::runtime("value stack underflow"))?;
                self.stack.push(top);
            }
            Instruction::Pop => {
                self.pop()?;
            }
            Instruction::BuildHash(count) => {
                let mut pairs = Vec::with_capacity(usize::from(*count));
                for _ in 0..*count {
                    let value = self.pop()?;
                    let key = self.pop()?;
                    pairs.push((key.to_output_string(), value));
                }
                let mut map = crate::value::ValueMap::new();
                for (key, value) in pairs.into_iter().rev() {
                    map.insert(key, value);
                }
                self.stack.push(Value::map(map));
            }
            Instruction::StoreTemp(slot) => {
                let value = self.pop()?;
                self.temps[usize::from(*slot)] = value;
            }
            Instruction::LoadTemp(slot) => {
                self.stack.push(self.temps[usize::from(*slot)].clone());
            }
            Instruction::NewRange => {
                let end = self.pop()?;
                let start = self.pop()?;
                let (Some(start), Some(end)) = (start.as_int(), end.as_int()) else {
                    return Err(RunError::runtime("invalid integer"));
                };
                self.stack.push(Value::Range(RangeValue { start, end }));
            }

            // -- Misc ------------------------------------------------------
            Instruction::IfchangedCheck(id) => {
                let body = self.pop()?.to_output_string();
                if scope.ifchanged.get(id).is_none_or(|previous| previous != &body) {
                    scope.ifchanged.insert(*id, body.clone());
                    self.write(&body, scope, out, session)?;
                }
            }
        }
        Ok(Flow::Next)
    }

    fn find_var<T: ResourceTracker, Tr: VmTracer>(
        &self,
        name: &str,
        scope: &Scope,
        session: &RenderSession<'_, T, Tr>,
    ) -> RunResult<Value> {
        match scope.lookup(name) {
            Some(value) => Ok(value),
            None if session.options.strict_variables => {
                Err(RunError::runtime(format!("undefined variable `{name}`")))
            }
            None => Ok(Value::Nil),
        }
    }

    fn call_filter<T: ResourceTracker, Tr: VmTracer>(
        &self,
        name: &str,
        input: &Value,
        args: &[Value],
        session: &RenderSession<'_, T, Tr>,
    ) -> RunResult<Value> {
        if let Some(custom) = session.options.custom_filter(name) {
            return custom(input, args).map_err(crate::filters::filter_error);
        }
        if filters::is_builtin(name) {
            return filters::apply(name, input, args);
        }
        if session.options.strict_filters {
            return Err(RunError::runtime(format!("unknown filter `{name}`")));
        }
        // Lax policy: an unknown filter is the identity.
        Ok(input.clone())
    }

    fn pop_cycle_values(&mut self, argc: u8) -> RunResult<Vec<Value>> {
        let mut values = Vec::with_capacity(usize::from(argc));
        for _ in 0..argc {
            values.push(self.pop()?);
        }
        values.reverse();
        Ok(values)
    }

    /// Shared cycle state: the identity is the group key plus the rendered
    /// value list, so distinct value sets under one position do not collide.
    fn cycle_step(&mut self, key: &str, values: &[Value], scope: &mut Scope) {
        if values.is_empty() {
            self.stack.push(Value::Nil);
            return;
        }
        let identity = format!(
            "{key}|{}",
            values.iter().map(Value::to_output_string).collect::<Vec<_>>().join(",")
        );
        let index = scope.cycles.entry(identity).or_insert(0);
        self.stack.push(values[*index % values.len()].clone());
        *index += 1;
    }
}

/// Key lookup dispatch by container shape.
///
/// Misses and type mismatches yield nil, never an error.
pub(crate) fn lookup_key(container: &Value, key: &Value) -> Value {
    match container {
        Value::Map(map) => {
            let name = key.to_output_string();
            match map.get(name.as_str()) {
                Some(value) => value.clone(),
                None => container.property_command(&name).unwrap_or(Value::Nil),
            }
        }
        Value::Array(items) => match key {
            Value::Int(_) | Value::Decimal(_) => index_array(items, key),
            Value::Str(s) => match s.as_ref() {
                "size" | "first" | "last" => container.property_command(s).unwrap_or(Value::Nil),
                _ => index_array(items, key),
            },
            _ => Value::Nil,
        },
        Value::Str(s) => match key {
            Value::Int(index) => {
                let chars: Vec<char> = s.chars().collect();
                char_at(&chars, *index)
            }
            Value::Str(name) if matches!(name.as_ref(), "size" | "first" | "last") => {
                container.property_command(name).unwrap_or(Value::Nil)
            }
            _ => Value::Nil,
        },
        Value::Range(_) => match key {
            Value::Str(name) if matches!(name.as_ref(), "size" | "first" | "last") => {
                container.property_command(name).unwrap_or(Value::Nil)
            }
            _ => Value::Nil,
        },
        Value::Drop(drop) => drop.index(key).unwrap_or(Value::Nil),
        _ => Value::Nil,
    }
}

fn index_array(items: &[Value], key: &Value) -> Value {
    let Some(index) = key.as_int() else {
        return Value::Nil;
    };
    let resolved = if index < 0 {
        let back = usize::try_from(-index).unwrap_or(usize::MAX);
        match items.len().checked_sub(back) {
            Some(position) => position,
            None => return Value::Nil,
        }
    } else {
        match usize::try_from(index) {
            Ok(position) => position,
            Err(_) => return Value::Nil,
        }
    };
    items.get(resolved).cloned().unwrap_or(Value::Nil)
}

fn char_at(chars: &[char], index: i64) -> Value {
    let resolved = if index < 0 {
        let back = usize::try_from(-index).unwrap_or(usize::MAX);
        match chars.len().checked_sub(back) {
            Some(position) => position,
            None => return Value::Nil,
        }
    } else {
        match usize::try_from(index) {
            Ok(position) => position,
            Err(_) => return Value::Nil,
        }
    };
    chars
        .get(resolved)
        .map(|c| Value::from(c.to_string()))
        .unwrap_or(Value::Nil)
}

/// The `size`/`first`/`last` command: an actual hash key wins over the
/// command, matching the reference engine.
fn lookup_command(container: &Value, name: &str) -> Value {
    if let Value::Map(map) = container
        && let Some(value) = map.get(name)
    {
        return value.clone();
    }
    if let Some(value) = container.property_command(name) {
        return value;
    }
    if let Value::Drop(drop) = container {
        return drop.index(&Value::from(name)).unwrap_or(Value::Nil);
    }
    Value::Nil
}

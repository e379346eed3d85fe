//! VM execution tracing infrastructure.
//!
//! Provides a trait-based tracing system for the VM with zero-cost
//! abstraction. When using [`NoopTracer`], all trace methods compile away
//! entirely via monomorphization, the same way
//! [`NoLimitTracker`](crate::resource::NoLimitTracker) eliminates resource
//! checking overhead.
//!
//! | Tracer | Purpose |
//! |--------|---------|
//! | [`NoopTracer`] | Zero-cost no-op (production default) |
//! | [`StderrTracer`] | Human-readable execution log to stderr |
//! | [`ProfilingTracer`] | Opcode frequency counters |

use ahash::AHashMap;

/// Hook points the VM calls at key execution events.
///
/// The VM is parameterized over the tracer type; implementations that do
/// nothing are optimized out completely.
pub trait VmTracer {
    /// An instruction is about to be dispatched at `pc`.
    fn on_instruction(&mut self, pc: usize, opcode: &'static str) {
        let (_, _) = (pc, opcode);
    }

    /// A partial render was entered.
    fn on_partial_enter(&mut self, name: &str, depth: usize) {
        let (_, _) = (name, depth);
    }

    /// A partial render returned.
    fn on_partial_exit(&mut self, name: &str, depth: usize) {
        let (_, _) = (name, depth);
    }

    /// An error was recovered inline (lax mode).
    fn on_inline_error(&mut self, message: &str) {
        let _ = message;
    }
}

/// Zero-cost tracer that records nothing.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopTracer;

impl VmTracer for NoopTracer {}

/// Tracer that logs every dispatched instruction to stderr.
///
/// Intended for debugging template compilation issues; output volume is
/// proportional to executed instructions.
#[derive(Debug, Clone, Copy, Default)]
pub struct StderrTracer;

impl VmTracer for StderrTracer {
    fn on_instruction(&mut self, pc: usize, opcode: &'static str) {
        eprintln!("{pc:>5}  {opcode}");
    }

    fn on_partial_enter(&mut self, name: &str, depth: usize) {
        eprintln!("  --> partial {name:?} (depth {depth})");
    }

    fn on_partial_exit(&mut self, name: &str, depth: usize) {
        eprintln!("  <-- partial {name:?} (depth {depth})");
    }

    fn on_inline_error(&mut self, message: &str) {
        eprintln!("  !! {message}");
    }
}

/// Tracer that counts executed instructions per opcode.
#[derive(Debug, Clone, Default)]
pub struct ProfilingTracer {
    counts: AHashMap<&'static str, u64>,
    total: u64,
}

impl ProfilingTracer {
    /// Creates an empty profiling tracer.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Total number of instructions dispatched.
    #[must_use]
    pub fn total(&self) -> u64 {
        self.total
    }

    /// Per-opcode dispatch counts, most frequent first.
    #[must_use]
    pub fn report(&self) -> Vec<(&'static str, u64)> {
        let mut entries: Vec<_> = self.counts.iter().map(|(name, count)| (*name, *count)).collect();
        entries.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(b.0)));
        entries
    }
}

impl VmTracer for ProfilingTracer {
    fn on_instruction(&mut self, _pc: usize, opcode: &'static str) {
        *self.counts.entry(opcode).or_insert(0) += 1;
        self.total += 1;
    }
}

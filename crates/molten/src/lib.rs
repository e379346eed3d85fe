#![doc = include_str!("../../../README.md")]
#![expect(clippy::cast_possible_truncation, reason = "numeric narrowing is checked at the boundaries")]

mod decimal;
mod drop_object;
mod error;
mod filters;
mod ir;
mod lexer;
mod optimizer;
mod parser;
mod partials;
mod resource;
mod scope;
mod span;
mod template;
pub mod tracer;
mod value;
mod vm;

pub use crate::{
    decimal::Decimal,
    drop_object::{DropObject, FnDrop},
    error::{ErrorKind, ErrorMode, TemplateError},
    ir::CompiledTemplate,
    partials::{InMemorySource, NoPartials, PartialSource},
    resource::{
        DEFAULT_MAX_RENDER_DEPTH, LimitedTracker, NoLimitTracker, ResourceError, ResourceLimits, ResourceTracker,
    },
    span::Span,
    template::{Template, TemplateOptions},
    tracer::{NoopTracer, ProfilingTracer, StderrTracer, VmTracer},
    value::{RangeValue, Value, ValueMap},
};

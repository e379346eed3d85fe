//! Public compile/render interface.
//!
//! [`Template`] is the primary entry point: parse once, render many times.
//! The compiled artifact is immutable after linking, so a `Template` can be
//! shared across threads and rendered concurrently as long as each render
//! gets its own globals and output.
//!
//! # Example
//! ```
//! use molten::{Template, TemplateOptions, Value, ValueMap};
//!
//! let template = Template::parse("Hello {{ name }}!", TemplateOptions::default()).unwrap();
//! let mut globals = ValueMap::new();
//! globals.insert("name".to_owned(), Value::from("World"));
//! assert_eq!(template.render(globals).unwrap(), "Hello World!");
//! ```

use std::fmt;
use std::sync::Arc;

use ahash::AHashMap;

use crate::error::{ErrorMode, TemplateError};
use crate::filters::CustomFilter;
use crate::ir::{CompiledTemplate, linker};
use crate::optimizer::{CodeStream, OptimizeContext, optimize, regalloc};
use crate::parser::parse_template;
use crate::partials::{NoPartials, PartialSource};
use crate::resource::{NoLimitTracker, ResourceTracker};
use crate::scope::Scope;
use crate::tracer::{NoopTracer, VmTracer};
use crate::value::{Value, ValueMap};
use crate::vm::{RenderSession, run};

/// Compilation and rendering policy.
#[derive(Clone)]
pub struct TemplateOptions {
    /// Lax renders errors inline; strict aborts. See
    /// [`ErrorMode`](crate::ErrorMode).
    pub error_mode: ErrorMode,
    /// Disables the optimizer pipeline when `false`; the linker still runs.
    pub optimize: bool,
    /// Raise on undefined variables instead of yielding nil.
    pub strict_variables: bool,
    /// Raise on unknown filters instead of passing the input through.
    pub strict_filters: bool,
    filters: AHashMap<String, CustomFilter>,
}

impl TemplateOptions {
    /// Default policy: lax errors, optimizer on, lenient lookups.
    #[must_use]
    pub fn new() -> Self {
        Self {
            error_mode: ErrorMode::Lax,
            optimize: true,
            strict_variables: false,
            strict_filters: false,
            filters: AHashMap::new(),
        }
    }

    /// Strict policy: abort on every error class.
    #[must_use]
    pub fn strict() -> Self {
        Self {
            error_mode: ErrorMode::Strict,
            strict_variables: true,
            strict_filters: true,
            ..Self::new()
        }
    }

    /// Registers an application filter; it shadows a built-in of the same
    /// name. The error string becomes a standard filter error.
    pub fn register_filter(
        &mut self,
        name: impl Into<String>,
        filter: impl Fn(&Value, &[Value]) -> Result<Value, String> + Send + Sync + 'static,
    ) {
        self.filters.insert(name.into(), Arc::new(filter));
    }

    pub(crate) fn custom_filter(&self, name: &str) -> Option<&CustomFilter> {
        self.filters.get(name)
    }
}

impl Default for TemplateOptions {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for TemplateOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TemplateOptions")
            .field("error_mode", &self.error_mode)
            .field("optimize", &self.optimize)
            .field("strict_variables", &self.strict_variables)
            .field("strict_filters", &self.strict_filters)
            .field("filters", &self.filters.keys().collect::<Vec<_>>())
            .finish()
    }
}

/// A compiled template, ready to render.
#[derive(Debug, Clone)]
pub struct Template {
    compiled: Arc<CompiledTemplate>,
    options: TemplateOptions,
}

impl Template {
    /// Compiles a template source.
    ///
    /// # Errors
    /// Structural syntax errors always fail here; in lax mode malformed tags
    /// compile to inline render-time errors instead.
    pub fn parse(source: &str, options: TemplateOptions) -> Result<Self, TemplateError> {
        Self::parse_with_partials(source, options, None)
    }

    /// Compiles with a partial source available at compile time, enabling
    /// the partial-inlining optimization.
    pub fn parse_with_partials(
        source: &str,
        options: TemplateOptions,
        partials: Option<&dyn PartialSource>,
    ) -> Result<Self, TemplateError> {
        let compiled = compile(source, None, &options, partials)?;
        Ok(Self { compiled, options })
    }

    /// Renders with no partials and no resource limits.
    pub fn render(&self, globals: ValueMap) -> Result<String, TemplateError> {
        self.render_with(globals, &NoPartials)
    }

    /// Renders with a partial loader.
    pub fn render_with(&self, globals: ValueMap, partials: &dyn PartialSource) -> Result<String, TemplateError> {
        self.render_full(globals, partials, NoLimitTracker, NoopTracer)
    }

    /// Renders with full control over resource limits and tracing.
    pub fn render_full(
        &self,
        globals: ValueMap,
        partials: &dyn PartialSource,
        tracker: impl ResourceTracker,
        tracer: impl VmTracer,
    ) -> Result<String, TemplateError> {
        let mut scope = Scope::new(globals);
        let mut out = String::new();
        let mut session = RenderSession {
            partials,
            options: &self.options,
            tracker,
            tracer,
            partial_cache: AHashMap::new(),
        };
        run(&self.compiled, &mut scope, &mut out, &mut session)?;
        Ok(out)
    }

    /// The compiled artifact, mostly useful for inspecting the optimizer's
    /// output via [`CompiledTemplate::disassemble`].
    #[must_use]
    pub fn compiled(&self) -> &CompiledTemplate {
        &self.compiled
    }
}

/// The full pipeline: parse → optimize (optional) → link.
fn compile(
    source: &str,
    name: Option<Arc<str>>,
    options: &TemplateOptions,
    partials: Option<&dyn PartialSource>,
) -> Result<Arc<CompiledTemplate>, TemplateError> {
    let (code, spans) = parse_template(source, name.clone(), options.error_mode)?;
    let mut stream = CodeStream::new(code, spans);
    if options.optimize {
        let ctx = OptimizeContext {
            partials,
            mode: options.error_mode,
            inline_depth: 0,
        };
        optimize(&mut stream, &ctx)?;
    }
    linker::link(&mut stream.code)?;
    let temp_slots = regalloc::slot_count(&stream.code);
    Ok(Arc::new(CompiledTemplate {
        name,
        code: stream.code,
        spans: stream.spans,
        temp_slots,
    }))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn globals(pairs: &[(&str, Value)]) -> ValueMap {
        pairs.iter().map(|(k, v)| ((*k).to_owned(), v.clone())).collect()
    }

    #[test]
    fn test_parse_and_render() {
        let template = Template::parse("Hello {{ name }}!", TemplateOptions::default()).unwrap();
        let out = template.render(globals(&[("name", Value::from("World"))])).unwrap();
        assert_eq!(out, "Hello World!");
    }

    #[test]
    fn test_default_options_enable_optimizer() {
        let template = Template::parse("{{ 'a' | upcase }}", TemplateOptions::default()).unwrap();
        assert_eq!(template.compiled().len(), 2, "{}", template.compiled().disassemble());
    }

    #[test]
    fn test_optimizer_can_be_disabled() {
        let mut options = TemplateOptions::default();
        options.optimize = false;
        let template = Template::parse("{{ 'a' | upcase }}", options).unwrap();
        assert!(template.compiled().len() > 2);
        assert_eq!(template.render(ValueMap::new()).unwrap(), "A");
    }

    #[test]
    fn test_custom_filter() {
        let mut options = TemplateOptions::default();
        options.register_filter("shout", |input, _args| {
            Ok(Value::from(format!("{}!!", input.to_output_string())))
        });
        let template = Template::parse("{{ 'hey' | shout }}", options).unwrap();
        assert_eq!(template.render(ValueMap::new()).unwrap(), "hey!!");
    }

    #[test]
    fn test_custom_filter_error_is_inline_in_lax() {
        let mut options = TemplateOptions::default();
        options.register_filter("boom", |_, _| Err("kaboom".to_owned()));
        let template = Template::parse("a{{ 'x' | boom }}b", options).unwrap();
        assert_eq!(
            template.render(ValueMap::new()).unwrap(),
            "aLiquid error (line 1): kaboomb"
        );
    }

    #[test]
    fn test_strict_options() {
        let template = Template::parse("{{ missing }}", TemplateOptions::strict()).unwrap();
        let err = template.render(ValueMap::new()).unwrap_err();
        assert!(err.message().contains("undefined variable"));
    }
}

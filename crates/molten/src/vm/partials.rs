//! Partial execution: the `render` and `include` operations.
//!
//! Both resolve a name to a compiled template (cached per render), bind
//! arguments, and execute recursively. The difference is the scope: `render`
//! builds an isolated child scope that shares nothing mutable with the
//! caller, while `include` executes directly in the caller's scope — its
//! assignments leak out, the caller's `forloop` stays visible and cycle
//! state is shared.

use std::sync::Arc;

use crate::error::{RunError, RunResult, TemplateError};
use crate::ir::{CompiledTemplate, InlinePartial, PartialBinding, PartialCall};
use crate::ir::linker;
use crate::parser::parse_template;
use crate::resource::ResourceTracker;
use crate::scope::{ForloopFrame, Scope};
use crate::tracer::VmTracer;
use crate::value::{Value, ValueMap};
use crate::vm::{RenderSession, Vm, iterate, run};

/// Popped call operands: the keyword hash, the `with`/`for` value and, for
/// dynamic calls, the computed name.
struct CallArgs {
    name: Arc<str>,
    binding_value: Value,
    kwargs: ValueMap,
}

impl Vm<'_> {
    /// `RenderPartial` / `IncludePartial`: resolve through the loader.
    pub(super) fn exec_partial_call<T: ResourceTracker, Tr: VmTracer>(
        &mut self,
        call: &PartialCall,
        isolated: bool,
        scope: &mut Scope,
        out: &mut String,
        session: &mut RenderSession<'_, T, Tr>,
    ) -> RunResult<()> {
        let args = self.pop_call_args(call.name.clone())?;
        let template = resolve_partial(&args.name, session)?;
        self.exec_resolved(&template, &call.binding, args, isolated, scope, out, session)
    }

    /// `ConstRender` / `ConstInclude`: body pre-compiled by the optimizer.
    pub(super) fn exec_inline_partial<T: ResourceTracker, Tr: VmTracer>(
        &mut self,
        inline: &InlinePartial,
        isolated: bool,
        scope: &mut Scope,
        out: &mut String,
        session: &mut RenderSession<'_, T, Tr>,
    ) -> RunResult<()> {
        let args = self.pop_call_args(Some(inline.name.clone()))?;
        let template = inline.template.clone();
        self.exec_resolved(&template, &inline.binding, args, isolated, scope, out, session)
    }

    fn pop_call_args(&mut self, literal_name: Option<Arc<str>>) -> RunResult<CallArgs> {
        let kwargs = match self.pop()? {
            Value::Map(map) => map.as_ref().clone(),
            _ => ValueMap::new(),
        };
        let binding_value = self.pop()?;
        let name = match literal_name {
            Some(name) => name,
            None => Arc::from(self.pop()?.to_output_string().as_str()),
        };
        Ok(CallArgs {
            name,
            binding_value,
            kwargs,
        })
    }

    fn exec_resolved<T: ResourceTracker, Tr: VmTracer>(
        &mut self,
        template: &Arc<CompiledTemplate>,
        binding: &PartialBinding,
        args: CallArgs,
        isolated: bool,
        scope: &mut Scope,
        out: &mut String,
        session: &mut RenderSession<'_, T, Tr>,
    ) -> RunResult<()> {
        if scope.render_depth + 1 > session.tracker.max_render_depth() {
            return Err(RunError::runtime("nesting too deep"));
        }
        session.tracer.on_partial_enter(&args.name, scope.render_depth + 1);
        let result = if isolated {
            self.exec_render(template, binding, &args, scope, session)
        } else {
            self.exec_include(template, binding, &args, scope, out, session)
        };
        session.tracer.on_partial_exit(&args.name, scope.render_depth + 1);
        let rendered = result?;
        if let Some(buffer) = rendered {
            self.write(&buffer, scope, out, session)?;
        }
        Ok(())
    }

    /// `render`: isolated scope, no visible caller state, no leaked writes.
    ///
    /// Renders into a buffer which the caller then routes through its own
    /// capture stack.
    fn exec_render<T: ResourceTracker, Tr: VmTracer>(
        &mut self,
        template: &Arc<CompiledTemplate>,
        binding: &PartialBinding,
        args: &CallArgs,
        scope: &mut Scope,
        session: &mut RenderSession<'_, T, Tr>,
    ) -> RunResult<Option<String>> {
        let mut buffer = String::new();
        match binding {
            PartialBinding::For(alias) => {
                let bind_name = alias.clone().unwrap_or_else(|| args.name.clone());
                let items = iterate::materialize(&args.binding_value);
                let length = items.len();
                for (index, item) in items.into_iter().enumerate() {
                    let mut child = scope.isolated_child();
                    bind_kwargs(&mut child, &args.kwargs);
                    child.assign(&bind_name, item);
                    child.forloops.push(ForloopFrame {
                        name: bind_name.clone(),
                        length,
                        index0: index,
                    });
                    nested_run(template, &mut child, &mut buffer, session)?;
                }
            }
            PartialBinding::With(alias) => {
                let bind_name = alias.clone().unwrap_or_else(|| args.name.clone());
                let mut child = scope.isolated_child();
                bind_kwargs(&mut child, &args.kwargs);
                child.assign(&bind_name, args.binding_value.clone());
                nested_run(template, &mut child, &mut buffer, session)?;
            }
            PartialBinding::None => {
                let mut child = scope.isolated_child();
                bind_kwargs(&mut child, &args.kwargs);
                nested_run(template, &mut child, &mut buffer, session)?;
            }
        }
        Ok(Some(buffer))
    }

    /// `include`: executes in the caller's scope. Arguments bind in a pushed
    /// frame (popped on return); `assign` inside the partial still reaches
    /// the root frame and therefore leaks, which is the point of `include`.
    /// With a `for` binding, no `forloop` descriptor is published — the
    /// caller's remains visible.
    fn exec_include<T: ResourceTracker, Tr: VmTracer>(
        &mut self,
        template: &Arc<CompiledTemplate>,
        binding: &PartialBinding,
        args: &CallArgs,
        scope: &mut Scope,
        out: &mut String,
        session: &mut RenderSession<'_, T, Tr>,
    ) -> RunResult<Option<String>> {
        scope.push_frame();
        for (key, value) in &args.kwargs {
            scope.assign_local(key, value.clone());
        }
        let result = (|| -> RunResult<()> {
            match binding {
                PartialBinding::For(alias) => {
                    let bind_name = alias.clone().unwrap_or_else(|| args.name.clone());
                    for item in iterate::materialize(&args.binding_value) {
                        scope.assign_local(&bind_name, item);
                        self.run_into_current(template, scope, out, session)?;
                    }
                }
                PartialBinding::With(alias) => {
                    let bind_name = alias.clone().unwrap_or_else(|| args.name.clone());
                    scope.assign_local(&bind_name, args.binding_value.clone());
                    self.run_into_current(template, scope, out, session)?;
                }
                PartialBinding::None => {
                    self.run_into_current(template, scope, out, session)?;
                }
            }
            Ok(())
        })();
        scope.pop_frame();
        result?;
        Ok(None)
    }

    /// Runs an include body in the caller's scope, bumping the nesting depth
    /// for the duration. Output routes through the shared capture stack.
    fn run_into_current<T: ResourceTracker, Tr: VmTracer>(
        &mut self,
        template: &Arc<CompiledTemplate>,
        scope: &mut Scope,
        out: &mut String,
        session: &mut RenderSession<'_, T, Tr>,
    ) -> RunResult<()> {
        scope.render_depth += 1;
        let result = nested_run(template, scope, out, session);
        scope.render_depth -= 1;
        result
    }
}

/// Runs a partial body, converting an aborting error into the fatal variant
/// so its inner attribution survives the unwind.
fn nested_run<T: ResourceTracker, Tr: VmTracer>(
    template: &Arc<CompiledTemplate>,
    scope: &mut Scope,
    out: &mut String,
    session: &mut RenderSession<'_, T, Tr>,
) -> RunResult<()> {
    run(template, scope, out, session).map_err(|err| RunError::Fatal(Box::new(err)))
}

/// Resolves a partial name through the per-render cache or the loader.
///
/// Runtime-loaded partials are parsed and linked but not re-optimized; the
/// compiled form is cached by name for the rest of the render.
fn resolve_partial<T: ResourceTracker, Tr: VmTracer>(
    name: &str,
    session: &mut RenderSession<'_, T, Tr>,
) -> RunResult<Arc<CompiledTemplate>> {
    if let Some(template) = session.partial_cache.get(name) {
        return Ok(template.clone());
    }
    let source = session
        .partials
        .read(name)
        .ok_or_else(|| RunError::runtime(format!("missing partial '{name}'")))?;
    let template = compile_partial(&source, name, session).map_err(|err| {
        RunError::runtime(format!("error in partial '{name}': {}", err.message()))
    })?;
    session
        .partial_cache
        .insert(name.to_owned(), template.clone());
    Ok(template)
}

fn compile_partial<T: ResourceTracker, Tr: VmTracer>(
    source: &str,
    name: &str,
    session: &RenderSession<'_, T, Tr>,
) -> Result<Arc<CompiledTemplate>, TemplateError> {
    let name: Arc<str> = Arc::from(name);
    let (mut code, spans) = parse_template(source, Some(name.clone()), session.options.error_mode)?;
    linker::link(&mut code)?;
    Ok(Arc::new(CompiledTemplate {
        name: Some(name),
        code,
        spans,
        temp_slots: 0,
    }))
}

/// Keyword arguments bind like top-level variables in the isolated scope.
fn bind_kwargs(child: &mut Scope, kwargs: &ValueMap) {
    for (key, value) in kwargs {
        child.assign(key, value.clone());
    }
}

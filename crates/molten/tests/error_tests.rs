//! Error modes: inline recovery, strict propagation, attribution and
//! resource budgets.

use molten::{
    ErrorKind, ErrorMode, LimitedTracker, NoPartials, NoopTracer, ResourceLimits, Template, TemplateOptions, Value,
    ValueMap,
};
use pretty_assertions::assert_eq;

fn lax(source: &str) -> String {
    Template::parse(source, TemplateOptions::default())
        .unwrap()
        .render(ValueMap::new())
        .unwrap()
}

#[test]
fn filter_error_renders_inline_and_continues() {
    assert_eq!(lax("a{{ 'x' | truncate: 1.5 }}b"), "aLiquid error (line 1): invalid integerb");
}

#[test]
fn error_line_numbers_are_tracked() {
    assert_eq!(lax("ok\n{{ 'x' | truncate: 1.5 }}"), "ok\nLiquid error (line 2): invalid integer");
}

#[test]
fn one_message_per_erroring_expression() {
    // A failing filter mid-pipeline produces exactly one message even when
    // more filters follow.
    let out = lax("{{ 'x' | truncate: 1.5 | upcase }}");
    assert_eq!(out.matches("Liquid error").count(), 1);
}

#[test]
fn distinct_errors_each_produce_a_message() {
    let out = lax("{{ 1 | divided_by: 0 }}|{{ 'x' | truncate: 1.5 }}");
    assert_eq!(
        out,
        "Liquid error (line 1): divided by 0|Liquid error (line 1): invalid integer"
    );
}

#[test]
fn errors_in_captures_are_not_duplicated() {
    let out = lax("{% capture c %}{{ 'x' | truncate: 1.5 }}{% endcapture %}{{ c }}");
    assert_eq!(out.matches("Liquid error").count(), 1);
}

#[test]
fn incomparable_ordering_is_a_runtime_error() {
    let out = lax("{% if 1 < 'x' %}t{% else %}f{% endif %}");
    assert!(out.starts_with("Liquid error (line 1): cannot compare"), "got {out}");
    // The comparison recovers as false.
    assert!(out.ends_with('f'), "got {out}");
}

#[test]
fn division_by_zero() {
    assert_eq!(lax("{{ 5 | divided_by: 0 }}"), "Liquid error (line 1): divided by 0");
}

#[test]
fn float_range_bound_is_invalid_integer() {
    let out = lax("{% assign f = 1.5 %}{% for i in (1..f) %}{{ i }}{% endfor %}");
    assert!(out.contains("Liquid error (line 1): invalid integer"), "got {out}");
}

#[test]
fn bad_syntax_is_inline_in_lax_mode() {
    let out = lax("a{{ | }}b");
    assert!(out.starts_with("a"));
    assert!(out.contains("Liquid error (line 1):"));
    assert!(out.ends_with('b'));
}

#[test]
fn unknown_tag_is_inline_in_lax_mode() {
    let out = lax("a{% widget %}b");
    assert!(out.contains("unknown tag `widget`"), "got {out}");
}

#[test]
fn strict_mode_propagates_with_position() {
    let mut options = TemplateOptions::default();
    options.error_mode = ErrorMode::Strict;
    let template = Template::parse("ok\n{{ 'x' | truncate: 1.5 }}", options).unwrap();
    let err = template.render(ValueMap::new()).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Filter);
    assert_eq!(err.line(), Some(2));
    assert_eq!(err.message(), "invalid integer");
}

#[test]
fn strict_mode_rejects_syntax_at_compile_time() {
    let mut options = TemplateOptions::default();
    options.error_mode = ErrorMode::Strict;
    assert!(Template::parse("{{ | }}", options).is_err());
}

#[test]
fn unclosed_blocks_fail_compilation_in_both_modes() {
    assert!(Template::parse("{% if x %}", TemplateOptions::default()).is_err());
    assert!(Template::parse("{% for i in (1..2) %}", TemplateOptions::default()).is_err());
    assert!(Template::parse("{{ unterminated", TemplateOptions::default()).is_err());
}

#[test]
fn strict_errors_in_partials_carry_the_partial_name() {
    let mut options = TemplateOptions::default();
    options.error_mode = ErrorMode::Strict;
    let partials = molten::InMemorySource::from([("p", "{{ 'x' | truncate: 1.5 }}")]);
    let template = Template::parse("{% render 'p' %}", options).unwrap();
    let err = template.render_with(ValueMap::new(), &partials).unwrap_err();
    assert_eq!(err.partial(), Some("p"));
    assert_eq!(err.line(), Some(1));
}

#[test]
fn instruction_budget_aborts_the_render() {
    let template = Template::parse("{% for i in (1..100000) %}{{ i }}{% endfor %}", TemplateOptions::default()).unwrap();
    let limits = ResourceLimits {
        max_instructions: Some(500),
        ..ResourceLimits::default()
    };
    let err = template
        .render_full(ValueMap::new(), &NoPartials, LimitedTracker::new(limits), NoopTracer)
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Resource);
}

#[test]
fn output_budget_aborts_the_render() {
    let template = Template::parse("{% for i in (1..100000) %}xxxxxxxxxx{% endfor %}", TemplateOptions::default()).unwrap();
    let limits = ResourceLimits {
        max_output_bytes: Some(64),
        ..ResourceLimits::default()
    };
    let err = template
        .render_full(ValueMap::new(), &NoPartials, LimitedTracker::new(limits), NoopTracer)
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Resource);
}

#[test]
fn resource_errors_abort_even_in_lax_mode() {
    // Unlike runtime errors, a blown budget is never rendered inline.
    let template = Template::parse("{% for i in (1..100000) %}x{% endfor %}", TemplateOptions::default()).unwrap();
    let limits = ResourceLimits {
        max_instructions: Some(100),
        ..ResourceLimits::default()
    };
    let result = template.render_full(ValueMap::new(), &NoPartials, LimitedTracker::new(limits), NoopTracer);
    assert!(result.is_err());
}

#[test]
fn unknown_filter_is_identity_in_lax_and_error_in_strict() {
    assert_eq!(lax("{{ 'v' | nonexistent }}"), "v");

    let mut options = TemplateOptions::default();
    options.strict_filters = true;
    let template = Template::parse("{{ 'v' | nonexistent }}", options).unwrap();
    let out = template.render(ValueMap::new()).unwrap();
    assert!(out.contains("unknown filter"), "got {out}");
}

#[test]
fn strict_variables_flag() {
    let mut options = TemplateOptions::default();
    options.strict_variables = true;
    let template = Template::parse("{{ ghost }}", options).unwrap();
    let out = template.render(ValueMap::new()).unwrap();
    assert!(out.contains("undefined variable `ghost`"), "got {out}");
}

#[test]
fn error_display_format() {
    let mut options = TemplateOptions::default();
    options.error_mode = ErrorMode::Strict;
    let template = Template::parse("{{ 1 | divided_by: 0 }}", options).unwrap();
    let err = template.render(ValueMap::new()).unwrap_err();
    assert_eq!(err.to_string(), "Filter error (line 1): divided by 0");
}

#[test]
fn globals_are_plain_values() {
    // Sanity: a template with no errors reports none.
    let mut globals = ValueMap::new();
    globals.insert("v".to_owned(), Value::Int(1));
    let template = Template::parse("{{ v }}", TemplateOptions::default()).unwrap();
    assert_eq!(template.render(globals).unwrap(), "1");
}

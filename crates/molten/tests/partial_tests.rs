//! `render` and `include` semantics: scope isolation, leaks, bindings and
//! error attribution inside partials.

use molten::{InMemorySource, Template, TemplateOptions, Value, ValueMap};
use pretty_assertions::assert_eq;

fn render_with(source: &str, partials: &InMemorySource, globals: ValueMap) -> String {
    Template::parse(source, TemplateOptions::default())
        .unwrap()
        .render_with(globals, partials)
        .unwrap()
}

fn globals(pairs: &[(&str, Value)]) -> ValueMap {
    pairs.iter().map(|(k, v)| ((*k).to_owned(), v.clone())).collect()
}

#[test]
fn include_sees_caller_variables() {
    let partials = InMemorySource::from([("greet", "Hi {{ name }}")]);
    let out = render_with("{% include 'greet' %}{{ name }}", &partials, globals(&[("name", Value::from("A"))]));
    assert_eq!(out, "Hi AA");
}

#[test]
fn render_does_not_see_caller_variables() {
    let partials = InMemorySource::from([("greet", "Hi {{ name }}")]);
    let out = render_with("{% render 'greet' %}{{ name }}", &partials, globals(&[("name", Value::from("A"))]));
    assert_eq!(out, "Hi A");
}

#[test]
fn include_leaks_assignments_render_does_not() {
    let partials = InMemorySource::from([("leaker", "{% assign x = 'A' %}")]);
    assert_eq!(render_with("{% render 'leaker' %}{{ x }}", &partials, ValueMap::new()), "");
    assert_eq!(render_with("{% include 'leaker' %}{{ x }}", &partials, ValueMap::new()), "A");
}

#[test]
fn with_binding_names_default_to_the_partial() {
    let partials = InMemorySource::from([("card", "[{{ card }}]")]);
    let out = render_with("{% render 'card' with item %}", &partials, globals(&[("item", Value::from("X"))]));
    assert_eq!(out, "[X]");
}

#[test]
fn with_binding_alias() {
    let partials = InMemorySource::from([("card", "[{{ thing }}]")]);
    let out = render_with(
        "{% render 'card' with item as thing %}",
        &partials,
        globals(&[("item", Value::from("X"))]),
    );
    assert_eq!(out, "[X]");
}

#[test]
fn for_binding_renders_per_item_with_forloop() {
    let partials = InMemorySource::from([("row", "{{ forloop.index }}:{{ row }};")]);
    let env = globals(&[("xs", Value::array(vec![Value::from("a"), Value::from("b")]))]);
    let out = render_with("{% render 'row' for xs %}", &partials, env);
    assert_eq!(out, "1:a;2:b;");
}

#[test]
fn include_for_does_not_publish_forloop() {
    // The outer loop's descriptor stays visible through an include-for.
    let partials = InMemorySource::from([("row", "{{ forloop.index }}:{{ row }};")]);
    let env = globals(&[("xs", Value::array(vec![Value::from("a"), Value::from("b")]))]);
    let out = render_with(
        "{% for outer in (1..1) %}{% include 'row' for xs %}{% endfor %}",
        &partials,
        env,
    );
    assert_eq!(out, "1:a;1:b;");
}

#[test]
fn keyword_arguments_bind() {
    let partials = InMemorySource::from([("card", "{{ title }}/{{ count }}")]);
    let out = render_with(
        "{% render 'card', title: 'Hello', count: 3 %}",
        &partials,
        ValueMap::new(),
    );
    assert_eq!(out, "Hello/3");
}

#[test]
fn include_shares_counters_and_cycles() {
    let partials = InMemorySource::from([("inc", "{% increment n %}")]);
    let out = render_with("{% increment n %}{% include 'inc' %}{% increment n %}", &partials, ValueMap::new());
    assert_eq!(out, "012");
}

#[test]
fn render_isolates_counters() {
    let partials = InMemorySource::from([("inc", "{% increment n %}")]);
    let out = render_with("{% increment n %}{% render 'inc' %}{% increment n %}", &partials, ValueMap::new());
    assert_eq!(out, "001");
}

#[test]
fn include_sees_outer_forloop() {
    let partials = InMemorySource::from([("x", "{{ forloop.index }}")]);
    let out = render_with("{% for i in (1..2) %}{% include 'x' %}{% endfor %}", &partials, ValueMap::new());
    assert_eq!(out, "12");
}

#[test]
fn render_does_not_see_outer_forloop() {
    let partials = InMemorySource::from([("x", "[{{ forloop.index }}]")]);
    let out = render_with("{% for i in (1..2) %}{% render 'x' %}{% endfor %}", &partials, ValueMap::new());
    assert_eq!(out, "[][]");
}

#[test]
fn break_crosses_include_but_not_render() {
    let partials = InMemorySource::from([("brk", "{% break %}")]);
    assert_eq!(
        render_with(
            "{% for i in (1..3) %}{{ i }}{% include 'brk' %}{% endfor %}",
            &partials,
            ValueMap::new()
        ),
        "1"
    );
    assert_eq!(
        render_with(
            "{% for i in (1..3) %}{{ i }}{% render 'brk' %}{% endfor %}",
            &partials,
            ValueMap::new()
        ),
        "123"
    );
}

#[test]
fn dynamic_partial_names() {
    let partials = InMemorySource::from([("a", "A"), ("b", "B")]);
    let out = render_with("{% include which %}", &partials, globals(&[("which", Value::from("b"))]));
    assert_eq!(out, "B");
}

#[test]
fn missing_partial_is_an_inline_error() {
    let partials = InMemorySource::new();
    let out = render_with("x{% include 'nope' %}y", &partials, ValueMap::new());
    assert_eq!(out, "xLiquid error (line 1): missing partial 'nope'y");
}

#[test]
fn partial_errors_are_attributed_to_the_partial() {
    // Inline error text carries the partial's name and line.
    let partials = InMemorySource::from([("p", "ok\n{{ 'x' | truncate: 1.5 }}\n")]);
    let out = render_with("{% render 'p' %}", &partials, ValueMap::new());
    assert_eq!(out, "ok\nLiquid error (p line 2): invalid integer\n");
}

#[test]
fn recursion_is_capped() {
    let partials = InMemorySource::from([("p", "x{% include 'p' %}")]);
    let limits = molten::ResourceLimits {
        max_render_depth: Some(3),
        ..molten::ResourceLimits::default()
    };
    let out = Template::parse("{% include 'p' %}", TemplateOptions::default())
        .unwrap()
        .render_full(
            ValueMap::new(),
            &partials,
            molten::LimitedTracker::new(limits),
            molten::NoopTracer,
        )
        .unwrap();
    assert_eq!(out, "xxxLiquid error (p line 1): nesting too deep");
}

#[test]
fn partials_render_into_enclosing_captures() {
    let partials = InMemorySource::from([("bit", "B")]);
    let out = render_with(
        "{% capture c %}{% render 'bit' %}{% endcapture %}[{{ c }}]",
        &partials,
        ValueMap::new(),
    );
    assert_eq!(out, "[B]");
}

#[test]
fn compile_time_partials_enable_inlining_without_changing_output() {
    let partials = InMemorySource::from([("greet", "Hi {{ name }}"), ("leaker", "{% assign x = 'A' %}")]);
    let source = "{% include 'greet' %}|{% render 'greet' %}|{% include 'leaker' %}{{ x }}";
    let env = globals(&[("name", Value::from("N"))]);

    let plain = Template::parse(source, TemplateOptions::default()).unwrap();
    let inlined = Template::parse_with_partials(source, TemplateOptions::default(), Some(&partials)).unwrap();
    assert_eq!(
        plain.render_with(env.clone(), &partials).unwrap(),
        inlined.render_with(env, &partials).unwrap()
    );
}

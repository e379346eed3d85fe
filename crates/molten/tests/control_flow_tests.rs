//! Conditionals, case dispatch, loops and interrupts.

use molten::{Template, TemplateOptions, Value, ValueMap};
use pretty_assertions::assert_eq;

fn render(source: &str, globals: ValueMap) -> String {
    Template::parse(source, TemplateOptions::default())
        .unwrap()
        .render(globals)
        .unwrap()
}

fn render_plain(source: &str) -> String {
    render(source, ValueMap::new())
}

fn globals(pairs: &[(&str, Value)]) -> ValueMap {
    pairs.iter().map(|(k, v)| ((*k).to_owned(), v.clone())).collect()
}

#[test]
fn if_elsif_else_chain() {
    let source = "{% if x == 1 %}one{% elsif x == 2 %}two{% else %}many{% endif %}";
    assert_eq!(render(source, globals(&[("x", Value::Int(1))])), "one");
    assert_eq!(render(source, globals(&[("x", Value::Int(2))])), "two");
    assert_eq!(render(source, globals(&[("x", Value::Int(5))])), "many");
}

#[test]
fn unless_negates() {
    assert_eq!(render_plain("{% unless false %}yes{% endunless %}"), "yes");
    assert_eq!(render_plain("{% unless true %}no{% else %}other{% endunless %}"), "other");
}

#[test]
fn truthiness_follows_liquid_rules() {
    // Empty strings and zero are truthy; only nil and false are falsy.
    assert_eq!(render_plain("{% if '' %}t{% endif %}"), "t");
    assert_eq!(render_plain("{% if 0 %}t{% endif %}"), "t");
    assert_eq!(render("{% if missing %}t{% else %}f{% endif %}", ValueMap::new()), "f");
}

#[test]
fn empty_and_blank_comparisons() {
    assert_eq!(render("{% if s == empty %}e{% endif %}", globals(&[("s", Value::from(""))])), "e");
    assert_eq!(render("{% if s == empty %}e{% else %}n{% endif %}", globals(&[("s", Value::from(" "))])), "n");
    assert_eq!(render("{% if s == blank %}b{% endif %}", globals(&[("s", Value::from(" \t"))])), "b");
    assert_eq!(render("{% if missing == blank %}b{% endif %}", ValueMap::new()), "b");
}

#[test]
fn boolean_operators() {
    assert_eq!(render_plain("{% if true and false %}t{% else %}f{% endif %}"), "f");
    assert_eq!(render_plain("{% if false or 'x' %}t{% endif %}"), "t");
    assert_eq!(render_plain("{% if not false %}t{% endif %}"), "t");
    // `and` binds tighter than `or`.
    assert_eq!(render_plain("{% if true or false and false %}t{% else %}f{% endif %}"), "t");
}

#[test]
fn contains_operator() {
    assert_eq!(render_plain("{% if 'hello' contains 'ell' %}y{% endif %}"), "y");
    let env = globals(&[("xs", Value::array(vec![Value::Int(1), Value::Int(2)]))]);
    assert_eq!(render("{% if xs contains 2 %}y{% endif %}", env), "y");
}

#[test]
fn case_when_dispatch() {
    let source = "{% case x %}{% when 1 %}one{% when 2, 3 %}few{% else %}many{% endcase %}";
    assert_eq!(render(source, globals(&[("x", Value::Int(1))])), "one");
    assert_eq!(render(source, globals(&[("x", Value::Int(3))])), "few");
    assert_eq!(render(source, globals(&[("x", Value::Int(9))])), "many");
}

#[test]
fn case_without_else_renders_nothing_on_miss() {
    let source = "{% case x %}{% when 1 %}one{% endcase %}";
    assert_eq!(render(source, globals(&[("x", Value::Int(9))])), "");
}

#[test]
fn for_basic_and_else() {
    assert_eq!(render_plain("{% for i in (1..3) %}{{ i }}{% endfor %}"), "123");
    assert_eq!(
        render("{% for i in xs %}{{ i }}{% else %}none{% endfor %}", ValueMap::new()),
        "none"
    );
}

#[test]
fn for_modifiers() {
    assert_eq!(render_plain("{% for i in (1..5) limit: 2 %}{{ i }}{% endfor %}"), "12");
    assert_eq!(render_plain("{% for i in (1..5) offset: 3 %}{{ i }}{% endfor %}"), "45");
    assert_eq!(render_plain("{% for i in (1..3) reversed %}{{ i }}{% endfor %}"), "321");
}

#[test]
fn for_offset_continue_resumes() {
    let source = "{% for i in (1..5) offset: 2 limit: 2 %}{{ i }}{% endfor %}\
                  |{% for i in (1..5) offset: continue %}{{ i }}{% endfor %}\
                  |{% for i in (1..5) offset: continue %}{{ i }}{% endfor %}";
    assert_eq!(render_plain(source), "34|5|");
}

#[test]
fn for_over_string_iterates_once() {
    assert_eq!(
        render("{% for x in s %}[{{ x }}]{% endfor %}", globals(&[("s", Value::from("hi"))])),
        "[hi]"
    );
}

#[test]
fn forloop_attributes() {
    assert_eq!(
        render_plain(
            "{% for i in (1..3) %}{{ forloop.index }}{{ forloop.index0 }}{{ forloop.rindex }}{{ forloop.rindex0 }}{% if forloop.first %}F{% endif %}{% if forloop.last %}L{% endif %};{% endfor %}"
        ),
        "1032F;2121;3210L;"
    );
    assert_eq!(
        render_plain("{% for i in (1..2) %}{{ forloop.length }}{% endfor %}"),
        "22"
    );
}

#[test]
fn parentloop_indices() {
    // Nested loops expose the outer descriptor through `parentloop`.
    assert_eq!(
        render_plain(
            "{% for i in (1..2) %}{% for j in (1..2) %}{{ forloop.parentloop.index }}.{{ forloop.index }} {% endfor %}{% endfor %}"
        ),
        "1.1 1.2 2.1 2.2 "
    );
}

#[test]
fn break_exits_the_loop_at_iteration_end() {
    // Interrupts are detected at the loop tail: the breaking iteration
    // finishes its body, then the loop exits.
    assert_eq!(
        render_plain("{% for i in (1..5) %}{{ i }}{% if i == 3 %}{% break %}{% endif %}{% endfor %}"),
        "123"
    );
}

#[test]
fn continue_clears_and_keeps_looping() {
    assert_eq!(
        render_plain("{% for i in (1..3) %}{{ i }}{% if i == 2 %}{% continue %}{% endif %}{% endfor %}"),
        "123"
    );
}

#[test]
fn break_only_exits_inner_loop() {
    assert_eq!(
        render_plain(
            "{% for i in (1..2) %}{% for j in (1..9) %}{{ i }}{{ j }} {% if j == 2 %}{% break %}{% endif %}{% endfor %}{% endfor %}"
        ),
        "11 12 21 22 "
    );
}

#[test]
fn break_in_capture_in_loop_exits_loop() {
    // The capture of the aborting iteration is still emitted.
    assert_eq!(
        render_plain(
            "{% for i in (1..3) %}{% capture c %}{{ i }}{% if i == 2 %}{% break %}{% endif %}{% endcapture %}{{ c }}{% endfor %}"
        ),
        "12"
    );
}

#[test]
fn interrupt_in_capture_outside_loop_is_absorbed() {
    // An orphan break inside a capture dies with the capture instead of
    // leaking into a later loop.
    assert_eq!(
        render_plain("{% capture c %}{% break %}x{% endcapture %}{% for i in (1..2) %}{{ i }}{% endfor %}"),
        "12"
    );
}

#[test]
fn loop_variable_is_scoped_to_the_loop() {
    assert_eq!(
        render_plain("{% assign i = 'outer' %}{% for i in (1..2) %}{{ i }}{% endfor %}{{ i }}"),
        "12outer"
    );
}

#[test]
fn for_over_range_with_variable_bounds() {
    assert_eq!(
        render("{% for i in (1..n) %}{{ i }}{% endfor %}", globals(&[("n", Value::Int(3))])),
        "123"
    );
}

#[test]
fn nested_loops_with_shared_collection() {
    let env = globals(&[("xs", Value::array(vec![Value::from("a"), Value::from("b")]))]);
    assert_eq!(
        render(
            "{% for x in xs %}{% for y in xs %}{{ x }}{{ y }} {% endfor %}{% endfor %}",
            env
        ),
        "aa ab ba bb "
    );
}

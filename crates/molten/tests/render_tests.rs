//! End-to-end rendering tests for outputs, assignment, captures, counters
//! and the smaller tags.

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
fn raw_text_passes_through() {
    assert_eq!(render_plain("plain text"), "plain text");
}

#[test]
fn output_conversion_rules() {
    assert_eq!(render_plain("{{ 'str' }}|{{ 42 }}|{{ 1.5 }}|{{ true }}|{{ nil }}|"), "str|42|1.5|true||");
    assert_eq!(render_plain("{{ (1..3) }}"), "1..3");
    let items = Value::array(vec![Value::Int(1), Value::from("x"), Value::Nil]);
    assert_eq!(render("{{ a }}", globals(&[("a", items)])), "1x");
}

#[test]
fn variable_paths() {
    let mut address = ValueMap::new();
    address.insert("city".to_owned(), Value::from("Ottawa"));
    let mut user = ValueMap::new();
    user.insert("address".to_owned(), Value::map(address));
    let env = globals(&[("user", Value::map(user))]);
    assert_eq!(render("{{ user.address.city }}", env.clone()), "Ottawa");
    assert_eq!(render("{{ user['address'].city }}", env.clone()), "Ottawa");
    assert_eq!(render("{{ user.address.missing }}", env), "");
}

#[test]
fn array_indexing() {
    let env = globals(&[("a", Value::array(vec![Value::Int(10), Value::Int(20), Value::Int(30)]))]);
    assert_eq!(render("{{ a[0] }}{{ a[2] }}{{ a[-1] }}{{ a[9] }}", env.clone()), "103030");
    assert_eq!(render("{{ a.size }}{{ a.first }}{{ a.last }}", env), "31030");
}

#[test]
fn string_commands() {
    assert_eq!(render_plain("{{ 'hello'.size }}"), "5");
    let env = globals(&[("s", Value::from("hey"))]);
    assert_eq!(render("{{ s.first }}{{ s.last }}", env), "hy");
}

#[test]
fn whitespace_trim_markers() {
    assert_eq!(render_plain("a \n{{- 'b' -}}\n c"), "abc");
    assert_eq!(render_plain("x\n{%- assign y = 1 -%}\ny"), "xy");
}

#[test]
fn raw_block_is_literal() {
    assert_eq!(render_plain("{% raw %}{{ not rendered }}{% endraw %}"), "{{ not rendered }}");
}

#[test]
fn comment_block_renders_nothing() {
    assert_eq!(render_plain("a{% comment %}ignored {{ x }}{% endcomment %}b"), "ab");
    assert_eq!(render_plain("a{% # inline note %}b"), "ab");
}

#[test]
fn assign_and_echo() {
    assert_eq!(render_plain("{% assign x = 'v' %}{{ x }}"), "v");
    assert_eq!(render_plain("{% assign n = 2 | plus: 3 %}{{ n }}"), "5");
    assert_eq!(render_plain("{% echo 'direct' %}"), "direct");
}

#[test]
fn capture_binds_rendered_body() {
    assert_eq!(
        render_plain("{% capture greeting %}Hi {{ 'there' | upcase }}{% endcapture %}[{{ greeting }}]"),
        "[Hi THERE]"
    );
}

#[test]
fn captured_output_is_diverted() {
    // Nothing inside the capture reaches the main output directly.
    assert_eq!(render_plain("a{% capture c %}hidden{% endcapture %}b"), "ab");
}

#[test]
fn increment_and_decrement() {
    assert_eq!(render_plain("{% increment c %}{% increment c %}{% decrement c %}"), "011");
    // Counters are a namespace of their own, separate from assigns.
    assert_eq!(render_plain("{% assign c = 99 %}{% increment c %}{{ c }}"), "099");
}

#[test]
fn cycle_advances_per_position() {
    assert_eq!(
        render_plain("{% for i in (1..5) %}{% cycle 'a', 'b', 'c' %}{% endfor %}"),
        "abcab"
    );
}

#[test]
fn cycle_groups_share_state() {
    assert_eq!(
        render_plain("{% for i in (1..4) %}{% cycle 'g': '1', '2' %}{% endfor %}"),
        "1212"
    );
}

#[test]
fn ifchanged_suppresses_repeats() {
    let env = globals(&[(
        "xs",
        Value::array(vec![Value::Int(1), Value::Int(1), Value::Int(2), Value::Int(2), Value::Int(3)]),
    )]);
    assert_eq!(
        render("{% for x in xs %}{% ifchanged %}{{ x }}{% endifchanged %}{% endfor %}", env),
        "123"
    );
}

#[test]
fn liquid_tag_shorthand() {
    assert_eq!(render_plain("{% liquid\nassign x = 3\necho x\n%}"), "3");
}

#[test]
fn tablerow_markup() {
    assert_eq!(
        render_plain("{% tablerow i in (1..4) cols: 2 %}{{ i }}{% endtablerow %}"),
        "<tr class=\"row1\">\n<td class=\"col1\">1</td><td class=\"col2\">2</td></tr>\n<tr class=\"row2\"><td class=\"col1\">3</td><td class=\"col2\">4</td></tr>\n"
    );
}

#[test]
fn tablerow_empty_collection_still_emits_row() {
    assert_eq!(
        render("{% tablerow i in xs %}{{ i }}{% endtablerow %}", ValueMap::new()),
        "<tr class=\"row1\">\n</tr>\n"
    );
}

#[test]
fn tablerowloop_attributes() {
    assert_eq!(
        render_plain("{% tablerow i in (1..2) cols: 2 %}{{ tablerowloop.col }}{% endtablerow %}"),
        "<tr class=\"row1\">\n<td class=\"col1\">1</td><td class=\"col2\">2</td></tr>\n"
    );
}

#[test]
fn drop_objects_index_and_iterate() {
    let drop = molten::FnDrop::new("settings")
        .with_index(|key| match key.as_str() {
            Some("color") => Some(Value::from("teal")),
            _ => None,
        })
        .into_value();
    assert_eq!(render("{{ settings.color }}/{{ settings.nope }}", globals(&[("settings", drop)])), "teal/");

    let seq = molten::FnDrop::new("seq")
        .with_iterate(|| vec![Value::Int(7), Value::Int(8)])
        .into_value();
    assert_eq!(render("{% for x in seq %}{{ x }}{% endfor %}", globals(&[("seq", seq)])), "78");
}

#[test]
fn hash_iteration_yields_pairs() {
    let mut map = ValueMap::new();
    map.insert("a".to_owned(), Value::Int(1));
    map.insert("b".to_owned(), Value::Int(2));
    assert_eq!(
        render(
            "{% for pair in h %}{{ pair[0] }}={{ pair[1] }};{% endfor %}",
            globals(&[("h", Value::map(map))])
        ),
        "a=1;b=2;"
    );
}

#[test]
fn templates_are_shareable_across_threads() {
    let template = std::sync::Arc::new(Template::parse("{{ n | times: 2 }}", TemplateOptions::default()).unwrap());
    let handles: Vec<_> = (0..4)
        .map(|i| {
            let template = template.clone();
            std::thread::spawn(move || {
                let env: ValueMap = [("n".to_owned(), Value::Int(i))].into_iter().collect();
                template.render(env).unwrap()
            })
        })
        .collect();
    let results: Vec<String> = handles.into_iter().map(|h| h.join().unwrap()).collect();
    assert_eq!(results, vec!["0", "2", "4", "6"]);
}

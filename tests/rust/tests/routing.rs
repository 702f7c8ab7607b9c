//! Routing laws: prefix round trips, resolution, description compaction.

use pretty_assertions::assert_eq;

use mcpgate_core::domain::{Annotated, ToolInfo};
use mcpgate_core::routing::{
    compact_description, normalize_prefix, parse_prefixed_name, prefix_name, resolve_tool,
    MAX_COMPACT_DESCRIPTION,
};

fn tool(server: &str, name: &str) -> Annotated<ToolInfo> {
    Annotated::new(
        format!("id-{}", normalize_prefix(server)),
        server,
        ToolInfo {
            name: name.to_string(),
            description: None,
            input_schema: None,
        },
    )
}

#[test]
fn round_trip_law_holds_for_separator_free_originals() {
    for (server, original) in [
        ("GitHub", "search_code"),
        ("Foo Bar", "do-thing"),
        ("a1", "x"),
        ("Files (local)", "read_file"),
    ] {
        let prefixed = prefix_name(server, original);
        let (prefix, rest) = parse_prefixed_name(&prefixed).unwrap();
        assert_eq!(prefix, normalize_prefix(server));
        assert_eq!(rest, original);
    }
}

#[test]
fn resolution_inverts_prefixing() {
    let tools = vec![
        tool("GitHub", "search"),
        tool("Files", "search"),
        tool("Files", "write"),
    ];

    for t in &tools {
        let prefixed = prefix_name(&t.server_name, &t.item.name);
        let resolved = resolve_tool(&tools, &prefixed).unwrap();
        assert_eq!(resolved.server_name, t.server_name);
        assert_eq!(resolved.item.name, t.item.name);
    }
}

#[test]
fn unresolvable_names_return_none() {
    let tools = vec![tool("GitHub", "search")];
    assert!(resolve_tool(&tools, "gitlab__search").is_none());
    assert!(resolve_tool(&tools, "github__missing").is_none());
    assert!(resolve_tool(&tools, "github_search").is_none());
    assert!(resolve_tool(&tools, "__search").is_none());
}

#[test]
fn normalized_prefixes_never_contain_the_separator() {
    for name in ["a__b", "a - b", "--a--", "A!!B", "tool__kit v2"] {
        let prefix = normalize_prefix(name);
        assert!(
            !prefix.contains("__"),
            "{name:?} normalized to {prefix:?} which contains the separator"
        );
    }
}

#[test]
fn compaction_is_identity_up_to_the_window() {
    for len in [0, 1, 60, MAX_COMPACT_DESCRIPTION] {
        let s = "a".repeat(len);
        assert_eq!(compact_description(&s), s);
    }
}

#[test]
fn compaction_bounds_and_marks_long_descriptions() {
    let long = "lorem ipsum dolor sit amet ".repeat(20);
    let out = compact_description(&long);
    assert!(out.chars().count() <= MAX_COMPACT_DESCRIPTION);
    assert!(out.ends_with('…'));
}

#[test]
fn compaction_handles_multibyte_text() {
    let long = "日本語のツール説明 ".repeat(30);
    let out = compact_description(&long);
    assert!(out.chars().count() <= MAX_COMPACT_DESCRIPTION);
    assert!(out.ends_with('…'));
}

//! Prefixed-name routing.
//!
//! Upstream tools and prompts are re-exposed downstream as
//! `<prefix>__<original>`, where the prefix is derived from the server
//! name. Resources keep their URIs (already schema-qualified). Everything
//! here is a pure function over snapshots.

use crate::domain::{AggregatedPrompt, AggregatedTool};

/// Separator between the server prefix and the original name.
pub const SEPARATOR: &str = "__";

/// Maximum length of a compacted description, ellipsis included.
pub const MAX_COMPACT_DESCRIPTION: usize = 120;

/// Derive the routing prefix from a server name: lower-case, every run of
/// non-alphanumeric characters collapsed to a single `_`, outer `_`
/// trimmed. An empty result means the name is unusable as a prefix; the
/// store rejects such names at creation time.
pub fn normalize_prefix(name: &str) -> String {
    let mut out = String::with_capacity(name.len());
    let mut pending_sep = false;
    for c in name.chars() {
        if c.is_alphanumeric() {
            if pending_sep && !out.is_empty() {
                out.push('_');
            }
            pending_sep = false;
            out.extend(c.to_lowercase());
        } else {
            pending_sep = true;
        }
    }
    out
}

/// Build the downstream-visible name for an upstream tool or prompt.
pub fn prefix_name(server_name: &str, original: &str) -> String {
    format!("{}{}{}", normalize_prefix(server_name), SEPARATOR, original)
}

/// Split a prefixed name at the first separator. Returns `None` when no
/// separator is present.
pub fn parse_prefixed_name(prefixed: &str) -> Option<(&str, &str)> {
    prefixed
        .split_once(SEPARATOR)
        .filter(|(prefix, rest)| !prefix.is_empty() && !rest.is_empty())
}

/// Resolve a prefixed tool name against an aggregated snapshot.
///
/// Normalized prefixes are unique per registered server (store invariant),
/// so the first match is the only match.
pub fn resolve_tool<'a>(
    tools: &'a [AggregatedTool],
    prefixed: &str,
) -> Option<&'a AggregatedTool> {
    let (prefix, original) = parse_prefixed_name(prefixed)?;
    tools
        .iter()
        .find(|t| t.item.name == original && normalize_prefix(&t.server_name) == prefix)
}

/// Resolve a prefixed prompt name against an aggregated snapshot.
pub fn resolve_prompt<'a>(
    prompts: &'a [AggregatedPrompt],
    prefixed: &str,
) -> Option<&'a AggregatedPrompt> {
    let (prefix, original) = parse_prefixed_name(prefixed)?;
    prompts
        .iter()
        .find(|p| p.item.name == original && normalize_prefix(&p.server_name) == prefix)
}

/// Compact a description for `tools/list`: at most
/// [`MAX_COMPACT_DESCRIPTION`] characters, cutting at the last whitespace
/// within the final 40% of the window when one exists, with a single `…`
/// marking the cut.
pub fn compact_description(description: &str) -> String {
    let chars: Vec<char> = description.chars().collect();
    if chars.len() <= MAX_COMPACT_DESCRIPTION {
        return description.to_string();
    }

    let window = MAX_COMPACT_DESCRIPTION - 1; // leave room for the ellipsis
    let floor = MAX_COMPACT_DESCRIPTION * 6 / 10;
    let cut = chars[floor..window]
        .iter()
        .rposition(|c| c.is_whitespace())
        .map(|i| floor + i)
        .unwrap_or(window);

    let mut out: String = chars[..cut].iter().collect();
    out.truncate(out.trim_end().len());
    out.push('…');
    out
}

/// Prefix a description with its owning server for provenance.
pub fn annotate_description(server_name: &str, description: Option<&str>) -> String {
    match description {
        Some(d) if !d.is_empty() => format!("[{server_name}] {d}"),
        _ => format!("[{server_name}]"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{Annotated, ToolInfo};

    fn tool(server: &str, name: &str) -> AggregatedTool {
        Annotated::new(
            format!("id-{server}"),
            server,
            ToolInfo {
                name: name.to_string(),
                description: None,
                input_schema: None,
            },
        )
    }

    #[test]
    fn normalize_collapses_symbol_runs() {
        assert_eq!(normalize_prefix("Foo Bar"), "foo_bar");
        assert_eq!(normalize_prefix("Foo-Bar"), "foo_bar");
        assert_eq!(normalize_prefix("  Foo -- Bar!! "), "foo_bar");
        assert_eq!(normalize_prefix("example.com/v1"), "example_com_v1");
        assert_eq!(normalize_prefix("@@@"), "");
    }

    #[test]
    fn prefix_round_trip() {
        // Normalized prefixes collapse runs to a single `_`, so the first
        // `__` is always the separator.
        let prefixed = prefix_name("My Server", "do_thing");
        assert_eq!(prefixed, "my_server__do_thing");
        let (prefix, original) = parse_prefixed_name(&prefixed).unwrap();
        assert_eq!(prefix, "my_server");
        assert_eq!(original, "do_thing");
    }

    #[test]
    fn original_containing_separator_still_splits_first() {
        let prefixed = prefix_name("fs", "a__b");
        let (prefix, original) = parse_prefixed_name(&prefixed).unwrap();
        assert_eq!(prefix, "fs");
        assert_eq!(original, "a__b");
    }

    #[test]
    fn resolve_scans_by_normalized_prefix() {
        let tools = vec![tool("GitHub", "search"), tool("Files", "search")];
        let hit = resolve_tool(&tools, "github__search").unwrap();
        assert_eq!(hit.server_name, "GitHub");
        assert!(resolve_tool(&tools, "gitlab__search").is_none());
        assert!(resolve_tool(&tools, "no_separator").is_none());
    }

    #[test]
    fn short_description_unchanged() {
        let d = "short enough";
        assert_eq!(compact_description(d), d);
        let exactly: String = "x".repeat(MAX_COMPACT_DESCRIPTION);
        assert_eq!(compact_description(&exactly), exactly);
    }

    #[test]
    fn long_description_cut_at_whitespace() {
        let d = format!("{} tail words here", "word ".repeat(40));
        let out = compact_description(&d);
        assert!(out.chars().count() <= MAX_COMPACT_DESCRIPTION);
        assert!(out.ends_with('…'));
        // cut lands on a word boundary, so no split word before the ellipsis
        let before = out.trim_end_matches('…');
        assert!(before.ends_with("word") || before.ends_with(' ') || !before.contains(' '));
    }

    #[test]
    fn long_unbroken_description_hard_cut() {
        let d = "x".repeat(500);
        let out = compact_description(&d);
        assert_eq!(out.chars().count(), MAX_COMPACT_DESCRIPTION);
        assert!(out.ends_with('…'));
    }

    #[test]
    fn annotation_carries_server_name() {
        assert_eq!(
            annotate_description("GitHub", Some("Search code")),
            "[GitHub] Search code"
        );
        assert_eq!(annotate_description("GitHub", None), "[GitHub]");
    }
}

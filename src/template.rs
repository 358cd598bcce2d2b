//! Variable substitution.
//!
//! Replaces `{{name}}` and `{name}` placeholders in message templates with
//! values from a flat key/value context. Unknown placeholders are left in
//! place, which makes substitution idempotent: re-applying the same context
//! to an already-rendered string is a no-op.

use regex::Regex;
use std::collections::HashMap;
use std::sync::OnceLock;

/// Both placeholder styles in one pattern. The double-brace alternative is
/// listed first so `{{name}}` is consumed whole and its inner braces are
/// never visible to the single-brace alternative.
fn placeholder_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"\{\{(\w+)\}\}|\{(\w+)\}").unwrap())
}

/// Render a template against a flat variable map.
pub fn substitute(template: &str, vars: &HashMap<String, String>) -> String {
    placeholder_re()
        .replace_all(template, |caps: &regex::Captures<'_>| {
            let key = caps
                .get(1)
                .or_else(|| caps.get(2))
                .map(|m| m.as_str())
                .unwrap_or_default();
            match vars.get(key) {
                Some(value) => value.clone(),
                None => caps[0].to_string(),
            }
        })
        .into_owned()
}

/// Render an optional template, passing `None` through.
pub fn substitute_opt(template: Option<&str>, vars: &HashMap<String, String>) -> Option<String> {
    template.map(|t| substitute(t, vars))
}

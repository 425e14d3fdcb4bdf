//! Placeholder syntax: `(( path.to.value ))`, optionally `(( grab path.to.value ))`.

use std::sync::LazyLock;

use regex::Regex;

static PLACEHOLDER_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\(\(\s*(?:grab\s+)?([A-Za-z0-9_/-]+(?:\.[A-Za-z0-9_/-]+)*)\s*\)\)")
        .expect("valid regex")
});

/// How a string scalar relates to placeholders.
#[derive(Debug, PartialEq, Eq)]
pub enum Template<'a> {
    /// No placeholder at all.
    Plain,
    /// The whole string is one placeholder; the value replaces it with its type.
    Whole(&'a str),
    /// Placeholders embedded in text; values are rendered into the string.
    Interpolated(Vec<Part<'a>>),
}

#[derive(Debug, PartialEq, Eq)]
pub enum Part<'a> {
    Text(&'a str),
    Reference(&'a str),
}

pub fn parse(s: &str) -> Template<'_> {
    let mut parts = Vec::new();
    let mut last = 0;

    for caps in PLACEHOLDER_RE.captures_iter(s) {
        let (Some(whole), Some(path)) = (caps.get(0), caps.get(1)) else {
            continue;
        };
        if whole.start() == 0 && whole.end() == s.len() {
            return Template::Whole(path.as_str());
        }
        if whole.start() > last {
            parts.push(Part::Text(&s[last..whole.start()]));
        }
        parts.push(Part::Reference(path.as_str()));
        last = whole.end();
    }

    if parts.is_empty() {
        return Template::Plain;
    }
    if last < s.len() {
        parts.push(Part::Text(&s[last..]));
    }
    Template::Interpolated(parts)
}

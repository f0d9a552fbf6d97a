//! Repairs on converter-rendered comment spans.
//!
//! Both passes work on rendered `[...]{.comment-start ...}` /
//! `[]{.comment-end ...}` text and never look at prose. Spans written
//! inside code are examples and stay as they are.

use std::collections::{BTreeMap, BTreeSet};

use once_cell::sync::Lazy;
use regex::Regex;

use super::code::{map_prose, mask_code};
use super::grammar::{parse_span_attrs, Edge};

static SPAN_ATTRS_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"\{\.comment-(?P<edge>start|end)(?P<attrs>[^}]*)\}").expect("span attrs regex")
});

static NESTED_END_WRAPPER_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r"\[(?P<inner>(?:\s*\[\]\{\.comment-end[^}]*\}\s*)+)\]\{\.comment-end(?P<attrs>[^}]*)\}",
    )
    .expect("nested end wrapper regex")
});

/// Rendered comment span attribute blocks, in text order.
pub(crate) fn span_blocks(text: &str) -> Vec<(String, Edge, usize, usize)> {
    SPAN_ATTRS_RE
        .captures_iter(text)
        .filter_map(|caps| {
            let whole = caps.get(0)?;
            let edge = if &caps["edge"] == "start" {
                Edge::Start
            } else {
                Edge::End
            };
            let id = parse_span_attrs(&caps["attrs"]).remove("id")?;
            Some((id, edge, whole.start(), whole.end()))
        })
        .collect()
}

/// Insert an END for every START that has none. It goes after the last END
/// of the comment's replies when there is one, else right after the START.
pub fn insert_missing_ends<F>(text: &str, parent_of: F) -> (String, usize)
where
    F: Fn(&str) -> Option<String>,
{
    let blocks = span_blocks(&mask_code(text));
    let mut first_start: BTreeMap<&str, usize> = BTreeMap::new();
    let mut last_end: BTreeMap<&str, usize> = BTreeMap::new();
    let mut ended: BTreeSet<&str> = BTreeSet::new();
    for (id, edge, _, end) in &blocks {
        match edge {
            Edge::Start => {
                first_start.entry(id.as_str()).or_insert(*end);
            }
            Edge::End => {
                ended.insert(id.as_str());
                last_end.insert(id.as_str(), *end);
            }
        }
    }

    let descends_from = |id: &str, root: &str| {
        let mut current = id.to_string();
        for _ in 0..64 {
            match parent_of(&current) {
                Some(p) if p == root => return true,
                Some(p) => current = p,
                None => return false,
            }
        }
        false
    };

    let mut inserts: Vec<(usize, String)> = Vec::new();
    for (&id, &after_start) in &first_start {
        if ended.contains(id) {
            continue;
        }
        let at = last_end
            .iter()
            .filter(|(other, _)| descends_from(**other, id))
            .map(|(_, &pos)| pos)
            .max()
            .unwrap_or(after_start);
        tracing::debug!(comment = %id, at, "restoring dropped END span");
        inserts.push((at, format!("[]{{.comment-end id=\"{id}\"}}")));
    }

    let count = inserts.len();
    let mut out = text.to_string();
    inserts.sort_by(|a, b| b.0.cmp(&a.0));
    for (at, span) in inserts {
        out.insert_str(at, &span);
    }
    (out, count)
}

/// Unwrap END spans the writer nested inside another END span's brackets.
pub fn flatten_nested_ends(text: &str) -> (String, usize) {
    let mut total = 0;
    let out = map_prose(text, |prose| {
        let mut out = prose.to_string();
        loop {
            let mut n = 0;
            let next = NESTED_END_WRAPPER_RE
                .replace_all(&out, |caps: &regex::Captures<'_>| {
                    n += 1;
                    format!("{}[]{{.comment-end{}}}", caps["inner"].trim(), &caps["attrs"])
                })
                .into_owned();
            if n == 0 {
                break out;
            }
            total += n;
            out = next;
        }
    });
    (out, total)
}

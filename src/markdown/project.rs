//! Comment model -> Markdown projection.
//!
//! Root comment spans become milestone tokens, reply spans disappear, and each
//! thread is rendered as one nested card quote placed right after the
//! top-level block that closes the root's range.

use std::collections::{BTreeMap, BTreeSet};

use anyhow::Context;
use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::Value;

use super::ast::{block_quote, blocks_mut, comment_span, raw_block, raw_inline, walk_inline_lists};
use super::grammar::{milestone_token, CardHeader, CardKind, CardMeta, Edge};
use crate::model::{Comment, CommentModel};

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Projection {
    /// Milestone tokens written into the prose.
    pub milestones: usize,
    /// Reply spans dropped from the prose.
    pub reply_spans: usize,
    /// Thread cards inserted.
    pub cards: usize,
    /// Roots without any span in the prose; their cards go to the end.
    pub unanchored: Vec<String>,
}

#[derive(Default)]
struct Placement {
    first_start: Option<usize>,
    last_end: Option<usize>,
}

pub fn project(doc: &mut Value, model: &CommentModel, wrap: bool) -> anyhow::Result<Projection> {
    let blocks = blocks_mut(doc).context("document tree has no block list")?;
    let mut out = Projection::default();
    let mut placement: BTreeMap<String, Placement> = BTreeMap::new();
    let mut start_order: Vec<String> = Vec::new();

    for (idx, block) in blocks.iter_mut().enumerate() {
        walk_inline_lists(std::slice::from_mut(block), &mut |list: &mut Vec<Value>| {
            let mut rebuilt = Vec::with_capacity(list.len());
            for node in list.drain(..) {
                let Some((edge, id, _)) = comment_span(&node) else {
                    rebuilt.push(node);
                    continue;
                };
                match model.get(&id) {
                    Some(c) if !c.is_root() => {
                        out.reply_spans += 1;
                        continue;
                    }
                    Some(_) => {}
                    None => tracing::warn!(comment = %id, "span has no comment in the package"),
                }
                let slot = placement.entry(id.clone()).or_default();
                match edge {
                    Edge::Start => {
                        slot.first_start.get_or_insert(idx);
                        if !start_order.contains(&id) {
                            start_order.push(id.clone());
                        }
                    }
                    Edge::End => slot.last_end = Some(idx),
                }
                rebuilt.push(raw_inline("markdown", &milestone_token(&id, edge, wrap)));
                out.milestones += 1;
            }
            *list = rebuilt;
        });
    }

    let mut roots: Vec<&Comment> = start_order.iter().filter_map(|id| model.get(id)).collect();
    for root in model.roots() {
        if !start_order.contains(&root.id) {
            tracing::warn!(comment = %root.id, "root comment has no range in the prose; card goes to the end");
            out.unanchored.push(root.id.clone());
            roots.push(root);
        }
    }

    let mut after: BTreeMap<usize, Vec<Value>> = BTreeMap::new();
    let mut trailing = Vec::new();
    let mut seen = BTreeSet::new();
    for root in roots {
        if !seen.insert(root.id.clone()) {
            continue;
        }
        let card = card_block(model, root, &mut seen);
        out.cards += 1;
        let at = placement
            .get(&root.id)
            .and_then(|p| p.last_end.or(p.first_start));
        match at {
            Some(idx) => after.entry(idx).or_default().push(card),
            None => trailing.push(card),
        }
    }

    let old = std::mem::take(blocks);
    for (idx, block) in old.into_iter().enumerate() {
        blocks.push(block);
        if let Some(cards) = after.remove(&idx) {
            blocks.extend(cards);
        }
    }
    blocks.extend(trailing);
    Ok(out)
}

/// Card quote for `comment` with its replies nested inside, in model order.
fn card_block(model: &CommentModel, comment: &Comment, seen: &mut BTreeSet<String>) -> Value {
    let header = CardHeader {
        kind: if comment.is_root() {
            CardKind::Comment
        } else {
            CardKind::Reply
        },
        id: comment.id.clone(),
        author: comment.author.clone(),
        state: comment.state,
    };
    let meta = CardMeta::for_comment(comment, model.presence_of(comment));
    let mut blocks = vec![
        raw_block("markdown", &header.render()),
        raw_block("html", &meta.render(&comment.id)),
    ];
    let body = card_body(comment);
    if !body.is_empty() {
        blocks.push(raw_block("markdown", &body));
    }
    for reply in model.replies_of(&comment.id) {
        if seen.insert(reply.id.clone()) {
            blocks.push(card_block(model, reply, seen));
        }
    }
    block_quote(blocks)
}

/// Paragraphs separated by blank lines; manual breaks as backslash-newline.
/// Lists, rules, headings and fences are written as they are.
fn card_body(comment: &Comment) -> String {
    static BLOCK_SYNTAX_RE: Lazy<Regex> = Lazy::new(|| {
        Regex::new(r"^\s*(?:[-*+]\s|\(?\d+[.)]\s|#{1,6}\s|---\s*$|```)").expect("block syntax regex")
    });
    comment
        .body
        .iter()
        .map(|p| {
            if p.lines().any(|l| BLOCK_SYNTAX_RE.is_match(l)) {
                p.clone()
            } else {
                p.replace('\n', "\\\n")
            }
        })
        .collect::<Vec<_>>()
        .join("\n\n")
}

/// Quote depth and the rest of a line.
fn quote_prefix(line: &str) -> (usize, &str) {
    let mut depth = 0;
    let mut rest = line;
    loop {
        let trimmed = rest.trim_start_matches([' ', '\t']);
        match trimmed.strip_prefix('>') {
            Some(after) => {
                depth += 1;
                rest = after.strip_prefix(' ').unwrap_or(after);
            }
            None => return (depth, trimmed.trim_end()),
        }
    }
}

/// Pull the card header, metadata and first body line of each rendered card
/// together by removing the blank quote lines the writer puts between them.
pub fn normalize_card_layout(text: &str) -> String {
    let lines: Vec<&str> = text.split('\n').collect();
    let mut out: Vec<&str> = Vec::with_capacity(lines.len());
    let mut i = 0;
    while i < lines.len() {
        out.push(lines[i]);
        let (depth, rest) = quote_prefix(lines[i]);
        let is_header = CardHeader::parse(rest).is_some();
        let is_meta = rest.starts_with("<!--") && CardMeta::parse(rest).is_some();
        if depth > 0 && (is_header || is_meta) && i + 2 < lines.len() {
            let (gap_depth, gap) = quote_prefix(lines[i + 1]);
            let (next_depth, next) = quote_prefix(lines[i + 2]);
            let joins = if is_header {
                next.starts_with("<!--") && CardMeta::parse(next).is_some()
            } else {
                !next.is_empty() && CardHeader::parse(next).is_none()
            };
            if gap.is_empty() && gap_depth == depth && next_depth == depth && joins {
                i += 2;
                continue;
            }
        }
        i += 1;
    }
    out.join("\n")
}

//! Marker integrity checks on Markdown text.
//!
//! Runs before anything is written. Code spans and fenced/indented code are
//! masked first so examples of the marker syntax are never counted, and card
//! quotes are masked for the marker tallies since their bodies are comment text.

use std::collections::{BTreeMap, BTreeSet};

use once_cell::sync::Lazy;
use regex::Regex;

use super::code::{blank_ranges, card_ranges, mask_code};
use super::extract::Extraction;
use super::grammar::{canonical_marker_id, find_milestones, CardKind, Edge, CARD_META_RE, COMMENT_ID_PATTERN};
use super::repair::span_blocks;
use crate::error::{MarkerIssue, TextLocation, ValidationFailure};
use crate::model::CommentModel;

static CARD_HEADER_AT_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(&format!(r"(?i)\[!\s*(?:COMMENT|REPLY)\s+(?P<id>{COMMENT_ID_PATTERN})\s*:"))
        .expect("card header locator regex")
});

/// Code blanked for locating cards; code and card quotes blanked for markers.
fn masks(text: &str) -> (String, String) {
    let masked = mask_code(text);
    let prose = blank_ranges(&masked, &card_ranges(&masked));
    (masked, prose)
}

#[derive(Clone, Debug)]
struct Marker {
    id: String,
    edge: Edge,
    offset: usize,
    at: TextLocation,
}

#[derive(Default)]
struct Tally {
    starts: Vec<Marker>,
    ends: Vec<Marker>,
}

/// Milestones and hand-written spans in `text`, in text order.
fn markers(text: &str, masked: &str, declared: &BTreeSet<String>, issues: &mut Vec<MarkerIssue>) -> Vec<Marker> {
    let mut out = Vec::new();
    for m in find_milestones(masked) {
        let id = canonical_marker_id(&m.raw_id, |id| declared.contains(id));
        let at = TextLocation::at_offset(text, m.core_start);
        if m.wrap.is_one_sided() {
            issues.push(MarkerIssue::MalformedMarker {
                id: id.clone(),
                edge: m.edge,
                at,
            });
        }
        out.push(Marker {
            id,
            edge: m.edge,
            offset: m.start,
            at,
        });
    }
    for (id, edge, start, _) in span_blocks(masked) {
        out.push(Marker {
            id,
            edge,
            offset: start,
            at: TextLocation::at_offset(text, start),
        });
    }
    out.sort_by_key(|m| m.offset);
    out
}

fn tally(markers: Vec<Marker>) -> BTreeMap<String, Tally> {
    let mut by_id: BTreeMap<String, Tally> = BTreeMap::new();
    for m in markers {
        let slot = by_id.entry(m.id.clone()).or_default();
        match m.edge {
            Edge::Start => slot.starts.push(m),
            Edge::End => slot.ends.push(m),
        }
    }
    by_id
}

fn balance_issues(by_id: &BTreeMap<String, Tally>, detail_suffix: &str, issues: &mut Vec<MarkerIssue>) {
    for (id, t) in by_id {
        if t.starts.len() > 1 {
            issues.push(MarkerIssue::DuplicateCommentId {
                id: id.clone(),
                starts: t.starts.iter().map(|m| m.at).collect(),
            });
        }
        if t.starts.len() > t.ends.len() {
            for m in &t.starts[t.ends.len()..] {
                issues.push(MarkerIssue::UnbalancedMarker {
                    id: id.clone(),
                    edge: Edge::Start,
                    at: m.at,
                    partner: t.ends.last().map(|e| e.at),
                    detail: format!("has no matching END{detail_suffix}"),
                });
            }
        } else if t.ends.len() > t.starts.len() {
            for m in &t.ends[t.starts.len()..] {
                issues.push(MarkerIssue::UnbalancedMarker {
                    id: id.clone(),
                    edge: Edge::End,
                    at: m.at,
                    partner: t.starts.last().map(|s| s.at),
                    detail: format!("has no matching START{detail_suffix}"),
                });
            }
        } else if let (Some(s), Some(e)) = (t.starts.first(), t.ends.first()) {
            if e.offset < s.offset {
                issues.push(MarkerIssue::UnbalancedMarker {
                    id: id.clone(),
                    edge: Edge::End,
                    at: e.at,
                    partner: Some(s.at),
                    detail: format!("comes before its START{detail_suffix}"),
                });
            }
        }
    }
}

/// First card location per id: the metadata line, else the header.
fn card_locations(text: &str, masked: &str) -> BTreeMap<String, TextLocation> {
    let mut out = BTreeMap::new();
    for caps in CARD_META_RE.captures_iter(masked) {
        if let Some(m) = caps.get(0) {
            out.entry(caps["id"].to_string())
                .or_insert_with(|| TextLocation::at_offset(text, m.start()));
        }
    }
    for caps in CARD_HEADER_AT_RE.captures_iter(masked) {
        if let Some(m) = caps.get(0) {
            out.entry(caps["id"].to_string())
                .or_insert_with(|| TextLocation::at_offset(text, m.start()));
        }
    }
    out
}

/// Check the source Markdown and the converter's normalised rendering of it.
pub fn validate_markdown(
    label: &str,
    source: &str,
    normalized: &str,
    extraction: &Extraction,
) -> Result<(), ValidationFailure> {
    let (masked, prose) = masks(source);
    let declared: BTreeSet<String> = extraction.cards.iter().map(|c| c.id.clone()).collect();
    let mut issues = Vec::new();

    let by_id = tally(markers(source, &prose, &declared, &mut issues));
    balance_issues(&by_id, "", &mut issues);
    let flagged: BTreeSet<String> = by_id
        .iter()
        .filter(|(_, t)| t.starts.len() != t.ends.len() || t.starts.len() > 1)
        .map(|(id, _)| id.clone())
        .collect();

    let card_at = card_locations(source, &masked);
    let genuine = extraction.genuine_ids();
    for card in &extraction.cards {
        let at = card_at.get(&card.id).copied();
        let parent = extraction.parent_of(&card.id, &genuine);
        if parent.is_none() && card.kind == CardKind::Comment && !by_id.contains_key(&card.id) {
            issues.push(MarkerIssue::UnanchoredCard {
                id: card.id.clone(),
                at: at.unwrap_or(TextLocation { line: 1, col: 1 }),
            });
        }
    }

    let mut parents: BTreeMap<String, String> = BTreeMap::new();
    for id in &genuine {
        let Some(parent) = extraction.parent_of(id, &genuine) else {
            continue;
        };
        if genuine.contains(&parent) {
            parents.insert(id.clone(), parent);
        } else {
            issues.push(MarkerIssue::MissingParentId {
                child: id.clone(),
                parent,
                at: card_at.get(id).copied(),
            });
        }
    }
    issues.extend(cycles(&parents));

    let (_, prose_norm) = masks(normalized);
    let norm = tally(markers(normalized, &prose_norm, &declared, &mut Vec::new()));
    let mut late = Vec::new();
    balance_issues(&norm, " after normalization", &mut late);
    issues.extend(late.into_iter().filter(|i| {
        !flagged.contains(i.comment_id()) && !matches!(i, MarkerIssue::DuplicateCommentId { .. })
    }));

    if issues.is_empty() {
        Ok(())
    } else {
        Err(ValidationFailure {
            source: label.to_string(),
            issues,
        })
    }
}

/// One issue per distinct parent loop, self-references included.
fn cycles(parents: &BTreeMap<String, String>) -> Vec<MarkerIssue> {
    let mut reported: BTreeSet<BTreeSet<String>> = BTreeSet::new();
    let mut out = Vec::new();
    for start in parents.keys() {
        let mut chain = vec![start.clone()];
        let mut current = start;
        while let Some(parent) = parents.get(current) {
            if let Some(pos) = chain.iter().position(|id| id == parent) {
                let mut cycle = chain[pos..].to_vec();
                let members: BTreeSet<String> = cycle.iter().cloned().collect();
                cycle.push(parent.clone());
                if reported.insert(members) {
                    out.push(MarkerIssue::ThreadCycle { chain: cycle });
                }
                break;
            }
            chain.push(parent.clone());
            current = parent;
        }
    }
    out
}

/// Check projected Markdown: every root comment has one START and one END
/// in the prose and every milestone is well formed.
pub fn check_projection(label: &str, text: &str, model: &CommentModel) -> Result<(), ValidationFailure> {
    let (masked, prose) = masks(text);
    let declared: BTreeSet<String> = model.comments().iter().map(|c| c.id.clone()).collect();
    let mut issues = Vec::new();
    let by_id = tally(markers(text, &prose, &declared, &mut issues));
    balance_issues(&by_id, "", &mut issues);

    let card_at = card_locations(text, &masked);
    for root in model.roots() {
        if !by_id.contains_key(&root.id) {
            tracing::warn!(comment = %root.id, "root comment has no range in the output");
        }
    }
    for (id, t) in &by_id {
        if model.get(id).is_some_and(|c| !c.is_root()) {
            let first = t.starts.first().or(t.ends.first());
            issues.push(MarkerIssue::UnbalancedMarker {
                id: id.clone(),
                edge: first.map(|m| m.edge).unwrap_or(Edge::Start),
                at: first.map(|m| m.at).unwrap_or(TextLocation { line: 1, col: 1 }),
                partner: card_at.get(id).copied(),
                detail: "belongs to a reply, which is anchored through its card only".to_string(),
            });
        }
    }

    if issues.is_empty() {
        Ok(())
    } else {
        Err(ValidationFailure {
            source: label.to_string(),
            issues,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::markdown::extract::{Card, SpanMark};
    use crate::markdown::ast::Attr;
    use crate::markdown::grammar::CardMeta;
    use crate::model::Comment;

    fn card(id: &str, parent: Option<&str>) -> Card {
        let mut meta = CardMeta::default();
        if let Some(p) = parent {
            meta.set("parent", p);
        }
        Card {
            id: id.to_string(),
            kind: if parent.is_some() { CardKind::Reply } else { CardKind::Comment },
            meta,
            body: String::new(),
        }
    }

    fn mark(id: &str, edge: Edge) -> SpanMark {
        SpanMark {
            id: id.to_string(),
            edge,
            attr: Attr::default(),
            text: String::new(),
        }
    }

    fn extraction(cards: Vec<Card>, ids: &[&str]) -> Extraction {
        let marks = ids
            .iter()
            .flat_map(|id| [mark(id, Edge::Start), mark(id, Edge::End)])
            .collect();
        Extraction {
            cards,
            marks,
            milestones: 0,
        }
    }

    fn issues(source: &str, ex: &Extraction) -> Vec<MarkerIssue> {
        match validate_markdown("draft.md", source, "", ex) {
            Ok(()) => Vec::new(),
            Err(f) => f.issues,
        }
    }

    #[test]
    fn clean_source_passes() {
        let src = "Intro ///c1.START/// text ///c1.END///\n\n> [!COMMENT c1: A (active)]\n";
        assert!(issues(src, &extraction(vec![card("c1", None)], &["c1"])).is_empty());
    }

    #[test]
    fn one_sided_wrapper_is_malformed() {
        let src = "Intro ==///c1.START/// text ///c1.END///\n";
        let found = issues(src, &extraction(vec![], &["c1"]));
        assert_eq!(
            found,
            vec![MarkerIssue::MalformedMarker {
                id: "c1".to_string(),
                edge: Edge::Start,
                at: TextLocation { line: 1, col: 9 },
            }]
        );
    }

    #[test]
    fn duplicate_and_unbalanced_report_locations() {
        let src = "///4.START/// a\n///4.START/// b ///4.END///\n";
        let found = issues(src, &extraction(vec![], &["4"]));
        assert!(matches!(&found[0], MarkerIssue::DuplicateCommentId { starts, .. } if starts.len() == 2));
        match &found[1] {
            MarkerIssue::UnbalancedMarker { edge, at, partner, .. } => {
                assert_eq!(*edge, Edge::Start);
                assert_eq!(at.line, 2);
                assert_eq!(partner.map(|p| p.line), Some(2));
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn end_before_start_is_flagged() {
        let src = "///5.END/// x ///5.START///";
        let found = issues(src, &extraction(vec![], &["5"]));
        assert!(matches!(&found[0], MarkerIssue::UnbalancedMarker { detail, .. } if detail.contains("before")));
    }

    #[test]
    fn unknown_parent_is_reported_with_card_line() {
        let src = "///c1.START/// x ///c1.END///\n\n> [!REPLY c2: B (active)]\n> <!--CARD_META{#c2 \"parent\":\"c9\"}-->\n";
        let ex = extraction(vec![card("c1", None), card("c2", Some("c9"))], &["c1"]);
        let found = issues(src, &ex);
        assert_eq!(
            found,
            vec![MarkerIssue::MissingParentId {
                child: "c2".to_string(),
                parent: "c9".to_string(),
                at: Some(TextLocation { line: 4, col: 3 }),
            }]
        );
    }

    #[test]
    fn root_card_without_markers_is_unanchored() {
        let src = "Prose only.\n\n> [!COMMENT 7: A (active)]\n";
        let found = issues(src, &extraction(vec![card("7", None)], &[]));
        assert_eq!(
            found,
            vec![MarkerIssue::UnanchoredCard {
                id: "7".to_string(),
                at: TextLocation { line: 3, col: 3 },
            }]
        );
    }

    #[test]
    fn self_parent_and_loops_are_cycles() {
        let ex = extraction(vec![card("a", Some("b")), card("b", Some("a")), card("s", Some("s"))], &[]);
        let found = issues("", &ex);
        let chains: Vec<Vec<String>> = found
            .into_iter()
            .filter_map(|i| match i {
                MarkerIssue::ThreadCycle { chain } => Some(chain),
                _ => None,
            })
            .collect();
        assert_eq!(chains, vec![vec!["a", "b", "a"], vec!["s", "s"]]);
    }

    #[test]
    fn losses_in_normalized_text_are_caught() {
        let src = "///1.START/// x ///1.END///";
        let normalized = r#"[]{.comment-start id="1"}x"#;
        let err = validate_markdown("draft.md", src, normalized, &extraction(vec![], &["1"])).unwrap_err();
        assert!(matches!(&err.issues[0], MarkerIssue::UnbalancedMarker { detail, .. } if detail.ends_with("after normalization")));
    }

    #[test]
    fn projection_check_flags_reply_markers() {
        let mut model = CommentModel::default();
        model.insert(Comment::new("0"), "t").unwrap();
        let mut reply = Comment::new("1");
        reply.parent_id = Some("0".to_string());
        model.insert(reply, "t").unwrap();

        assert!(check_projection("out.md", "///0.START/// a ///0.END///", &model).is_ok());
        let err = check_projection("out.md", "///0.START/// a ///0.END/// ///1.START///x///1.END///", &model).unwrap_err();
        assert_eq!(err.issues.len(), 1);
    }

    #[test]
    fn marker_syntax_in_card_bodies_is_text() {
        let src = "Intro ///c1.START/// text ///c1.END///\n\n\
                   > [!COMMENT c1: A (active)]\n> <!--CARD_META{#c1 \"author\":\"A\"}-->\n> write ///x.START/// to open\n";
        assert!(issues(src, &extraction(vec![card("c1", None)], &["c1"])).is_empty());

        let mut model = CommentModel::default();
        model.insert(Comment::new("c1"), "t").unwrap();
        assert!(check_projection("out.md", src, &model).is_ok());
    }

    #[test]
    fn marker_syntax_in_code_is_text() {
        let src = "Use `///9.START///` to open.\n\n```\n///9.END/// ///9.END///\n```\n\n///1.START/// a ///1.END///\n";
        assert!(issues(src, &extraction(vec![], &["1"])).is_empty());
    }

    #[test]
    fn plain_quotes_are_still_scanned() {
        let src = "> quoted ///3.START/// only\n";
        let found = issues(src, &extraction(vec![], &[]));
        assert!(matches!(&found[0], MarkerIssue::UnbalancedMarker { id, .. } if id == "3"));
    }
}

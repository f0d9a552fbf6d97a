//! Markdown -> comment model.
//!
//! Cards are lifted out of the document tree, milestone tokens in running
//! text are rewritten into the converter's comment spans, and the comments
//! are assembled from both.

use std::collections::{BTreeMap, BTreeSet};

use anyhow::Context;
use serde_json::Value;

use super::ast::{
    block_text, blocks_mut, comment_span, inlines_to_lines, is, join_lines, run_text, span, tag,
    text_to_inlines, walk_block_lists, walk_inline_lists, Attr, Line,
};
use super::grammar::{
    canonical_marker_id, find_milestones, normalize_comment_text, CardHeader, CardKind, CardMeta,
    Edge, CARD_META_KEYS, CARD_META_RE,
};
use crate::error::CommentError;
use crate::model::{Comment, CommentModel, CommentState, Presence};

/// One comment card as read back from Markdown.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Card {
    pub id: String,
    pub kind: CardKind,
    pub meta: CardMeta,
    pub body: String,
}

impl Card {
    pub fn parent(&self) -> Option<&str> {
        self.meta.get("parent")
    }
}

/// A comment span in the rewritten tree, in document order.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SpanMark {
    pub id: String,
    pub edge: Edge,
    pub attr: Attr,
    pub text: String,
}

#[derive(Clone, Debug, Default)]
pub struct Extraction {
    pub cards: Vec<Card>,
    pub marks: Vec<SpanMark>,
    /// Milestone tokens rewritten into spans.
    pub milestones: usize,
}

/// Lift cards out of `doc` and turn milestones into comment spans.
pub fn extract(doc: &mut Value) -> anyhow::Result<Extraction> {
    let blocks = blocks_mut(doc).context("document tree has no block list")?;

    let mut cards = Vec::new();
    walk_block_lists(blocks, &mut |list: &mut Vec<Value>| {
        let mut kept = Vec::with_capacity(list.len());
        for block in list.drain(..) {
            if is(&block, "BlockQuote") && parse_card(&block, None, &mut cards) {
                continue;
            }
            kept.push(block);
        }
        *list = kept;
    });

    let mut milestones = 0usize;
    {
        let declared: BTreeSet<String> = cards.iter().map(|c| c.id.clone()).collect();
        let by_id: BTreeMap<&str, &Card> = cards.iter().map(|c| (c.id.as_str(), c)).collect();
        walk_inline_lists(blocks, &mut |list: &mut Vec<Value>| {
            milestones += rewrite_list(list, &declared, &by_id);
        });
    }

    let mut marks = Vec::new();
    walk_inline_lists(blocks, &mut |list: &mut Vec<Value>| {
        for node in list.iter() {
            if let Some((edge, id, attr)) = comment_span(node) {
                let text = node
                    .get("c")
                    .and_then(|c| c.get(1))
                    .and_then(Value::as_array)
                    .map(|inl| join_lines(&inlines_to_lines(inl)))
                    .unwrap_or_default();
                marks.push(SpanMark { id, edge, attr, text });
            }
        }
    });

    tracing::debug!(cards = cards.len(), milestones, spans = marks.len(), "markdown comments extracted");
    Ok(Extraction {
        cards,
        marks,
        milestones,
    })
}

/// Parse `block` as a card (and its nested reply cards) into `out`.
/// Returns false for an ordinary quote.
fn parse_card(block: &Value, parent_hint: Option<&str>, out: &mut Vec<Card>) -> bool {
    let Some(children) = block.get("c").and_then(Value::as_array) else {
        return false;
    };
    let primary = children.iter().position(|b| {
        matches!(tag(b), Some("Para" | "Plain" | "Header" | "RawBlock" | "LineBlock"))
    });
    let Some(primary) = primary else {
        return false;
    };
    let lines = block_lines(&children[primary]);

    let header = lines
        .iter()
        .position(|l| !l.text.trim().is_empty())
        .and_then(|i| CardHeader::parse(&lines[i].text).map(|h| (i, h)));

    let mut annotation: Option<(String, CardMeta)> = None;
    let mut body_lines: Vec<Line> = Vec::new();
    for (i, line) in lines.iter().enumerate() {
        if header.as_ref().is_some_and(|(h, _)| *h == i) {
            continue;
        }
        if let Some(found) = CardMeta::parse(&line.text) {
            annotation.get_or_insert(found);
            let rest = CARD_META_RE.replace_all(&line.text, "");
            if rest.trim().is_empty() {
                continue;
            }
            body_lines.push(Line {
                text: rest.trim().to_string(),
                hard_break: line.hard_break,
            });
            continue;
        }
        body_lines.push(line.clone());
    }

    let mut paragraphs = vec![join_lines(&body_lines)];
    let mut nested = Vec::new();
    for (i, child) in children.iter().enumerate() {
        if i == primary {
            continue;
        }
        if is(child, "BlockQuote") {
            nested.push(child);
            continue;
        }
        let Some(text) = body_block_text(child) else {
            continue;
        };
        if let Some(found) = CardMeta::parse(&text) {
            annotation.get_or_insert(found);
            let rest = CARD_META_RE.replace_all(&text, "");
            if !rest.trim().is_empty() {
                paragraphs.push(rest.trim().to_string());
            }
            continue;
        }
        paragraphs.push(text);
    }

    let (id, head, mut meta) = match (header, annotation) {
        (None, None) => return false,
        (Some((_, h)), None) => (h.id.clone(), Some(h), CardMeta::default()),
        (header, Some((id, meta))) => {
            let h = header.map(|(_, h)| h);
            if let Some(h) = h.as_ref().filter(|h| h.id != id) {
                tracing::warn!(header = %h.id, annotation = %id, "card header and metadata disagree on the id; using metadata");
            }
            (id, h, meta)
        }
    };
    if let Some(h) = head.as_ref() {
        if meta.get("author").is_none() {
            meta.set("author", &h.author);
        }
        if meta.get("state").is_none() {
            meta.set("state", h.state.as_str());
        }
    }
    if meta.get("parent").is_none() {
        if let Some(hint) = parent_hint {
            meta.set("parent", hint);
        }
    }
    let kind = match (head.map(|h| h.kind), meta.get("parent")) {
        (_, Some(_)) | (Some(CardKind::Reply), None) => CardKind::Reply,
        _ => CardKind::Comment,
    };
    let body = paragraphs
        .iter()
        .map(|p| p.trim())
        .filter(|p| !p.is_empty())
        .collect::<Vec<_>>()
        .join("\n\n");

    out.push(Card {
        id: id.clone(),
        kind,
        meta,
        body: normalize_comment_text(&body),
    });
    for quote in nested {
        if !parse_card(quote, Some(&id), out) {
            tracing::debug!(card = %id, "plain quote inside a card ignored");
        }
    }
    true
}

/// Markdown text of a card body block. Lists, rules, code and headings
/// come back in their Markdown form so comment text keeps its structure.
fn body_block_text(block: &Value) -> Option<String> {
    let c = block.get("c");
    match tag(block)? {
        "HorizontalRule" => Some("---".to_string()),
        "CodeBlock" => Some(format!("```\n{}\n```", c?.get(1)?.as_str()?)),
        "Header" => {
            let level = c?.get(0)?.as_u64()?.clamp(1, 6) as usize;
            Some(format!("{} {}", "#".repeat(level), block_text(block)?))
        }
        "BulletList" => {
            let items = c?.as_array()?;
            Some(list_text(items, |_| "-".to_string()))
        }
        "OrderedList" => {
            let c = c?;
            let first = c.get(0)?.get(0)?.as_u64().unwrap_or(1);
            let delim = c.get(0)?.get(2).and_then(tag).unwrap_or("Period");
            let items = c.get(1)?.as_array()?;
            Some(list_text(items, |i| {
                let n = first + i as u64;
                match delim {
                    "OneParen" => format!("{n})"),
                    "TwoParens" => format!("({n})"),
                    _ => format!("{n}."),
                }
            }))
        }
        _ => block_text(block),
    }
}

/// One marker per item; continuation lines are indented under the marker.
fn list_text<F>(items: &[Value], marker: F) -> String
where
    F: Fn(usize) -> String,
{
    items
        .iter()
        .enumerate()
        .map(|(i, item)| {
            let marker = marker(i);
            let indent = " ".repeat(marker.len() + 1);
            let text = item
                .as_array()
                .map(|blocks| {
                    blocks
                        .iter()
                        .filter_map(body_block_text)
                        .collect::<Vec<_>>()
                        .join("\n")
                })
                .unwrap_or_default();
            let mut lines = text.split('\n');
            let mut out = format!("{marker} {}", lines.next().unwrap_or_default());
            for line in lines {
                out.push('\n');
                if !line.is_empty() {
                    out.push_str(&indent);
                    out.push_str(line);
                }
            }
            out
        })
        .collect::<Vec<_>>()
        .join("\n")
}

fn block_lines(block: &Value) -> Vec<Line> {
    let inlines = match tag(block) {
        Some("Para" | "Plain") => block.get("c").and_then(Value::as_array),
        Some("Header") => block.get("c").and_then(|c| c.get(2)).and_then(Value::as_array),
        _ => None,
    };
    match inlines {
        Some(inlines) => inlines_to_lines(inlines),
        None => block_text(block)
            .unwrap_or_default()
            .split('\n')
            .map(|l| Line {
                text: l.to_string(),
                hard_break: true,
            })
            .collect(),
    }
}

/// Start span carrying the card's metadata, or a bare end span.
fn comment_span_node(id: &str, edge: Edge, card: Option<&&Card>) -> Value {
    let mut attr = Attr {
        classes: vec![edge.span_class().to_string()],
        ..Attr::default()
    };
    attr.set("id", id);
    if edge == Edge::Start {
        if let Some(card) = card {
            for key in CARD_META_KEYS {
                if let Some(v) = card.meta.get(key) {
                    attr.set(key, v);
                }
            }
        }
    }
    span(&attr, Vec::new())
}

/// Rewrite milestone tokens in the text runs of one inline list, and move
/// `#id` identifiers of hand-written comment spans into an `id` pair.
fn rewrite_list(list: &mut Vec<Value>, declared: &BTreeSet<String>, cards: &BTreeMap<&str, &Card>) -> usize {
    let mut rewritten = 0;
    let mut out = Vec::with_capacity(list.len());
    let mut run = Vec::new();
    for mut node in list.drain(..) {
        if run_text(&node).is_some() {
            run.push(node);
            continue;
        }
        rewritten += flush_run(&mut run, &mut out, declared, cards);
        normalize_span_id(&mut node, cards);
        out.push(node);
    }
    rewritten += flush_run(&mut run, &mut out, declared, cards);
    *list = out;
    rewritten
}

fn flush_run(
    run: &mut Vec<Value>,
    out: &mut Vec<Value>,
    declared: &BTreeSet<String>,
    cards: &BTreeMap<&str, &Card>,
) -> usize {
    if run.is_empty() {
        return 0;
    }
    let text: String = run.iter().filter_map(run_text).collect();
    let found = find_milestones(&text);
    if found.is_empty() {
        out.append(run);
        return 0;
    }
    let mut cursor = 0;
    for m in &found {
        out.extend(text_to_inlines(&text[cursor..m.start]));
        let id = canonical_marker_id(&m.raw_id, |id| declared.contains(id));
        out.push(comment_span_node(&id, m.edge, cards.get(id.as_str())));
        cursor = m.end;
    }
    out.extend(text_to_inlines(&text[cursor..]));
    run.clear();
    found.len()
}

fn normalize_span_id(node: &mut Value, cards: &BTreeMap<&str, &Card>) {
    let Some((edge, id, mut attr)) = comment_span(node) else {
        return;
    };
    let before = attr.clone();
    attr.id.clear();
    attr.set("id", &id);
    if edge == Edge::Start {
        if let Some(card) = cards.get(id.as_str()) {
            for key in CARD_META_KEYS {
                if let (None, Some(v)) = (attr.get(key), card.meta.get(key)) {
                    attr.set(key, v);
                }
            }
        }
    }
    if attr != before {
        if let Some(slot) = node.get_mut("c").and_then(|c| c.get_mut(0)) {
            *slot = attr.to_value();
        }
    }
}

impl Extraction {
    pub fn card(&self, id: &str) -> Option<&Card> {
        self.cards.iter().find(|c| c.id == id)
    }

    /// Ids that really exist: every span (milestones included) and every card.
    pub fn genuine_ids(&self) -> BTreeSet<String> {
        self.marks
            .iter()
            .map(|m| m.id.clone())
            .chain(self.cards.iter().map(|c| c.id.clone()))
            .collect()
    }

    /// Declared parent of `id`, resolved against the genuine ids.
    pub fn parent_of(&self, id: &str, genuine: &BTreeSet<String>) -> Option<String> {
        let raw = self.card(id).and_then(Card::parent).or_else(|| {
            self.marks
                .iter()
                .find(|m| m.id == id && m.edge == Edge::Start)
                .and_then(|m| m.attr.get("parent"))
                .filter(|p| !p.trim().is_empty())
        })?;
        let raw = raw.trim();
        let canonical = canonical_marker_id(raw, |p| genuine.contains(p));
        if genuine.contains(&canonical) {
            Some(canonical)
        } else {
            Some(raw.to_string())
        }
    }

    /// Comments in order of first START, then card-only comments in card order.
    pub fn to_model(&self) -> Result<CommentModel, CommentError> {
        let genuine = self.genuine_ids();
        let mut order: Vec<&str> = Vec::new();
        for m in self.marks.iter().filter(|m| m.edge == Edge::Start) {
            if !order.contains(&m.id.as_str()) {
                order.push(&m.id);
            }
        }
        for card in &self.cards {
            if !order.contains(&card.id.as_str()) {
                order.push(&card.id);
            }
        }

        let mut model = CommentModel::default();
        for id in order {
            let span = self
                .marks
                .iter()
                .find(|m| m.id == id && m.edge == Edge::Start);
            let card = self.card(id);
            let field = |key: &str| -> Option<String> {
                card.and_then(|c| c.meta.get(key))
                    .or_else(|| span.and_then(|s| s.attr.get(key)))
                    .map(str::trim)
                    .filter(|v| !v.is_empty())
                    .map(str::to_string)
            };

            let mut comment = Comment::new(id);
            comment.author = field("author").unwrap_or_else(|| "Unknown".to_string());
            comment.date = field("date");
            comment.state = field("state")
                .map(|s| CommentState::parse(&s))
                .unwrap_or_default();
            comment.parent_id = self.parent_of(id, &genuine);
            comment.thread_para_key = field("paraId");
            comment.durable_id = field("durableId");
            let text = match card.map(|c| c.body.as_str()).filter(|b| !b.trim().is_empty()) {
                Some(body) => body.to_string(),
                None => normalize_comment_text(&span.map(|s| s.text.clone()).unwrap_or_default()),
            };
            comment.set_body_text(&text);

            if let (Some(provider_id), Some(user_id)) = (field("presenceProvider"), field("presenceUserId")) {
                model.authors.register(&comment.author, Presence { provider_id, user_id });
            }
            model.insert(comment, "markdown")?;
        }

        if let Some(chain) = model.find_cycle() {
            return Err(CommentError::ThreadCycle {
                part: "markdown".to_string(),
                chain,
            });
        }
        Ok(model)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::markdown::ast::{inlines_to_text, str_node, LINE_BREAK};
    use serde_json::json;

    fn para(inlines: Vec<Value>) -> Value {
        json!({"t": "Para", "c": inlines})
    }

    fn words(text: &str) -> Vec<Value> {
        text_to_inlines(text)
    }

    fn raw_html(text: &str) -> Value {
        json!({"t": "RawInline", "c": ["html", text]})
    }

    /// Shape the converter gives a card after the layout pass.
    fn card_quote(header: &str, meta: &str, body: &str, nested: Vec<Value>) -> Value {
        let mut first = words(header);
        first.push(json!({"t": "SoftBreak"}));
        first.push(raw_html(meta));
        if !body.is_empty() {
            first.push(json!({"t": "SoftBreak"}));
            first.extend(words(body));
        }
        let mut blocks = vec![para(first)];
        blocks.extend(nested);
        json!({"t": "BlockQuote", "c": blocks})
    }

    fn doc(blocks: Vec<Value>) -> Value {
        json!({"pandoc-api-version": [1, 23], "meta": {}, "blocks": blocks})
    }

    #[test]
    fn cards_are_lifted_with_nested_parent_hints() {
        let reply = card_quote(
            "[!REPLY c2: Bob (resolved)]",
            "<!--CARD_META{#c2 \"author\":\"Bob\"}-->",
            "Agreed",
            vec![],
        );
        let root = card_quote(
            "[!COMMENT c1: Ann (active)]",
            "<!--CARD_META{#c1 \"author\":\"Ann\",\"date\":\"2024-01-01T00:00:00Z\"}-->",
            "Check this",
            vec![para(words("Second paragraph")), reply],
        );
        let mut d = doc(vec![para(words("Intro ///c1.START/// text ///c1.END///")), root]);
        let ex = extract(&mut d).unwrap();

        assert_eq!(d["blocks"].as_array().unwrap().len(), 1);
        assert_eq!(ex.cards.len(), 2);
        assert_eq!(ex.cards[0].body, "Check this\n\nSecond paragraph");
        assert_eq!(ex.cards[1].parent(), Some("c1"));
        assert_eq!(ex.cards[1].kind, CardKind::Reply);
        assert_eq!(ex.cards[1].meta.state(), CommentState::Resolved);
        assert_eq!(ex.milestones, 2);
    }

    #[test]
    fn milestones_become_spans_with_card_attrs() {
        let root = card_quote(
            "[!COMMENT c1: Ann (active)]",
            "<!--CARD_META{#c1 \"author\":\"Ann\",\"paraId\":\"0000AB12\"}-->",
            "Body",
            vec![],
        );
        let mut d = doc(vec![para(words("Alpha ==///c1.START///== beta ///c1.END///.")), root]);
        let ex = extract(&mut d).unwrap();

        let inlines = d["blocks"][0]["c"].as_array().unwrap();
        let (edge, id, attr) = comment_span(&inlines[2]).unwrap();
        assert_eq!((edge, id.as_str()), (Edge::Start, "c1"));
        assert_eq!(attr.get("author"), Some("Ann"));
        assert_eq!(attr.get("paraId"), Some("0000AB12"));
        assert_eq!(inlines_to_text(inlines), "Alpha  beta .");
        assert_eq!(ex.marks.len(), 2);
        assert_eq!(ex.marks[1].edge, Edge::End);
    }

    #[test]
    fn tokens_split_across_runs_inside_emphasis_are_found() {
        let mut d = doc(vec![para(vec![
            json!({"t": "Emph", "c": words("x ///7.START/// y")}),
            str_node("///7.END///"),
        ])]);
        let ex = extract(&mut d).unwrap();
        assert_eq!(ex.milestones, 2);
        let ids: Vec<&str> = ex.marks.iter().map(|m| m.id.as_str()).collect();
        assert_eq!(ids, ["7", "7"]);
    }

    #[test]
    fn alias_ids_resolve_unless_declared() {
        let mut d = doc(vec![para(words("///C3.START/// x ///c3.END///"))]);
        let ex = extract(&mut d).unwrap();
        assert!(ex.marks.iter().all(|m| m.id == "3"));
    }

    #[test]
    fn hand_written_spans_are_kept_and_normalized() {
        let mut d = doc(vec![para(vec![
            json!({"t": "Span", "c": [["c5", ["comment-start"], [["author", "Eve"]]], words("note text")]}),
            str_node("x"),
            json!({"t": "Span", "c": [["", ["comment-end"], [["id", "c5"]]], []]}),
        ])]);
        let ex = extract(&mut d).unwrap();
        assert_eq!(ex.marks[0].attr.get("id"), Some("c5"));
        assert!(ex.marks[0].attr.id.is_empty());
        assert_eq!(d["blocks"][0]["c"][0]["c"][0][0], "");

        let model = ex.to_model().unwrap();
        let c5 = model.get("c5").unwrap();
        assert_eq!(c5.author, "Eve");
        assert_eq!(c5.body, ["note text"]);
    }

    #[test]
    fn model_prefers_card_fields_and_registers_presence() {
        let reply = card_quote(
            "[!REPLY c2: Bob (resolved)]",
            "<!--CARD_META{#c2 \"author\":\"Bob\",\"presenceProvider\":\"AD\",\"presenceUserId\":\"bob@x\"}-->",
            &format!("Line one{LINE_BREAK}line two"),
            vec![],
        );
        let root = card_quote("[!COMMENT c1: Ann (active)]", "<!--CARD_META{#c1}-->", "Root", vec![reply]);
        let mut d = doc(vec![para(words("///c1.START/// t ///c1.END///")), root]);
        let model = extract(&mut d).unwrap().to_model().unwrap();

        let ids: Vec<&str> = model.comments().iter().map(|c| c.id.as_str()).collect();
        assert_eq!(ids, ["c1", "c2"]);
        assert_eq!(model.get("c1").unwrap().author, "Ann");
        let c2 = model.get("c2").unwrap();
        assert_eq!(c2.parent_id.as_deref(), Some("c1"));
        assert_eq!(c2.state, CommentState::Resolved);
        assert_eq!(c2.body, ["Line one\nline two"]);
        assert_eq!(model.authors.get("Bob").unwrap().user_id, "bob@x");
    }

    #[test]
    fn parent_loops_fail_model_assembly() {
        let a = card_quote("[!REPLY a: X (active)]", "<!--CARD_META{#a \"parent\":\"b\"}-->", "", vec![]);
        let b = card_quote("[!REPLY b: Y (active)]", "<!--CARD_META{#b \"parent\":\"a\"}-->", "", vec![]);
        let mut d = doc(vec![a, b]);
        let err = extract(&mut d).unwrap().to_model().unwrap_err();
        assert!(matches!(err, CommentError::ThreadCycle { .. }));
    }

    #[test]
    fn ordinary_quotes_stay() {
        let mut d = doc(vec![json!({"t": "BlockQuote", "c": [para(words("just a quote"))]})]);
        let ex = extract(&mut d).unwrap();
        assert!(ex.cards.is_empty());
        assert_eq!(d["blocks"].as_array().unwrap().len(), 1);
    }

    #[test]
    fn structured_card_bodies_keep_lists_and_rules() {
        let plain = |text: &str| json!({"t": "Plain", "c": words(text)});
        let ordered = json!({"t": "OrderedList", "c": [
            [1, {"t": "Decimal"}, {"t": "Period"}],
            [[plain("fix intro")], [plain("tighten summary")]],
        ]});
        let bullets = json!({"t": "BulletList", "c": [
            [plain("one"), plain("more")],
            [plain("two")],
        ]});
        let root = card_quote(
            "[!COMMENT c1: Ann (active)]",
            "<!--CARD_META{#c1 \"author\":\"Ann\"}-->",
            "",
            vec![ordered, bullets, json!({"t": "HorizontalRule"}), para(words("after"))],
        );
        let mut d = doc(vec![para(words("///c1.START/// t ///c1.END///")), root]);
        let model = extract(&mut d).unwrap().to_model().unwrap();
        assert_eq!(
            model.get("c1").unwrap().body,
            ["1. fix intro\n2. tighten summary", "- one\n  more\n- two", "---", "after"]
        );
    }

    #[test]
    fn paren_lists_and_code_in_card_bodies() {
        let ordered = json!({"t": "OrderedList", "c": [
            [3, {"t": "Decimal"}, {"t": "OneParen"}],
            [[{"t": "Plain", "c": words("third")}]],
        ]});
        let code = json!({"t": "CodeBlock", "c": [["", [], []], "///x.START///"]});
        let root = card_quote("[!COMMENT 5: A (active)]", "<!--CARD_META{#5}-->", "See", vec![ordered, code]);
        let mut d = doc(vec![root]);
        let ex = extract(&mut d).unwrap();
        assert_eq!(ex.cards[0].body, "See\n\n3) third\n\n```\n///x.START///\n```");
        assert_eq!(ex.milestones, 0);
    }
}

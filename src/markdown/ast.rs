//! Walking the converter's JSON document tree.
//!
//! Only an allowlist of containers is entered: paragraphs, headings, quotes,
//! divs, lists, definition lists, tables and the inline containers that hold
//! running text. Code, math and raw nodes are never looked into.

use serde_json::{json, Value};

use super::grammar::{Edge, COMMENT_END_CLASS, COMMENT_START_CLASS};

/// Stands in for a hard line break while inline text is handled as a string.
pub const LINE_BREAK: char = '\u{2028}';

pub fn tag(node: &Value) -> Option<&str> {
    node.get("t").and_then(Value::as_str)
}

pub fn is(node: &Value, t: &str) -> bool {
    tag(node) == Some(t)
}

pub fn blocks_mut(doc: &mut Value) -> Option<&mut Vec<Value>> {
    doc.get_mut("blocks").and_then(Value::as_array_mut)
}

/// `[identifier, [classes], [[key, value], ...]]`
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Attr {
    pub id: String,
    pub classes: Vec<String>,
    pub pairs: Vec<(String, String)>,
}

impl Attr {
    pub fn from_value(v: &Value) -> Option<Self> {
        let parts = v.as_array()?;
        let id = parts.first()?.as_str().unwrap_or_default().to_string();
        let classes = parts
            .get(1)
            .and_then(Value::as_array)
            .map(|cs| cs.iter().filter_map(Value::as_str).map(str::to_string).collect())
            .unwrap_or_default();
        let pairs = parts
            .get(2)
            .and_then(Value::as_array)
            .map(|kvs| {
                kvs.iter()
                    .filter_map(|kv| {
                        let kv = kv.as_array()?;
                        Some((kv.first()?.as_str()?.to_string(), kv.get(1)?.as_str()?.to_string()))
                    })
                    .collect()
            })
            .unwrap_or_default();
        Some(Self { id, classes, pairs })
    }

    pub fn to_value(&self) -> Value {
        let pairs: Vec<Value> = self.pairs.iter().map(|(k, v)| json!([k, v])).collect();
        json!([self.id, self.classes, pairs])
    }

    pub fn has_class(&self, class: &str) -> bool {
        self.classes.iter().any(|c| c == class)
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.pairs
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    pub fn set(&mut self, key: &str, value: &str) {
        match self.pairs.iter_mut().find(|(k, _)| k == key) {
            Some(pair) => pair.1 = value.to_string(),
            None => self.pairs.push((key.to_string(), value.to_string())),
        }
    }
}

pub fn str_node(text: &str) -> Value {
    json!({"t": "Str", "c": text})
}

pub fn raw_inline(format: &str, text: &str) -> Value {
    json!({"t": "RawInline", "c": [format, text]})
}

pub fn raw_block(format: &str, text: &str) -> Value {
    json!({"t": "RawBlock", "c": [format, text]})
}

pub fn span(attr: &Attr, inlines: Vec<Value>) -> Value {
    json!({"t": "Span", "c": [attr.to_value(), inlines]})
}

pub fn block_quote(blocks: Vec<Value>) -> Value {
    json!({"t": "BlockQuote", "c": blocks})
}

/// Attribute and children of a `Span`.
pub fn span_parts(node: &Value) -> Option<(Attr, &Vec<Value>)> {
    if !is(node, "Span") {
        return None;
    }
    let c = node.get("c")?;
    Some((Attr::from_value(c.get(0)?)?, c.get(1)?.as_array()?))
}

/// Edge, comment id and attribute of a comment span. The id is the span
/// identifier or its `id` pair.
pub fn comment_span(node: &Value) -> Option<(Edge, String, Attr)> {
    let (attr, _) = span_parts(node)?;
    let edge = if attr.has_class(COMMENT_START_CLASS) {
        Edge::Start
    } else if attr.has_class(COMMENT_END_CLASS) {
        Edge::End
    } else {
        return None;
    };
    let id = match attr.id.trim() {
        "" => attr.get("id")?.trim().to_string(),
        id => id.to_string(),
    };
    if id.is_empty() {
        return None;
    }
    Some((edge, id, attr))
}

/// Call `f` on every inline list reachable from `blocks`, outermost first.
pub fn walk_inline_lists<F>(blocks: &mut [Value], f: &mut F)
where
    F: FnMut(&mut Vec<Value>),
{
    for block in blocks {
        walk_block(block, f);
    }
}

fn walk_block<F>(block: &mut Value, f: &mut F)
where
    F: FnMut(&mut Vec<Value>),
{
    let Some(t) = tag(block).map(str::to_owned) else {
        return;
    };
    let Some(c) = block.get_mut("c") else {
        return;
    };
    match t.as_str() {
        "Para" | "Plain" => {
            if let Some(list) = c.as_array_mut() {
                walk_inlines(list, f);
            }
        }
        "Header" => {
            if let Some(list) = c.get_mut(2).and_then(Value::as_array_mut) {
                walk_inlines(list, f);
            }
        }
        "LineBlock" => {
            for line in c.as_array_mut().into_iter().flatten() {
                if let Some(list) = line.as_array_mut() {
                    walk_inlines(list, f);
                }
            }
        }
        "BlockQuote" => {
            if let Some(blocks) = c.as_array_mut() {
                walk_inline_lists(blocks, f);
            }
        }
        "Div" => {
            if let Some(blocks) = c.get_mut(1).and_then(Value::as_array_mut) {
                walk_inline_lists(blocks, f);
            }
        }
        "BulletList" => walk_items(Some(c), f),
        "OrderedList" => walk_items(c.get_mut(1), f),
        "DefinitionList" => {
            for entry in c.as_array_mut().into_iter().flatten() {
                if let Some(term) = entry.get_mut(0).and_then(Value::as_array_mut) {
                    walk_inlines(term, f);
                }
                walk_items(entry.get_mut(1), f);
            }
        }
        "Table" | "Figure" => walk_nested(c, f),
        _ => {}
    }
}

fn walk_items<F>(items: Option<&mut Value>, f: &mut F)
where
    F: FnMut(&mut Vec<Value>),
{
    for item in items.and_then(Value::as_array_mut).into_iter().flatten() {
        if let Some(blocks) = item.as_array_mut() {
            walk_inline_lists(blocks, f);
        }
    }
}

/// Table and figure layouts differ between converter versions; find the
/// blocks in their cells and captions wherever they sit.
fn walk_nested<F>(v: &mut Value, f: &mut F)
where
    F: FnMut(&mut Vec<Value>),
{
    if tag(v).is_some() {
        walk_block(v, f);
    } else if let Some(items) = v.as_array_mut() {
        for item in items {
            walk_nested(item, f);
        }
    }
}

fn walk_inlines<F>(list: &mut Vec<Value>, f: &mut F)
where
    F: FnMut(&mut Vec<Value>),
{
    f(list);
    for node in list.iter_mut() {
        let Some(t) = tag(node).map(str::to_owned) else {
            continue;
        };
        let Some(c) = node.get_mut("c") else {
            continue;
        };
        let children = match t.as_str() {
            "Emph" | "Strong" | "Strikeout" | "Superscript" | "Subscript" | "SmallCaps"
            | "Underline" => c.as_array_mut(),
            "Quoted" | "Cite" | "Span" | "Link" | "Image" => {
                c.get_mut(1).and_then(Value::as_array_mut)
            }
            "Note" => {
                if let Some(blocks) = c.as_array_mut() {
                    walk_inline_lists(blocks, f);
                }
                None
            }
            _ => None,
        };
        if let Some(children) = children {
            walk_inlines(children, f);
        }
    }
}

/// Call `f` on every block list: the top level and those nested in quotes,
/// divs and list items.
pub fn walk_block_lists<F>(blocks: &mut Vec<Value>, f: &mut F)
where
    F: FnMut(&mut Vec<Value>),
{
    f(blocks);
    for block in blocks.iter_mut() {
        let Some(t) = tag(block).map(str::to_owned) else {
            continue;
        };
        let Some(c) = block.get_mut("c") else {
            continue;
        };
        match t.as_str() {
            "BlockQuote" => {
                if let Some(inner) = c.as_array_mut() {
                    walk_block_lists(inner, f);
                }
            }
            "Div" => {
                if let Some(inner) = c.get_mut(1).and_then(Value::as_array_mut) {
                    walk_block_lists(inner, f);
                }
            }
            "BulletList" => walk_item_lists(Some(c), f),
            "OrderedList" => walk_item_lists(c.get_mut(1), f),
            "DefinitionList" => {
                for entry in c.as_array_mut().into_iter().flatten() {
                    walk_item_lists(entry.get_mut(1), f);
                }
            }
            _ => {}
        }
    }
}

fn walk_item_lists<F>(items: Option<&mut Value>, f: &mut F)
where
    F: FnMut(&mut Vec<Value>),
{
    for item in items.and_then(Value::as_array_mut).into_iter().flatten() {
        if let Some(inner) = item.as_array_mut() {
            walk_block_lists(inner, f);
        }
    }
}

/// Plain text of a run node (`Str`, `Space`, `SoftBreak`, `LineBreak`).
pub fn run_text(node: &Value) -> Option<String> {
    match tag(node)? {
        "Str" => node.get("c").and_then(Value::as_str).map(str::to_string),
        "Space" => Some(" ".to_string()),
        "SoftBreak" => Some("\n".to_string()),
        "LineBreak" => Some(LINE_BREAK.to_string()),
        _ => None,
    }
}

/// Inverse of [`run_text`] over a whole string.
pub fn text_to_inlines(text: &str) -> Vec<Value> {
    let mut out = Vec::new();
    let mut word = String::new();
    let mut in_space = false;
    for ch in text.chars() {
        let node = match ch {
            ' ' | '\t' => {
                if in_space {
                    continue;
                }
                in_space = true;
                json!({"t": "Space"})
            }
            '\n' => json!({"t": "SoftBreak"}),
            LINE_BREAK => json!({"t": "LineBreak"}),
            _ => {
                in_space = false;
                word.push(ch);
                continue;
            }
        };
        if !word.is_empty() {
            out.push(str_node(&std::mem::take(&mut word)));
        }
        if ch != ' ' && ch != '\t' {
            in_space = false;
        }
        out.push(node);
    }
    if !word.is_empty() {
        out.push(str_node(&word));
    }
    out
}

/// One visual line of inline content and how it ended.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Line {
    pub text: String,
    pub hard_break: bool,
}

/// Flatten inlines to text lines, keeping literal code and raw content.
pub fn inlines_to_lines(inlines: &[Value]) -> Vec<Line> {
    let mut lines = vec![Line::default()];
    push_inlines(inlines, &mut lines);
    for line in &mut lines {
        line.text = line.text.trim_end_matches([' ', '\t']).to_string();
    }
    lines
}

fn push_inlines(inlines: &[Value], lines: &mut Vec<Line>) {
    for node in inlines {
        let c = node.get("c");
        match tag(node).unwrap_or_default() {
            "Str" => push_text(lines, c.and_then(Value::as_str).unwrap_or_default()),
            "Space" => push_text(lines, " "),
            "SoftBreak" => lines.push(Line::default()),
            "LineBreak" => {
                if let Some(last) = lines.last_mut() {
                    last.hard_break = true;
                }
                lines.push(Line::default());
            }
            "Code" | "Math" => {
                let text = c
                    .and_then(Value::as_array)
                    .and_then(|parts| parts.last())
                    .and_then(Value::as_str)
                    .unwrap_or_default();
                push_text(lines, text);
            }
            "RawInline" => {
                let text = c.and_then(|c| c.get(1)).and_then(Value::as_str).unwrap_or_default();
                for (i, piece) in text.split('\n').enumerate() {
                    if i > 0 {
                        lines.push(Line::default());
                    }
                    push_text(lines, piece);
                }
            }
            "Quoted" => {
                let quote = match c.and_then(|c| c.get(0)).and_then(tag) {
                    Some("SingleQuote") => "'",
                    _ => "\"",
                };
                push_text(lines, quote);
                push_children(c.and_then(|c| c.get(1)), lines);
                push_text(lines, quote);
            }
            "Emph" | "Strong" | "Strikeout" | "Superscript" | "Subscript" | "SmallCaps"
            | "Underline" => push_children(c, lines),
            "Span" | "Link" | "Image" | "Cite" => push_children(c.and_then(|c| c.get(1)), lines),
            _ => {}
        }
    }
}

fn push_children(children: Option<&Value>, lines: &mut Vec<Line>) {
    if let Some(children) = children.and_then(Value::as_array) {
        push_inlines(children, lines);
    }
}

fn push_text(lines: &mut Vec<Line>, text: &str) {
    if let Some(last) = lines.last_mut() {
        last.text.push_str(text);
    }
}

/// Join lines back: soft wraps become spaces, hard breaks stay newlines.
pub fn join_lines(lines: &[Line]) -> String {
    let mut out = String::new();
    for (i, line) in lines.iter().enumerate() {
        if i > 0 {
            out.push(if lines[i - 1].hard_break { '\n' } else { ' ' });
        }
        out.push_str(line.text.trim_start());
    }
    out.trim().to_string()
}

pub fn inlines_to_text(inlines: &[Value]) -> String {
    join_lines(&inlines_to_lines(inlines))
}

/// Text of a paragraph-like block; `None` for anything else.
pub fn block_text(block: &Value) -> Option<String> {
    let c = block.get("c")?;
    match tag(block)? {
        "Para" | "Plain" => Some(inlines_to_text(c.as_array()?)),
        "Header" => Some(inlines_to_text(c.get(2)?.as_array()?)),
        "RawBlock" => Some(c.get(1)?.as_str()?.trim().to_string()),
        "LineBlock" => Some(
            c.as_array()?
                .iter()
                .filter_map(Value::as_array)
                .map(|line| inlines_to_text(line))
                .collect::<Vec<_>>()
                .join("\n"),
        ),
        _ => None,
    }
}

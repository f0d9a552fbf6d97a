//! Comment grammar shared by every Markdown pass: milestones, cards, card metadata and span attributes.

use std::collections::BTreeMap;
use std::fmt;

use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::{Map, Value};

use super::code::map_prose;
use crate::model::{Comment, CommentState, Presence};

/// Characters allowed in a comment id, in markers, cards and spans alike.
pub const COMMENT_ID_PATTERN: &str = "[A-Za-z0-9][A-Za-z0-9_-]*";

pub const COMMENT_START_CLASS: &str = "comment-start";
pub const COMMENT_END_CLASS: &str = "comment-end";

/// Card metadata keys, in emission order.
pub const CARD_META_KEYS: [&str; 8] = [
    "author",
    "date",
    "parent",
    "state",
    "paraId",
    "durableId",
    "presenceProvider",
    "presenceUserId",
];

/// Keys that only travel between our own passes and never reach the converter.
pub const TRANSPORT_KEYS: [&str; 4] = ["paraId", "durableId", "presenceProvider", "presenceUserId"];

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Edge {
    Start,
    End,
}

impl Edge {
    /// Accepts `s`, `e`, `start`, `end` in any case.
    pub fn parse(token: &str) -> Option<Self> {
        match token.trim().to_ascii_lowercase().as_str() {
            "s" | "start" => Some(Edge::Start),
            "e" | "end" => Some(Edge::End),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Edge::Start => "START",
            Edge::End => "END",
        }
    }

    pub fn span_class(self) -> &'static str {
        match self {
            Edge::Start => COMMENT_START_CLASS,
            Edge::End => COMMENT_END_CLASS,
        }
    }
}

impl fmt::Display for Edge {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

static MILESTONE_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r"(?P<open>==[ \t]*)?///\s*(?P<id>[A-Za-z0-9][A-Za-z0-9_-]*)\s*\.\s*(?P<edge>(?i:start|end|s|e))\s*///(?P<close>[ \t]*==)?",
    )
    .expect("milestone regex")
});

static ALIAS_ID_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"^[Cc]([0-9]+)$").expect("alias regex"));

static CARD_HEADER_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r"(?i)^\[!\s*(?P<kind>COMMENT|REPLY)\s+(?P<id>[A-Za-z0-9][A-Za-z0-9_-]*)\s*:\s*(?P<author>.+?)\s*\((?P<state>[A-Za-z]+)\)\s*\]$",
    )
    .expect("card header regex")
});

pub static CARD_META_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?s)<!--\s*CARD_META\s*\{\s*#(?P<id>[A-Za-z0-9][A-Za-z0-9_-]*)\s*(?P<attrs>.*?)\}\s*-->")
        .expect("card meta regex")
});

pub static COMMENT_START_ATTRS_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\{\.comment-start(?P<attrs>[^}]*)\}").expect("comment-start attrs regex"));

pub static COMMENT_END_ATTRS_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\{\.comment-end(?P<attrs>[^}]*)\}").expect("comment-end attrs regex"));

static KV_ATTR_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r#"([A-Za-z_:][-A-Za-z0-9_:.]*)="([^"]*)""#).expect("kv attr regex"));

static HASH_ID_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?:^|\s)#(?P<id>[A-Za-z0-9][A-Za-z0-9_-]*)").expect("hash id regex")
});

/// How a milestone token is wrapped in `==` highlight delimiters.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Wrap {
    None,
    Both,
    LeftOnly,
    RightOnly,
}

impl Wrap {
    pub fn is_one_sided(self) -> bool {
        matches!(self, Wrap::LeftOnly | Wrap::RightOnly)
    }
}

/// One milestone token found in text.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Milestone {
    /// Byte range the token occupies; includes the wrapper only when it is symmetric.
    pub start: usize,
    pub end: usize,
    /// Byte offset of the `///` opening the bare token.
    pub core_start: usize,
    pub raw_id: String,
    pub edge: Edge,
    pub wrap: Wrap,
}

pub fn find_milestones(text: &str) -> Vec<Milestone> {
    MILESTONE_RE
        .captures_iter(text)
        .filter_map(|caps| {
            let whole = caps.get(0)?;
            let edge = Edge::parse(caps.name("edge")?.as_str())?;
            let raw_id = caps.name("id")?.as_str().to_string();
            let open = caps.name("open");
            let close = caps.name("close");
            let core_start = open.map(|m| m.end()).unwrap_or(whole.start());
            let core_end = close.map(|m| m.start()).unwrap_or(whole.end());
            let wrap = match (open.is_some(), close.is_some()) {
                (true, true) => Wrap::Both,
                (false, false) => Wrap::None,
                (true, false) => Wrap::LeftOnly,
                (false, true) => Wrap::RightOnly,
            };
            let (start, end) = if wrap == Wrap::Both {
                (whole.start(), whole.end())
            } else {
                (core_start, core_end)
            };
            Some(Milestone {
                start,
                end,
                core_start,
                raw_id,
                edge,
                wrap,
            })
        })
        .collect()
}

/// Canonical milestone token.
pub fn milestone_token(id: &str, edge: Edge, wrapped: bool) -> String {
    if wrapped {
        format!("==///{id}.{edge}///==")
    } else {
        format!("///{id}.{edge}///")
    }
}

/// Resolve a marker id as written: `C12`/`c12` means `12` unless `is_declared`
/// knows the literal prefixed id.
pub fn canonical_marker_id(raw: &str, is_declared: impl Fn(&str) -> bool) -> String {
    if is_declared(raw) {
        return raw.to_string();
    }
    match ALIAS_ID_RE.captures(raw) {
        Some(caps) => caps[1].to_string(),
        None => raw.to_string(),
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CardKind {
    Comment,
    Reply,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CardHeader {
    pub kind: CardKind,
    pub id: String,
    pub author: String,
    pub state: CommentState,
}

impl CardHeader {
    pub fn parse(line: &str) -> Option<Self> {
        let caps = CARD_HEADER_RE.captures(line.trim())?;
        let kind = if caps["kind"].eq_ignore_ascii_case("reply") {
            CardKind::Reply
        } else {
            CardKind::Comment
        };
        Some(Self {
            kind,
            id: caps["id"].to_string(),
            author: caps["author"].trim().to_string(),
            state: CommentState::parse(&caps["state"]),
        })
    }

    pub fn render(&self) -> String {
        let kind = match self.kind {
            CardKind::Comment => "COMMENT",
            CardKind::Reply => "REPLY",
        };
        let author = if self.author.trim().is_empty() {
            "Unknown"
        } else {
            self.author.trim()
        };
        format!("[!{kind} {}: {author} ({})]", self.id, self.state)
    }
}

/// Fields carried by the hidden card annotation, keyed by their wire names.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct CardMeta {
    fields: BTreeMap<&'static str, String>,
}

impl CardMeta {
    pub fn for_comment(comment: &Comment, presence: Option<&Presence>) -> Self {
        let mut meta = Self::default();
        meta.set("author", &comment.author);
        meta.set("date", comment.date.as_deref().unwrap_or(""));
        meta.set("parent", comment.parent_id.as_deref().unwrap_or(""));
        meta.set("state", comment.state.as_str());
        meta.set("paraId", comment.thread_para_key.as_deref().unwrap_or(""));
        meta.set("durableId", comment.durable_id.as_deref().unwrap_or(""));
        if let Some(p) = presence {
            meta.set("presenceProvider", &p.provider_id);
            meta.set("presenceUserId", &p.user_id);
        }
        meta
    }

    /// Set a known key; blank values clear it and unknown keys are ignored.
    pub fn set(&mut self, key: &str, value: &str) {
        let Some(&key) = CARD_META_KEYS.iter().find(|k| **k == key) else {
            return;
        };
        let value = value.trim();
        if value.is_empty() {
            self.fields.remove(key);
        } else {
            self.fields.insert(key, value.to_string());
        }
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.fields.get(key).map(String::as_str)
    }

    /// Fill keys this meta lacks from `other`.
    pub fn merge_missing(&mut self, other: &CardMeta) {
        for (k, v) in &other.fields {
            self.fields.entry(*k).or_insert_with(|| v.clone());
        }
    }

    pub fn render(&self, id: &str) -> String {
        let attrs: Vec<String> = CARD_META_KEYS
            .iter()
            .filter_map(|k| self.fields.get(k).map(|v| (k, v)))
            .map(|(k, v)| {
                let value = Value::String(v.clone()).to_string().replace("-->", "--\\u003e");
                format!("\"{k}\":{value}")
            })
            .collect();
        if attrs.is_empty() {
            format!("<!--CARD_META{{#{id}}}-->")
        } else {
            format!("<!--CARD_META{{#{id} {}}}-->", attrs.join(","))
        }
    }

    /// First annotation in `text`, as `(id, meta)`. A body that is not valid
    /// JSON yields an empty meta so the id still counts.
    pub fn parse(text: &str) -> Option<(String, CardMeta)> {
        let caps = CARD_META_RE.captures(text)?;
        let id = caps["id"].to_string();
        let attrs = caps["attrs"].trim();
        let mut meta = CardMeta::default();
        if attrs.is_empty() {
            return Some((id, meta));
        }
        match serde_json::from_str::<Map<String, Value>>(&format!("{{{attrs}}}")) {
            Ok(map) => {
                for (k, v) in map {
                    let value = match v {
                        Value::String(s) => s,
                        Value::Null => String::new(),
                        other => other.to_string(),
                    };
                    meta.set(&k, &value);
                }
            }
            Err(err) => {
                tracing::warn!(comment = %id, "card metadata is not valid JSON: {err}");
            }
        }
        Some((id, meta))
    }

    pub fn state(&self) -> CommentState {
        CommentState::parse(self.get("state").unwrap_or(""))
    }
}

/// Parsed `key="value"` pairs from a span attribute block, plus `#id` as `id`.
pub fn parse_span_attrs(attrs: &str) -> BTreeMap<String, String> {
    let mut out: BTreeMap<String, String> = KV_ATTR_RE
        .captures_iter(attrs)
        .map(|c| (c[1].to_string(), c[2].to_string()))
        .collect();
    if !out.contains_key("id") {
        if let Some(caps) = HASH_ID_RE.captures(attrs) {
            out.insert("id".to_string(), caps["id"].to_string());
        }
    }
    out
}

/// Drop transport keys from every `{.comment-start ...}` block in rendered
/// text. Code is left as written.
pub fn strip_transport_attrs(text: &str) -> (String, usize) {
    static TRANSPORT_ATTR_RE: Lazy<Regex> = Lazy::new(|| {
        Regex::new(r#"\s+(?:paraId|durableId|presenceProvider|presenceUserId)="[^"]*""#)
            .expect("transport attr regex")
    });
    let mut changed = 0usize;
    let out = map_prose(text, |prose| {
        COMMENT_START_ATTRS_RE
            .replace_all(prose, |caps: &regex::Captures<'_>| {
                let block = &caps[0];
                let stripped = TRANSPORT_ATTR_RE.replace_all(block, "");
                if stripped != block {
                    changed += 1;
                }
                stripped.into_owned()
            })
            .into_owned()
    });
    (out, changed)
}

/// Normalise comment text recovered from Markdown.
pub fn normalize_comment_text(text: &str) -> String {
    static HARD_BREAK_RE: Lazy<Regex> =
        Lazy::new(|| Regex::new(r"\\+[ \t]*\n").expect("hard break regex"));
    static RULE_LINE_RE: Lazy<Regex> =
        Lazy::new(|| Regex::new(r"(?m)^[\u{2014}\u{2015}]\s*$").expect("rule line regex"));

    let text = text.replace("\r\n", "\n").replace('\r', "\n");
    let text = HARD_BREAK_RE.replace_all(&text, "\n");
    let text = text
        .replace(['\u{2018}', '\u{2019}'], "'")
        .replace(['\u{201c}', '\u{201d}'], "\"");
    let text = RULE_LINE_RE.replace_all(&text, "---");
    text.trim().to_string()
}

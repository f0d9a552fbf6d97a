//! Canonical comment model shared by both conversion directions.
//!
//! Word stores comments as flat tables joined by ids and paragraph keys, and the
//! model mirrors that: one flat list of comments, parent links by id, anchors and
//! author presence in side tables.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fmt;

use crate::error::CommentError;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub enum CommentState {
    #[default]
    Active,
    Resolved,
}

impl CommentState {
    /// Anything other than `resolved` (case-insensitive) is active.
    pub fn parse(raw: &str) -> Self {
        if raw.trim().eq_ignore_ascii_case("resolved") {
            CommentState::Resolved
        } else {
            CommentState::Active
        }
    }

    /// `w15:done` flag value.
    pub fn from_done(done: Option<&str>) -> Self {
        match done.map(str::trim) {
            Some("1") | Some("true") | Some("on") => CommentState::Resolved,
            _ => CommentState::Active,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            CommentState::Active => "active",
            CommentState::Resolved => "resolved",
        }
    }

    pub fn done_flag(self) -> &'static str {
        match self {
            CommentState::Active => "0",
            CommentState::Resolved => "1",
        }
    }
}

impl fmt::Display for CommentState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Durable presence identity of an author (`w15:presenceInfo`).
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Presence {
    pub provider_id: String,
    pub user_id: String,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Comment {
    pub id: String,
    pub author: String,
    pub initials: Option<String>,
    pub date: Option<String>,
    pub state: CommentState,
    /// Paragraphs in order; `\n` inside a paragraph is a manual line break.
    pub body: Vec<String>,
    pub parent_id: Option<String>,
    /// Paragraph key of the last body paragraph; joins the extension tables.
    pub thread_para_key: Option<String>,
    pub durable_id: Option<String>,
    pub date_utc: Option<String>,
}

impl Comment {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            ..Self::default()
        }
    }

    pub fn is_root(&self) -> bool {
        self.parent_id.is_none()
    }

    pub fn body_text(&self) -> String {
        self.body.join("\n\n")
    }

    /// Split text on blank lines into body paragraphs.
    pub fn set_body_text(&mut self, text: &str) {
        self.body = split_paragraphs(text);
    }

    pub fn initials_or_default(&self) -> String {
        if let Some(i) = self.initials.as_deref().filter(|s| !s.trim().is_empty()) {
            return i.to_string();
        }
        let letters: String = self
            .author
            .split_whitespace()
            .filter_map(|w| w.chars().next())
            .flat_map(char::to_uppercase)
            .collect();
        if letters.is_empty() {
            "U".to_string()
        } else {
            letters
        }
    }
}

pub fn split_paragraphs(text: &str) -> Vec<String> {
    let text = text.replace("\r\n", "\n");
    let mut out = Vec::new();
    let mut current: Vec<&str> = Vec::new();
    for line in text.split('\n') {
        if line.trim().is_empty() {
            if !current.is_empty() {
                out.push(current.join("\n"));
                current.clear();
            }
        } else {
            current.push(line.trim_end());
        }
    }
    if !current.is_empty() {
        out.push(current.join("\n"));
    }
    out
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum AnchorMarker {
    Start,
    End,
    Reference,
}

impl AnchorMarker {
    pub const ALL: [AnchorMarker; 3] = [AnchorMarker::Start, AnchorMarker::End, AnchorMarker::Reference];

    pub fn from_local_name(local: &str) -> Option<Self> {
        match local {
            "commentRangeStart" => Some(AnchorMarker::Start),
            "commentRangeEnd" => Some(AnchorMarker::End),
            "commentReference" => Some(AnchorMarker::Reference),
            _ => None,
        }
    }

    pub fn element(self) -> &'static str {
        match self {
            AnchorMarker::Start => "w:commentRangeStart",
            AnchorMarker::End => "w:commentRangeEnd",
            AnchorMarker::Reference => "w:commentReference",
        }
    }

    pub fn label(self) -> &'static str {
        match self {
            AnchorMarker::Start => "start marker",
            AnchorMarker::End => "end marker",
            AnchorMarker::Reference => "reference marker",
        }
    }
}

/// Story-level markers seen for one comment id.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Anchor {
    pub comment_id: String,
    pub start: usize,
    pub end: usize,
    pub reference: usize,
    /// Story parts holding at least one marker.
    pub parts: BTreeSet<String>,
}

impl Anchor {
    pub fn new(comment_id: impl Into<String>) -> Self {
        Self {
            comment_id: comment_id.into(),
            ..Self::default()
        }
    }

    pub fn count(&self, marker: AnchorMarker) -> usize {
        match marker {
            AnchorMarker::Start => self.start,
            AnchorMarker::End => self.end,
            AnchorMarker::Reference => self.reference,
        }
    }

    pub fn bump(&mut self, marker: AnchorMarker, part: &str) {
        match marker {
            AnchorMarker::Start => self.start += 1,
            AnchorMarker::End => self.end += 1,
            AnchorMarker::Reference => self.reference += 1,
        }
        self.parts.insert(part.to_string());
    }

    pub fn missing(&self) -> Vec<&'static str> {
        AnchorMarker::ALL
            .iter()
            .filter(|m| self.count(**m) == 0)
            .map(|m| m.label())
            .collect()
    }

    pub fn is_complete(&self) -> bool {
        self.missing().is_empty()
    }
}

/// Author name to presence identity.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct AuthorRegistry {
    by_name: BTreeMap<String, Presence>,
}

impl AuthorRegistry {
    pub fn get(&self, author: &str) -> Option<&Presence> {
        self.by_name.get(author)
    }

    /// First registration for an author wins.
    pub fn register(&mut self, author: &str, presence: Presence) {
        if author.is_empty() || presence.provider_id.is_empty() && presence.user_id.is_empty() {
            return;
        }
        self.by_name.entry(author.to_string()).or_insert(presence);
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &Presence)> {
        self.by_name.iter()
    }

    pub fn is_empty(&self) -> bool {
        self.by_name.is_empty()
    }
}

#[derive(Clone, Debug, Default)]
pub struct CommentModel {
    comments: Vec<Comment>,
    index: HashMap<String, usize>,
    pub authors: AuthorRegistry,
    anchors: BTreeMap<String, Anchor>,
}

impl CommentModel {
    /// Add a comment, rejecting an id that is already present.
    pub fn insert(&mut self, comment: Comment, origin: &str) -> Result<(), CommentError> {
        if self.index.contains_key(&comment.id) {
            return Err(CommentError::DuplicateCommentId {
                id: comment.id,
                part: origin.to_string(),
            });
        }
        self.index.insert(comment.id.clone(), self.comments.len());
        self.comments.push(comment);
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.comments.len()
    }

    pub fn is_empty(&self) -> bool {
        self.comments.is_empty()
    }

    pub fn comments(&self) -> &[Comment] {
        &self.comments
    }

    pub fn comments_mut(&mut self) -> impl Iterator<Item = &mut Comment> {
        self.comments.iter_mut()
    }

    pub fn contains(&self, id: &str) -> bool {
        self.index.contains_key(id)
    }

    pub fn get(&self, id: &str) -> Option<&Comment> {
        self.index.get(id).map(|&i| &self.comments[i])
    }

    pub fn get_mut(&mut self, id: &str) -> Option<&mut Comment> {
        match self.index.get(id) {
            Some(&i) => Some(&mut self.comments[i]),
            None => None,
        }
    }

    pub fn roots(&self) -> impl Iterator<Item = &Comment> {
        self.comments.iter().filter(|c| c.is_root())
    }

    /// Direct replies of `id`, in model order.
    pub fn replies_of(&self, id: &str) -> Vec<&Comment> {
        self.comments
            .iter()
            .filter(|c| c.parent_id.as_deref() == Some(id))
            .collect()
    }

    /// Root of the thread holding `id`; stops on unknown parents or loops.
    pub fn thread_root<'a>(&'a self, id: &'a str) -> &'a str {
        let mut current = id;
        let mut seen = BTreeSet::new();
        while seen.insert(current) {
            match self.get(current).and_then(|c| c.parent_id.as_deref()) {
                Some(parent) if self.contains(parent) => current = parent,
                _ => break,
            }
        }
        current
    }

    /// Every descendant of `root`, depth-first, replies in model order.
    pub fn thread_descendants(&self, root: &str) -> Vec<&Comment> {
        let mut out = Vec::new();
        let mut seen = BTreeSet::new();
        seen.insert(root.to_string());
        self.collect_descendants(root, &mut seen, &mut out);
        out
    }

    fn collect_descendants<'a>(
        &'a self,
        id: &str,
        seen: &mut BTreeSet<String>,
        out: &mut Vec<&'a Comment>,
    ) {
        for reply in self.replies_of(id) {
            if seen.insert(reply.id.clone()) {
                out.push(reply);
                self.collect_descendants(&reply.id, seen, out);
            }
        }
    }

    /// A parent chain that loops back on itself, if any.
    pub fn find_cycle(&self) -> Option<Vec<String>> {
        for c in &self.comments {
            let mut chain = vec![c.id.clone()];
            let mut current = c;
            while let Some(parent) = current.parent_id.as_deref() {
                if let Some(pos) = chain.iter().position(|id| id == parent) {
                    let mut cycle = chain[pos..].to_vec();
                    cycle.push(parent.to_string());
                    return Some(cycle);
                }
                chain.push(parent.to_string());
                match self.get(parent) {
                    Some(p) => current = p,
                    None => break,
                }
            }
        }
        None
    }

    /// Drop comments (and their anchors) by id.
    pub fn remove(&mut self, ids: &BTreeSet<String>) {
        self.comments.retain(|c| !ids.contains(&c.id));
        for id in ids {
            self.anchors.remove(id);
        }
        self.reindex();
    }

    /// Rename comment ids (and parent links and anchors) through `map`.
    pub fn rename(&mut self, map: &BTreeMap<String, String>) {
        for c in &mut self.comments {
            if let Some(new) = map.get(&c.id) {
                c.id = new.clone();
            }
            if let Some(new) = c.parent_id.as_ref().and_then(|p| map.get(p)) {
                c.parent_id = Some(new.clone());
            }
        }
        let anchors = std::mem::take(&mut self.anchors);
        for (id, mut anchor) in anchors {
            let id = map.get(&id).cloned().unwrap_or(id);
            anchor.comment_id = id.clone();
            self.anchors.insert(id, anchor);
        }
        self.reindex();
    }

    fn reindex(&mut self) {
        self.index = self
            .comments
            .iter()
            .enumerate()
            .map(|(i, c)| (c.id.clone(), i))
            .collect();
    }

    pub fn anchor(&self, id: &str) -> Option<&Anchor> {
        self.anchors.get(id)
    }

    pub fn set_anchors(&mut self, anchors: BTreeMap<String, Anchor>) {
        self.anchors = anchors;
    }

    pub fn anchors(&self) -> &BTreeMap<String, Anchor> {
        &self.anchors
    }

    pub fn has_complete_anchor(&self, id: &str) -> bool {
        self.anchor(id).is_some_and(Anchor::is_complete)
    }

    pub fn presence_of(&self, comment: &Comment) -> Option<&Presence> {
        self.authors.get(&comment.author)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn reply(id: &str, parent: &str) -> Comment {
        Comment {
            parent_id: Some(parent.to_string()),
            ..Comment::new(id)
        }
    }

    #[test]
    fn state_normalizes_unknown_values_to_active() {
        assert_eq!(CommentState::parse("Resolved"), CommentState::Resolved);
        assert_eq!(CommentState::parse("pending"), CommentState::Active);
        assert_eq!(CommentState::from_done(Some("1")), CommentState::Resolved);
        assert_eq!(CommentState::from_done(None), CommentState::Active);
    }

    #[test]
    fn duplicate_ids_are_rejected() {
        let mut model = CommentModel::default();
        model.insert(Comment::new("1"), "word/comments.xml").unwrap();
        let err = model.insert(Comment::new("1"), "word/comments.xml").unwrap_err();
        assert!(err.to_string().contains("DuplicateCommentId"));
    }

    #[test]
    fn threads_are_derived_from_parent_links() {
        let mut model = CommentModel::default();
        model.insert(Comment::new("1"), "t").unwrap();
        model.insert(reply("2", "1"), "t").unwrap();
        model.insert(reply("3", "2"), "t").unwrap();
        model.insert(reply("4", "1"), "t").unwrap();
        assert_eq!(model.thread_root("3"), "1");
        let ids: Vec<&str> = model.thread_descendants("1").iter().map(|c| c.id.as_str()).collect();
        assert_eq!(ids, vec!["2", "3", "4"]);
        assert_eq!(model.roots().count(), 1);
        assert!(model.find_cycle().is_none());
    }

    #[test]
    fn cycles_are_reported() {
        let mut model = CommentModel::default();
        model.insert(reply("a", "b"), "t").unwrap();
        model.insert(reply("b", "a"), "t").unwrap();
        let cycle = model.find_cycle().unwrap();
        assert_eq!(cycle.first(), cycle.last());
        assert_eq!(model.thread_root("a"), "b");
    }

    #[test]
    fn rename_follows_parent_links() {
        let mut model = CommentModel::default();
        model.insert(Comment::new("c1"), "t").unwrap();
        model.insert(reply("c2", "c1"), "t").unwrap();
        let map = BTreeMap::from([
            ("c1".to_string(), "0".to_string()),
            ("c2".to_string(), "1".to_string()),
        ]);
        model.rename(&map);
        assert_eq!(model.get("1").unwrap().parent_id.as_deref(), Some("0"));
        assert!(model.get("c1").is_none());
    }

    #[test]
    fn body_paragraphs_keep_manual_breaks() {
        let mut c = Comment::new("1");
        c.set_body_text("first line\nsecond line\n\n\nnext para\n");
        assert_eq!(c.body, vec!["first line\nsecond line", "next para"]);
        assert_eq!(c.body_text(), "first line\nsecond line\n\nnext para");
    }

    #[test]
    fn anchor_reports_missing_markers() {
        let mut a = Anchor::new("1");
        a.bump(AnchorMarker::Start, "word/document.xml");
        a.bump(AnchorMarker::End, "word/document.xml");
        assert_eq!(a.missing(), vec!["reference marker"]);
        a.bump(AnchorMarker::Reference, "word/document.xml");
        assert!(a.is_complete());
    }
}

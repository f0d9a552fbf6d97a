//! Package Model Builder: reads the five comment parts plus story anchors into
//! a [`CommentModel`].

use std::collections::{BTreeMap, BTreeSet, HashMap};

use super::anchors::scan_anchors;
use super::package::DocxPackage;
use super::parts::CommentPart;
use super::xml::{XmlEvent, XmlPart};
use crate::error::CommentError;
use crate::model::{Anchor, Comment, CommentModel, CommentState, Presence};

struct ParsedComment {
    comment: Comment,
    para_ids: Vec<String>,
    legacy_parent: Option<String>,
}

/// Text of one `w:comment` element, paragraph by paragraph.
fn read_comment(part: &XmlPart, start: usize) -> Option<ParsedComment> {
    let head = &part.events[start];
    let id = head.attr("id")?.trim().to_string();
    if id.is_empty() {
        return None;
    }
    let mut comment = Comment::new(id);
    comment.author = head.attr("author").unwrap_or_default().trim().to_string();
    comment.date = head.attr("date").filter(|d| !d.trim().is_empty());
    comment.initials = head.attr("initials").filter(|i| !i.trim().is_empty());
    let legacy_parent = head.attr("parentId").filter(|p| !p.trim().is_empty());

    let mut para_ids = Vec::new();
    let mut paragraphs: Vec<String> = Vec::new();
    let mut in_text = false;
    let range = part.element_range(start);
    let inner = if range.len() >= 2 {
        range.start + 1..range.end - 1
    } else {
        range.end..range.end
    };
    for ev in &part.events[inner] {
        if ev.opens("p") {
            if let Some(pid) = ev.attr("paraId").filter(|p| !p.is_empty()) {
                para_ids.push(pid);
            }
            paragraphs.push(String::new());
            continue;
        }
        if ev.opens("t") {
            in_text = matches!(ev, XmlEvent::Start { .. });
            continue;
        }
        if ev.closes("t") {
            in_text = false;
            continue;
        }
        let Some(current) = paragraphs.last_mut() else {
            continue;
        };
        if ev.opens("tab") {
            current.push('\t');
        } else if ev.opens("br") || ev.opens("cr") {
            current.push('\n');
        } else if let XmlEvent::Text { text } = ev {
            if in_text {
                current.push_str(text);
            }
        }
    }
    comment.body = paragraphs
        .iter()
        .map(|p| p.trim().to_string())
        .filter(|p| !p.is_empty())
        .collect();
    // Word joins the extension tables on the last paragraph's key.
    comment.thread_para_key = para_ids.last().cloned().or_else(|| head.attr("paraId"));
    Some(ParsedComment {
        comment,
        para_ids,
        legacy_parent,
    })
}

fn read_comments(part: &XmlPart) -> Vec<ParsedComment> {
    let mut out = Vec::new();
    let mut i = 0;
    while i < part.events.len() {
        if part.events[i].opens("comment") {
            let range = part.element_range(i);
            match read_comment(part, i) {
                Some(parsed) => out.push(parsed),
                None => tracing::warn!(part = %part.name, "skipping w:comment without w:id"),
            }
            i = range.end;
        } else {
            i += 1;
        }
    }
    out
}

/// Attribute values (by local name) of every `element` row in a flat table part.
fn rows(part: &XmlPart, element: &str, keys: &[&str]) -> Vec<Vec<Option<String>>> {
    part.events
        .iter()
        .filter(|ev| ev.opens(element))
        .map(|ev| {
            keys.iter()
                .map(|k| ev.attr(k).map(|v| v.trim().to_string()).filter(|v| !v.is_empty()))
                .collect()
        })
        .collect()
}

fn read_people(part: &XmlPart) -> Vec<(String, Presence)> {
    let mut out = Vec::new();
    let mut i = 0;
    while i < part.events.len() {
        if !part.events[i].opens("person") {
            i += 1;
            continue;
        }
        let range = part.element_range(i);
        let author = part.events[i].attr("author").unwrap_or_default().trim().to_string();
        let info = part.events[range.clone()].iter().find(|ev| ev.opens("presenceInfo"));
        if let Some(info) = info {
            let presence = Presence {
                provider_id: info.attr("providerId").unwrap_or_default().trim().to_string(),
                user_id: info.attr("userId").unwrap_or_default().trim().to_string(),
            };
            out.push((author, presence));
        }
        i = range.end;
    }
    out
}

fn incomplete(part: CommentPart, ids: BTreeSet<String>, detail: &str) -> anyhow::Error {
    CommentError::IncompletePackageParts {
        part: part.entry().to_string(),
        ids: ids.into_iter().collect(),
        detail: Some(detail.to_string()),
    }
    .into()
}

/// Anchors of every story part in `pkg`, keyed by the ids as written.
pub fn package_anchors(pkg: &DocxPackage) -> anyhow::Result<BTreeMap<String, Anchor>> {
    let mut stories = Vec::new();
    for name in pkg.story_part_names() {
        if let Some(part) = pkg.xml_part(&name)? {
            stories.push(part);
        }
    }
    Ok(scan_anchors(&stories))
}

/// Build the comment model of `pkg`. Missing optional parts are tolerated;
/// cross-part references to comments the primary list lacks are not.
pub fn build_model(pkg: &DocxPackage) -> anyhow::Result<CommentModel> {
    let comments_part = pkg.xml_part(CommentPart::Comments.entry())?;
    let parsed = comments_part.as_ref().map(read_comments).unwrap_or_default();

    let mut model = CommentModel::default();
    let mut para_to_id: HashMap<String, String> = HashMap::new();
    let mut legacy_parents: Vec<(String, String)> = Vec::new();
    for p in parsed {
        for pid in &p.para_ids {
            para_to_id.insert(pid.clone(), p.comment.id.clone());
        }
        if let Some(key) = &p.comment.thread_para_key {
            para_to_id.insert(key.clone(), p.comment.id.clone());
        }
        if let Some(parent) = p.legacy_parent {
            legacy_parents.push((p.comment.id.clone(), parent));
        }
        model.insert(p.comment, CommentPart::Comments.entry())?;
    }

    // Paragraph key <-> durable id.
    let mut durable_by_para: HashMap<String, String> = HashMap::new();
    if let Some(part) = pkg.xml_part(CommentPart::Ids.entry())? {
        let table = rows(&part, "commentId", &["paraId", "durableId"]);
        let keyless: Vec<String> = model
            .comments()
            .iter()
            .filter(|c| c.thread_para_key.is_none())
            .map(|c| c.id.clone())
            .collect();
        if !keyless.is_empty() && keyless.len() == model.len() && table.len() == model.len() {
            tracing::debug!("joining commentsIds to comments by document order");
            let ids: Vec<String> = model.comments().iter().map(|c| c.id.clone()).collect();
            for (id, row) in ids.iter().zip(&table) {
                if let (Some(pid), Some(c)) = (&row[0], model.get_mut(id)) {
                    c.thread_para_key = Some(pid.clone());
                    para_to_id.entry(pid.clone()).or_insert_with(|| id.clone());
                }
            }
        }
        let mut orphans = BTreeSet::new();
        for row in &table {
            let (Some(pid), durable) = (&row[0], &row[1]) else {
                continue;
            };
            if !para_to_id.contains_key(pid) {
                orphans.insert(pid.clone());
            }
            if let Some(d) = durable {
                durable_by_para.insert(pid.clone(), d.clone());
            }
        }
        if !orphans.is_empty() {
            return Err(incomplete(
                CommentPart::Ids,
                orphans,
                "paragraph keys without a comment",
            ));
        }
    }

    // Thread state and reply linkage. This part is authoritative for parents.
    let mut parents: BTreeMap<String, String> = legacy_parents.into_iter().collect();
    if let Some(part) = pkg.xml_part(CommentPart::Extended.entry())? {
        let mut orphans = BTreeSet::new();
        for row in rows(&part, "commentEx", &["paraId", "done", "paraIdParent"]) {
            let Some(pid) = &row[0] else {
                continue;
            };
            let Some(id) = para_to_id.get(pid).cloned() else {
                orphans.insert(pid.clone());
                continue;
            };
            if let Some(c) = model.get_mut(&id) {
                c.state = CommentState::from_done(row[1].as_deref());
                c.thread_para_key = Some(pid.clone());
            }
            if let Some(parent_pid) = &row[2] {
                match para_to_id.get(parent_pid) {
                    Some(parent) => {
                        parents.insert(id, parent.clone());
                    }
                    None => {
                        orphans.insert(parent_pid.clone());
                    }
                }
            }
        }
        if !orphans.is_empty() {
            return Err(incomplete(
                CommentPart::Extended,
                orphans,
                "paragraph keys without a comment",
            ));
        }
    }
    let mut missing_parents = BTreeSet::new();
    for (child, parent) in parents {
        if !model.contains(&parent) {
            missing_parents.insert(parent);
            continue;
        }
        if let Some(c) = model.get_mut(&child) {
            c.parent_id = Some(parent);
        }
    }
    if !missing_parents.is_empty() {
        return Err(incomplete(
            CommentPart::Comments,
            missing_parents,
            "parent ids without a comment",
        ));
    }
    if let Some(chain) = model.find_cycle() {
        return Err(CommentError::ThreadCycle {
            part: CommentPart::Extended.entry().to_string(),
            chain,
        }
        .into());
    }

    let mut date_by_durable: HashMap<String, String> = HashMap::new();
    if let Some(part) = pkg.xml_part(CommentPart::Extensible.entry())? {
        for row in rows(&part, "commentExtensible", &["durableId", "dateUtc"]) {
            if let (Some(d), Some(date)) = (&row[0], &row[1]) {
                date_by_durable.insert(d.clone(), date.clone());
            }
        }
    }
    for c in model.comments_mut() {
        if let Some(key) = &c.thread_para_key {
            c.durable_id = durable_by_para.get(key).cloned();
        }
        if let Some(d) = &c.durable_id {
            c.date_utc = date_by_durable.get(d).cloned();
        }
        if c.thread_para_key.is_none() || c.durable_id.is_none() {
            tracing::debug!(comment = %c.id, "comment lacks key/durable id; will be synthesized on write");
        }
    }

    if let Some(part) = pkg.xml_part(CommentPart::People.entry())? {
        for (author, presence) in read_people(&part) {
            model.authors.register(&author, presence);
        }
    }

    let anchors = package_anchors(pkg)?;
    let mut stray: BTreeMap<String, BTreeSet<String>> = BTreeMap::new();
    for (id, anchor) in &anchors {
        if !model.contains(id) {
            for part in &anchor.parts {
                stray.entry(part.clone()).or_default().insert(id.clone());
            }
        }
    }
    if let Some((part, ids)) = stray.into_iter().next() {
        return Err(CommentError::IncompletePackageParts {
            part,
            ids: ids.into_iter().collect(),
            detail: Some("anchors without a comment".to_string()),
        }
        .into());
    }
    for c in model.comments() {
        match anchors.get(&c.id) {
            Some(a) if a.is_complete() => {}
            Some(a) => tracing::debug!(comment = %c.id, missing = ?a.missing(), "incomplete anchor"),
            None => tracing::debug!(comment = %c.id, "comment has no anchor"),
        }
    }
    model.set_anchors(anchors);
    Ok(model)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::docx::fixtures::{package, threaded_fixture};

    #[test]
    fn builds_thread_with_state_presence_and_anchors() {
        let model = build_model(&threaded_fixture()).unwrap();
        assert_eq!(model.len(), 2);

        let root = model.get("0").unwrap();
        assert_eq!(root.author, "A");
        assert_eq!(root.body, vec!["First para", "Second\nline"]);
        assert_eq!(root.thread_para_key.as_deref(), Some("00000B02"));
        assert_eq!(root.durable_id.as_deref(), Some("1111AAAA"));
        assert_eq!(root.date_utc.as_deref(), Some("2024-01-01T10:00:00Z"));
        assert_eq!(root.state, CommentState::Active);

        let reply = model.get("1").unwrap();
        assert_eq!(reply.parent_id.as_deref(), Some("0"));
        assert_eq!(reply.state, CommentState::Resolved);

        assert_eq!(model.authors.get("A").unwrap().user_id, "a@example.com");
        assert!(model.has_complete_anchor("0"));
        assert!(!model.has_complete_anchor("1"));
    }

    #[test]
    fn id_order_fallback_when_comments_carry_no_keys() {
        let pkg = package(&[
            (
                "word/comments.xml",
                r#"<w:comments xmlns:w="urn:w"><w:comment w:id="5" w:author="A"><w:p><w:r><w:t>x</w:t></w:r></w:p></w:comment></w:comments>"#,
            ),
            (
                "word/commentsIds.xml",
                r#"<w16cid:commentsIds xmlns:w16cid="urn:cid"><w16cid:commentId w16cid:paraId="0AAA0001" w16cid:durableId="0BBB0001"/></w16cid:commentsIds>"#,
            ),
            (
                "word/commentsExtended.xml",
                r#"<w15:commentsEx xmlns:w15="urn:w15"><w15:commentEx w15:paraId="0AAA0001" w15:done="1"/></w15:commentsEx>"#,
            ),
        ]);
        let model = build_model(&pkg).unwrap();
        let c = model.get("5").unwrap();
        assert_eq!(c.thread_para_key.as_deref(), Some("0AAA0001"));
        assert_eq!(c.durable_id.as_deref(), Some("0BBB0001"));
        assert_eq!(c.state, CommentState::Resolved);
    }

    #[test]
    fn extension_entry_for_unknown_comment_fails() {
        let pkg = package(&[
            (
                "word/comments.xml",
                r#"<w:comments xmlns:w="urn:w" xmlns:w14="urn:w14"><w:comment w:id="1"><w:p w14:paraId="00000001"/></w:comment></w:comments>"#,
            ),
            (
                "word/commentsExtended.xml",
                r#"<w15:commentsEx xmlns:w15="urn:w15"><w15:commentEx w15:paraId="00000001" w15:paraIdParent="0000FFFF"/></w15:commentsEx>"#,
            ),
        ]);
        let err = build_model(&pkg).unwrap_err();
        let msg = err.to_string();
        assert!(msg.contains("IncompletePackageParts"), "{msg}");
        assert!(msg.contains("0000FFFF"));
    }

    #[test]
    fn anchors_without_comments_fail() {
        let pkg = package(&[(
            "word/document.xml",
            r#"<w:document xmlns:w="urn:w"><w:body><w:p><w:commentRangeStart w:id="3"/></w:p></w:body></w:document>"#,
        )]);
        let err = build_model(&pkg).unwrap_err();
        match err.downcast_ref::<CommentError>() {
            Some(CommentError::IncompletePackageParts { part, ids, .. }) => {
                assert_eq!(part, "word/document.xml");
                assert_eq!(ids, &vec!["3".to_string()]);
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn duplicate_comment_ids_fail() {
        let pkg = package(&[(
            "word/comments.xml",
            r#"<w:comments xmlns:w="urn:w"><w:comment w:id="1"/><w:comment w:id="1"/></w:comments>"#,
        )]);
        let err = build_model(&pkg).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<CommentError>(),
            Some(CommentError::DuplicateCommentId { .. })
        ));
    }

    #[test]
    fn package_without_comments_builds_empty_model() {
        let pkg = package(&[(
            "word/document.xml",
            r#"<w:document xmlns:w="urn:w"><w:body><w:p/></w:body></w:document>"#,
        )]);
        assert!(build_model(&pkg).unwrap().is_empty());
    }
}

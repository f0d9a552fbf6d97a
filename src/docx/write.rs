//! Package Model Writer: regenerates the five comment parts from a reconciled
//! model, fixes up story anchors, and wires the parts into the package.
//!
//! Nothing is written to disk here; the caller gets a [`PartChanges`] only
//! when every part and anchor is consistent.

use std::collections::{BTreeMap, BTreeSet};

use super::anchors::{place_beside_parent, prune, remap_ids, scan_anchors};
use super::manifest::wire_parts;
use super::package::{DocxPackage, PartChanges};
use super::parts::{CommentPart, COMMENT_PART_NAMESPACES};
use super::xml::{write_xml_part, XmlEvent, XmlPart};
use crate::error::CommentError;
use crate::model::{AnchorMarker, Comment, CommentModel};
use crate::reconcile::WritePlan;

/// `textId` Word writes when it has no revision-tracking text id of its own.
const DEFAULT_TEXT_ID: &str = "77777777";

struct Story {
    part: XmlPart,
    dirty: bool,
}

fn load_stories(pkg: &DocxPackage) -> anyhow::Result<Vec<Story>> {
    let mut out = Vec::new();
    for name in pkg.story_part_names() {
        if let Some(part) = pkg.xml_part(&name)? {
            out.push(Story { part, dirty: false });
        }
    }
    Ok(out)
}

/// Add the missing markers of `child` beside its parent's; an error names
/// whatever could not be placed.
fn synthesize_reply(stories: &mut [Story], child: &str, parent: &str) -> Result<(), CommentError> {
    let parts: Vec<XmlPart> = stories.iter().map(|s| s.part.clone()).collect();
    let present = scan_anchors(&parts);
    let have = present.get(child);
    let mut missing = Vec::new();
    for marker in AnchorMarker::ALL {
        if have.is_some_and(|a| a.count(marker) > 0) {
            continue;
        }
        let placed = stories.iter_mut().any(|s| {
            let ok = place_beside_parent(&mut s.part, marker, parent, child);
            s.dirty |= ok;
            ok
        });
        if !placed {
            missing.push(marker.label());
        }
    }
    if missing.is_empty() {
        Ok(())
    } else {
        Err(CommentError::IncompleteAnchorSynthesis {
            id: child.to_string(),
            missing,
            reason: format!("parent comment {parent} has no matching marker to place it beside"),
        })
    }
}

/// Every comment must end with a complete anchor, and no anchor may outlive its comment.
fn verify_anchors(stories: &[Story], model: &CommentModel) -> anyhow::Result<()> {
    let parts: Vec<XmlPart> = stories.iter().map(|s| s.part.clone()).collect();
    let anchors = scan_anchors(&parts);
    for c in model.comments() {
        let missing = match anchors.get(&c.id) {
            Some(a) => a.missing(),
            None => AnchorMarker::ALL.iter().map(|m| m.label()).collect(),
        };
        if !missing.is_empty() {
            return Err(CommentError::IncompleteAnchorSynthesis {
                id: c.id.clone(),
                missing,
                reason: "the converted document carries no complete anchor for it".to_string(),
            }
            .into());
        }
    }
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
            detail: Some("anchors left without a comment".to_string()),
        }
        .into());
    }
    Ok(())
}

/// Runs for one body paragraph: text split on manual breaks and tabs.
fn paragraph_runs(text: &str) -> Vec<XmlEvent> {
    let mut out = Vec::new();
    if text.is_empty() {
        return out;
    }
    out.push(XmlEvent::start("w:r", &[]));
    for (i, line) in text.split('\n').enumerate() {
        if i > 0 {
            out.push(XmlEvent::empty("w:br", &[]));
        }
        for (j, piece) in line.split('\t').enumerate() {
            if j > 0 {
                out.push(XmlEvent::empty("w:tab", &[]));
            }
            if piece.is_empty() {
                continue;
            }
            out.push(XmlEvent::start("w:t", &[("xml:space", "preserve")]));
            out.push(XmlEvent::text(piece));
            out.push(XmlEvent::end("w:t"));
        }
    }
    out.push(XmlEvent::end("w:r"));
    out
}

fn comment_element(c: &Comment, keys: &[String]) -> Vec<XmlEvent> {
    let initials = c.initials_or_default();
    let mut attrs: Vec<(&str, &str)> = vec![("w:id", c.id.as_str()), ("w:author", c.author.as_str())];
    if let Some(date) = c.date.as_deref() {
        attrs.push(("w:date", date));
    }
    attrs.push(("w:initials", initials.as_str()));

    let mut out = vec![XmlEvent::start("w:comment", &attrs)];
    let empty = [String::new()];
    let body: &[String] = if c.body.is_empty() { &empty } else { &c.body };
    for (i, para) in body.iter().enumerate() {
        let key = keys.get(i).map(String::as_str).unwrap_or_default();
        let mut p_attrs = Vec::with_capacity(2);
        if !key.is_empty() {
            p_attrs.push(("w14:paraId", key));
            p_attrs.push(("w14:textId", DEFAULT_TEXT_ID));
        }
        out.push(XmlEvent::start("w:p", &p_attrs));
        out.push(XmlEvent::start("w:pPr", &[]));
        out.push(XmlEvent::empty("w:pStyle", &[("w:val", "CommentText")]));
        out.push(XmlEvent::end("w:pPr"));
        if i == 0 {
            out.push(XmlEvent::start("w:r", &[]));
            out.push(XmlEvent::start("w:rPr", &[]));
            out.push(XmlEvent::empty("w:rStyle", &[("w:val", "CommentReference")]));
            out.push(XmlEvent::end("w:rPr"));
            out.push(XmlEvent::empty("w:annotationRef", &[]));
            out.push(XmlEvent::end("w:r"));
        }
        out.extend(paragraph_runs(para));
        out.push(XmlEvent::end("w:p"));
    }
    out.push(XmlEvent::end("w:comment"));
    out
}

fn comment_part(part: CommentPart, root: &str, body: Vec<XmlEvent>) -> anyhow::Result<Vec<u8>> {
    write_xml_part(&XmlPart::with_root(part.entry(), root, &COMMENT_PART_NAMESPACES, body))
}

/// Thread key and durable id of every comment, or the ids lacking one.
fn keys_of(model: &CommentModel) -> anyhow::Result<BTreeMap<String, (String, String)>> {
    let mut keys = BTreeMap::new();
    let mut lacking = BTreeSet::new();
    for c in model.comments() {
        match (c.thread_para_key.as_ref(), c.durable_id.as_ref()) {
            (Some(k), Some(d)) => {
                keys.insert(c.id.clone(), (k.clone(), d.clone()));
            }
            _ => {
                lacking.insert(c.id.clone());
            }
        }
    }
    if !lacking.is_empty() {
        return Err(CommentError::IncompletePackageParts {
            part: CommentPart::Ids.entry().to_string(),
            ids: lacking.into_iter().collect(),
            detail: Some("no paragraph key or durable id assigned".to_string()),
        }
        .into());
    }
    Ok(keys)
}

/// Serialize all five comment parts for `plan`.
pub fn render_comment_parts(plan: &WritePlan) -> anyhow::Result<Vec<(CommentPart, Vec<u8>)>> {
    let model = &plan.model;
    let keys = keys_of(model)?;

    let mut comments = Vec::new();
    let mut extended = Vec::new();
    let mut ids = Vec::new();
    let mut extensible = Vec::new();
    for c in model.comments() {
        let (key, durable) = &keys[&c.id];
        let para_keys = plan
            .para_keys
            .get(&c.id)
            .cloned()
            .unwrap_or_else(|| vec![key.clone()]);
        comments.extend(comment_element(c, &para_keys));

        let parent_key = c.parent_id.as_ref().and_then(|p| keys.get(p)).map(|(k, _)| k.as_str());
        let mut ex: Vec<(&str, &str)> = vec![("w15:paraId", key.as_str())];
        if let Some(pk) = parent_key {
            ex.push(("w15:paraIdParent", pk));
        }
        ex.push(("w15:done", c.state.done_flag()));
        extended.push(XmlEvent::empty("w15:commentEx", &ex));

        ids.push(XmlEvent::empty(
            "w16cid:commentId",
            &[("w16cid:paraId", key.as_str()), ("w16cid:durableId", durable.as_str())],
        ));

        let mut cex: Vec<(&str, &str)> = vec![("w16cex:durableId", durable.as_str())];
        if let Some(date) = c.date_utc.as_deref().or(c.date.as_deref()) {
            cex.push(("w16cex:dateUtc", date));
        }
        extensible.push(XmlEvent::empty("w16cex:commentExtensible", &cex));
    }

    let authors: BTreeSet<&str> = model.comments().iter().map(|c| c.author.as_str()).collect();
    let mut people = Vec::new();
    for author in authors {
        let (provider, user) = match model.authors.get(author) {
            Some(p) => (p.provider_id.as_str(), p.user_id.as_str()),
            None => ("None", author),
        };
        people.push(XmlEvent::start("w15:person", &[("w15:author", author)]));
        people.push(XmlEvent::empty(
            "w15:presenceInfo",
            &[("w15:providerId", provider), ("w15:userId", user)],
        ));
        people.push(XmlEvent::end("w15:person"));
    }

    Ok(vec![
        (CommentPart::Comments, comment_part(CommentPart::Comments, "w:comments", comments)?),
        (CommentPart::Extended, comment_part(CommentPart::Extended, "w15:commentsEx", extended)?),
        (CommentPart::Ids, comment_part(CommentPart::Ids, "w16cid:commentsIds", ids)?),
        (
            CommentPart::Extensible,
            comment_part(CommentPart::Extensible, "w16cex:commentsExtensible", extensible)?,
        ),
        (CommentPart::People, comment_part(CommentPart::People, "w15:people", people)?),
    ])
}

/// Compute every part change needed to carry `plan` into `pkg`.
pub fn write_package(pkg: &DocxPackage, plan: &WritePlan) -> anyhow::Result<PartChanges> {
    let mut stories = load_stories(pkg)?;
    for story in &mut stories {
        let renamed = remap_ids(&mut story.part, &plan.id_map);
        let removed = prune(&mut story.part, &plan.pruned);
        if renamed + removed > 0 {
            tracing::debug!(part = %story.part.name, renamed, removed, "story anchors rewritten");
            story.dirty = true;
        }
    }
    for (child, parent) in &plan.synthesize {
        synthesize_reply(&mut stories, child, parent)?;
    }
    verify_anchors(&stories, &plan.model)?;

    let mut changes = PartChanges::default();
    for story in stories.iter().filter(|s| s.dirty) {
        changes.put(&story.part.name, write_xml_part(&story.part)?);
    }

    if plan.model.is_empty() {
        for part in CommentPart::ALL {
            if pkg.contains(part.entry()) {
                changes.put(
                    part.entry(),
                    comment_part(part, empty_root(part), Vec::new())?,
                );
            }
        }
        return Ok(changes);
    }

    for (part, bytes) in render_comment_parts(plan)? {
        changes.put(part.entry(), bytes);
    }
    for (name, bytes) in wire_parts(pkg, &CommentPart::ALL)? {
        changes.put(&name, bytes);
    }
    Ok(changes)
}

fn empty_root(part: CommentPart) -> &'static str {
    match part {
        CommentPart::Comments => "w:comments",
        CommentPart::Extended => "w15:commentsEx",
        CommentPart::Ids => "w16cid:commentsIds",
        CommentPart::Extensible => "w16cex:commentsExtensible",
        CommentPart::People => "w15:people",
    }
}

//! Relationship and content-type declarations for the comment parts.

use anyhow::Context;

use super::package::DocxPackage;
use super::parts::{CommentPart, CONTENT_TYPES, DOCUMENT_RELS, PKG_REL_NS};
use super::xml::{write_xml_part, XmlEvent, XmlPart};

/// Qualified name for a child of `root` using the root's prefix.
fn sibling_name(root: &XmlEvent, local: &str) -> String {
    match root.name().and_then(|n| n.split_once(':')) {
        Some((prefix, _)) => format!("{prefix}:{local}"),
        None => local.to_string(),
    }
}

fn root_index(part: &XmlPart, local: &str) -> anyhow::Result<usize> {
    part.find(local)
        .with_context(|| format!("{} has no <{local}> root", part.name))
}

/// Insert `ev` just before the closing tag of the root at `root`.
fn append_child(part: &mut XmlPart, root: usize, ev: XmlEvent) {
    if let XmlEvent::Empty { name, attrs } = part.events[root].clone() {
        part.events[root] = XmlEvent::Start {
            name: name.clone(),
            attrs,
        };
        part.events.insert(root + 1, ev);
        part.events.insert(root + 2, XmlEvent::End { name });
    } else {
        let close = part.element_range(root).end - 1;
        part.events.insert(close, ev);
    }
}

/// Make `rels` declare every part in `parts`. Returns how many entries changed.
pub fn ensure_relationships(rels: &mut XmlPart, parts: &[CommentPart]) -> anyhow::Result<usize> {
    let root = root_index(rels, "Relationships")?;
    let mut changed = 0;
    for part in parts {
        let existing = rels.events.iter().position(|ev| {
            ev.opens("Relationship") && ev.attr("Type").as_deref() == Some(part.rel_type())
        });
        match existing {
            Some(idx) => {
                if rels.events[idx].attr("Target").as_deref() != Some(part.target()) {
                    rels.events[idx].set_attr("Target", part.target());
                    changed += 1;
                }
            }
            None => {
                let next = next_relationship_id(rels);
                let name = sibling_name(&rels.events[root], "Relationship");
                append_child(
                    rels,
                    root,
                    XmlEvent::empty(
                        &name,
                        &[("Id", next.as_str()), ("Type", part.rel_type()), ("Target", part.target())],
                    ),
                );
                changed += 1;
            }
        }
    }
    Ok(changed)
}

fn next_relationship_id(rels: &XmlPart) -> String {
    let max = rels
        .events
        .iter()
        .filter(|ev| ev.opens("Relationship"))
        .filter_map(|ev| ev.attr("Id"))
        .filter_map(|id| id.strip_prefix("rId").and_then(|n| n.parse::<u32>().ok()))
        .max()
        .unwrap_or(0);
    format!("rId{}", max + 1)
}

/// Make `types` carry an `Override` for every part in `parts`.
pub fn ensure_content_types(types: &mut XmlPart, parts: &[CommentPart]) -> anyhow::Result<usize> {
    let root = root_index(types, "Types")?;
    let mut changed = 0;
    for part in parts {
        let part_name = part.part_name();
        let existing = types.events.iter().position(|ev| {
            ev.opens("Override")
                && ev
                    .attr("PartName")
                    .is_some_and(|p| p.eq_ignore_ascii_case(&part_name))
        });
        match existing {
            Some(idx) => {
                if types.events[idx].attr("ContentType").as_deref() != Some(part.content_type()) {
                    types.events[idx].set_attr("ContentType", part.content_type());
                    changed += 1;
                }
            }
            None => {
                let name = sibling_name(&types.events[root], "Override");
                append_child(
                    types,
                    root,
                    XmlEvent::empty(
                        &name,
                        &[("PartName", part_name.as_str()), ("ContentType", part.content_type())],
                    ),
                );
                changed += 1;
            }
        }
    }
    Ok(changed)
}

/// Updated rels and content-types bytes declaring `parts`.
pub fn wire_parts(pkg: &DocxPackage, parts: &[CommentPart]) -> anyhow::Result<Vec<(String, Vec<u8>)>> {
    let mut out = Vec::with_capacity(2);

    let mut rels = match pkg.xml_part(DOCUMENT_RELS)? {
        Some(p) => p,
        None => XmlPart::with_root(DOCUMENT_RELS, "Relationships", &[("xmlns", PKG_REL_NS)], Vec::new()),
    };
    let n = ensure_relationships(&mut rels, parts)?;
    tracing::debug!(changed = n, "document relationships");
    out.push((DOCUMENT_RELS.to_string(), write_xml_part(&rels)?));

    let mut types = pkg
        .xml_part(CONTENT_TYPES)?
        .with_context(|| format!("package has no {CONTENT_TYPES}"))?;
    let n = ensure_content_types(&mut types, parts)?;
    tracing::debug!(changed = n, "content types");
    out.push((CONTENT_TYPES.to_string(), write_xml_part(&types)?));

    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::docx::xml::parse_xml_part;

    const RELS: &str = r#"<?xml version="1.0" encoding="UTF-8"?><Relationships xmlns="http://schemas.openxmlformats.org/package/2006/relationships"><Relationship Id="rId1" Type="http://schemas.openxmlformats.org/officeDocument/2006/relationships/styles" Target="styles.xml"/><Relationship Id="rId7" Type="http://schemas.openxmlformats.org/officeDocument/2006/relationships/comments" Target="old/comments.xml"/></Relationships>"#;

    #[test]
    fn relationships_reuse_type_and_number_new_ids() {
        let mut rels = parse_xml_part(DOCUMENT_RELS, RELS.as_bytes()).unwrap();
        let changed = ensure_relationships(&mut rels, &CommentPart::ALL).unwrap();
        assert_eq!(changed, 5);
        let out = String::from_utf8(write_xml_part(&rels).unwrap()).unwrap();
        assert!(out.contains(r#"Id="rId7" Type="http://schemas.openxmlformats.org/officeDocument/2006/relationships/comments" Target="comments.xml""#));
        assert!(out.contains(r#"<Relationship Id="rId8" Type="http://schemas.microsoft.com/office/2011/relationships/commentsExtended" Target="commentsExtended.xml"/>"#));
        assert!(out.contains(r#"Id="rId11""#));
        assert_eq!(out.matches("<Relationship ").count(), 6);

        assert_eq!(ensure_relationships(&mut rels, &CommentPart::ALL).unwrap(), 0);
    }

    #[test]
    fn content_types_gain_overrides_once() {
        let xml = r#"<Types xmlns="http://schemas.openxmlformats.org/package/2006/content-types"><Default Extension="xml" ContentType="application/xml"/></Types>"#;
        let mut types = parse_xml_part(CONTENT_TYPES, xml.as_bytes()).unwrap();
        assert_eq!(ensure_content_types(&mut types, &CommentPart::ALL).unwrap(), 5);
        assert_eq!(ensure_content_types(&mut types, &CommentPart::ALL).unwrap(), 0);
        let out = String::from_utf8(write_xml_part(&types).unwrap()).unwrap();
        assert!(out.contains(r#"<Override PartName="/word/people.xml" ContentType="application/vnd.openxmlformats-officedocument.wordprocessingml.people+xml"/></Types>"#));
    }

    #[test]
    fn empty_root_is_opened_before_appending() {
        let mut types = parse_xml_part(CONTENT_TYPES, br#"<Types xmlns="urn:ct"/>"#).unwrap();
        ensure_content_types(&mut types, &[CommentPart::Comments]).unwrap();
        let out = String::from_utf8(write_xml_part(&types).unwrap()).unwrap();
        assert!(out.starts_with(r#"<Types xmlns="urn:ct"><Override PartName="/word/comments.xml""#));
        assert!(out.ends_with("</Types>"));
    }
}

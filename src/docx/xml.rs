use std::borrow::Cow;
use std::ops::Range;

use anyhow::Context;
use quick_xml::escape::{escape, unescape};
use quick_xml::events::{BytesDecl, BytesStart, Event};
use quick_xml::Reader;

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum XmlEvent {
    Decl {
        version: String,
        encoding: Option<String>,
        standalone: Option<String>,
    },
    Start {
        name: String,
        attrs: Vec<(String, String)>,
    },
    End {
        name: String,
    },
    Empty {
        name: String,
        attrs: Vec<(String, String)>,
    },
    Text {
        text: String,
    },
    CData {
        text: String,
    },
    Comment {
        text: String,
    },
    PI {
        content: String,
    },
    DocType {
        text: String,
    },
}

impl XmlEvent {
    /// Element with attribute values given unescaped; they are escaped here.
    pub fn start(name: &str, attrs: &[(&str, &str)]) -> Self {
        XmlEvent::Start {
            name: name.to_string(),
            attrs: escaped_attrs(attrs),
        }
    }

    pub fn empty(name: &str, attrs: &[(&str, &str)]) -> Self {
        XmlEvent::Empty {
            name: name.to_string(),
            attrs: escaped_attrs(attrs),
        }
    }

    pub fn end(name: &str) -> Self {
        XmlEvent::End {
            name: name.to_string(),
        }
    }

    pub fn text(text: impl Into<String>) -> Self {
        XmlEvent::Text { text: text.into() }
    }

    /// Qualified element name for Start/Empty/End events.
    pub fn name(&self) -> Option<&str> {
        match self {
            XmlEvent::Start { name, .. } | XmlEvent::Empty { name, .. } | XmlEvent::End { name } => {
                Some(name.as_str())
            }
            _ => None,
        }
    }

    pub fn attrs(&self) -> &[(String, String)] {
        match self {
            XmlEvent::Start { attrs, .. } | XmlEvent::Empty { attrs, .. } => attrs,
            _ => &[],
        }
    }

    /// True for a Start or Empty event whose local name is `local`.
    pub fn opens(&self, local: &str) -> bool {
        matches!(self, XmlEvent::Start { name, .. } | XmlEvent::Empty { name, .. } if local_name(name) == local)
    }

    pub fn closes(&self, local: &str) -> bool {
        matches!(self, XmlEvent::End { name } if local_name(name) == local)
    }

    /// Unescaped value of the attribute whose local name is `local`.
    pub fn attr(&self, local: &str) -> Option<String> {
        attr_value(self.attrs(), local)
    }

    /// Set (or add) an attribute by qualified name; `value` is unescaped.
    pub fn set_attr(&mut self, qname: &str, value: &str) {
        if let XmlEvent::Start { attrs, .. } | XmlEvent::Empty { attrs, .. } = self {
            let escaped = escape(value).into_owned();
            for (k, v) in attrs.iter_mut() {
                if k == qname {
                    *v = escaped;
                    return;
                }
            }
            attrs.push((qname.to_string(), escaped));
        }
    }
}

fn escaped_attrs(attrs: &[(&str, &str)]) -> Vec<(String, String)> {
    attrs
        .iter()
        .map(|(k, v)| (k.to_string(), escape(*v).into_owned()))
        .collect()
}

#[derive(Clone, Debug)]
pub struct XmlPart {
    pub name: String,
    pub events: Vec<XmlEvent>,
}

impl XmlPart {
    /// A fresh part: declaration, root element with `namespaces`, then `body`.
    pub fn with_root(
        name: &str,
        root: &str,
        namespaces: &[(&str, &str)],
        body: Vec<XmlEvent>,
    ) -> Self {
        let mut events = Vec::with_capacity(body.len() + 3);
        events.push(XmlEvent::Decl {
            version: "1.0".to_string(),
            encoding: Some("UTF-8".to_string()),
            standalone: Some("yes".to_string()),
        });
        events.push(XmlEvent::start(root, namespaces));
        events.extend(body);
        events.push(XmlEvent::end(root));
        Self {
            name: name.to_string(),
            events,
        }
    }

    /// Index of the first Start/Empty event for `local`.
    pub fn find(&self, local: &str) -> Option<usize> {
        self.events.iter().position(|ev| ev.opens(local))
    }

    /// Index range covering the element opened at `start` (inclusive of its End).
    pub fn element_range(&self, start: usize) -> Range<usize> {
        element_range(&self.events, start)
    }

    /// Index of the nearest enclosing Start event with local name `local`.
    pub fn enclosing(&self, idx: usize, local: &str) -> Option<usize> {
        let mut depth = 0usize;
        for i in (0..idx).rev() {
            match &self.events[i] {
                XmlEvent::End { .. } => depth += 1,
                XmlEvent::Start { name, .. } => {
                    if depth == 0 {
                        if local_name(name) == local {
                            return Some(i);
                        }
                    } else {
                        depth -= 1;
                    }
                }
                _ => {}
            }
        }
        None
    }
}

pub fn element_range(events: &[XmlEvent], start: usize) -> Range<usize> {
    match events.get(start) {
        Some(XmlEvent::Start { .. }) => {
            let mut depth = 0usize;
            for (i, ev) in events.iter().enumerate().skip(start) {
                match ev {
                    XmlEvent::Start { .. } => depth += 1,
                    XmlEvent::End { .. } => {
                        depth -= 1;
                        if depth == 0 {
                            return start..i + 1;
                        }
                    }
                    _ => {}
                }
            }
            start..events.len()
        }
        Some(_) => start..start + 1,
        None => start..start,
    }
}

pub fn local_name(name: &str) -> &str {
    name.rsplit_once(':').map(|(_, l)| l).unwrap_or(name)
}

pub fn attr_value(attrs: &[(String, String)], local: &str) -> Option<String> {
    attrs
        .iter()
        .find(|(k, _)| local_name(k) == local && !k.starts_with("xmlns"))
        .map(|(_, v)| unescape(v).map(Cow::into_owned).unwrap_or_else(|_| v.clone()))
}

pub fn parse_xml_part(name: &str, xml_bytes: &[u8]) -> anyhow::Result<XmlPart> {
    let mut reader = Reader::from_reader(xml_bytes);
    reader.config_mut().trim_text(false);

    let mut events: Vec<XmlEvent> = Vec::new();
    let mut buf = Vec::new();
    loop {
        buf.clear();
        let ev = reader
            .read_event_into(&mut buf)
            .with_context(|| format!("read xml event in {name}"))?;
        match ev {
            Event::Eof => break,
            Event::Decl(d) => {
                let version = bytes_to_string(d.version().context("decl version")?);
                let encoding = d
                    .encoding()
                    .map(|r| r.map(bytes_to_string))
                    .transpose()
                    .unwrap_or(None);
                let standalone = d
                    .standalone()
                    .map(|r| r.map(bytes_to_string))
                    .transpose()
                    .unwrap_or(None);
                events.push(XmlEvent::Decl {
                    version,
                    encoding,
                    standalone,
                });
            }
            Event::Start(s) => {
                events.push(XmlEvent::Start {
                    name: bytes_to_string(s.name().as_ref()),
                    attrs: collect_attrs(&s)?,
                });
            }
            Event::End(e) => {
                events.push(XmlEvent::End {
                    name: bytes_to_string(e.name().as_ref()),
                });
            }
            Event::Empty(s) => {
                events.push(XmlEvent::Empty {
                    name: bytes_to_string(s.name().as_ref()),
                    attrs: collect_attrs(&s)?,
                });
            }
            Event::Text(t) => {
                let txt = t.unescape().context("unescape text")?.into_owned();
                events.push(XmlEvent::Text { text: txt });
            }
            Event::CData(t) => {
                let txt = bytes_to_string(t.into_inner());
                events.push(XmlEvent::CData { text: txt });
            }
            Event::Comment(t) => {
                let txt = bytes_to_string(t.into_inner());
                events.push(XmlEvent::Comment { text: txt });
            }
            Event::PI(t) => {
                let target = bytes_to_string(t.target());
                let content = bytes_to_string(t.content());
                events.push(XmlEvent::PI {
                    content: format!("{target}{content}"),
                });
            }
            Event::DocType(t) => {
                let txt = bytes_to_string(t.into_inner());
                events.push(XmlEvent::DocType { text: txt });
            }
        }
    }

    Ok(XmlPart {
        name: name.to_string(),
        events,
    })
}

fn collect_attrs(s: &BytesStart<'_>) -> anyhow::Result<Vec<(String, String)>> {
    let mut attrs: Vec<(String, String)> = Vec::new();
    for a in s.attributes() {
        let a = a.context("attr")?;
        let key = bytes_to_string(a.key.as_ref());
        // Raw (still escaped) bytes; character references must survive a rewrite untouched.
        let val = bytes_to_string(a.value.as_ref());
        attrs.push((key, val));
    }
    Ok(attrs)
}

fn bytes_to_string(bytes: impl AsRef<[u8]>) -> String {
    String::from_utf8_lossy(bytes.as_ref()).into_owned()
}

pub fn write_xml_part(part: &XmlPart) -> anyhow::Result<Vec<u8>> {
    let mut out: Vec<u8> = Vec::new();

    fn escape_text_into(out: &mut Vec<u8>, text: &str) {
        for ch in text.chars() {
            match ch {
                '&' => out.extend_from_slice(b"&amp;"),
                '<' => out.extend_from_slice(b"&lt;"),
                '>' => out.extend_from_slice(b"&gt;"),
                _ => {
                    let mut buf = [0u8; 4];
                    out.extend_from_slice(ch.encode_utf8(&mut buf).as_bytes());
                }
            }
        }
    }

    fn write_start_like(out: &mut Vec<u8>, name: &str, attrs: &[(String, String)], empty: bool) {
        out.extend_from_slice(b"<");
        out.extend_from_slice(name.as_bytes());
        // Attribute values are stored escaped already.
        for (k, v) in attrs {
            out.extend_from_slice(b" ");
            out.extend_from_slice(k.as_bytes());
            out.extend_from_slice(b"=\"");
            out.extend_from_slice(v.as_bytes());
            out.extend_from_slice(b"\"");
        }
        if empty {
            out.extend_from_slice(b"/>");
        } else {
            out.extend_from_slice(b">");
        }
    }

    for ev in &part.events {
        match ev {
            XmlEvent::Decl {
                version,
                encoding,
                standalone,
            } => {
                let d =
                    BytesDecl::new(version.as_str(), encoding.as_deref(), standalone.as_deref());
                let mut writer = quick_xml::Writer::new(Vec::new());
                writer.write_event(Event::Decl(d)).context("write decl")?;
                out.extend_from_slice(&writer.into_inner());
            }
            XmlEvent::Start { name, attrs } => {
                write_start_like(&mut out, name, attrs, false);
            }
            XmlEvent::End { name } => {
                out.extend_from_slice(b"</");
                out.extend_from_slice(name.as_bytes());
                out.extend_from_slice(b">");
            }
            XmlEvent::Empty { name, attrs } => {
                write_start_like(&mut out, name, attrs, true);
            }
            XmlEvent::Text { text } => {
                escape_text_into(&mut out, text);
            }
            XmlEvent::CData { text } => {
                out.extend_from_slice(b"<![CDATA[");
                out.extend_from_slice(text.as_bytes());
                out.extend_from_slice(b"]]>");
            }
            XmlEvent::Comment { text } => {
                out.extend_from_slice(b"<!--");
                out.extend_from_slice(text.as_bytes());
                out.extend_from_slice(b"-->");
            }
            XmlEvent::PI { content } => {
                out.extend_from_slice(b"<?");
                out.extend_from_slice(content.as_bytes());
                out.extend_from_slice(b"?>");
            }
            XmlEvent::DocType { text } => {
                out.extend_from_slice(b"<!DOCTYPE");
                out.extend_from_slice(text.as_bytes());
                out.extend_from_slice(b">");
            }
        }
    }

    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn write_preserves_attr_entity_refs() {
        let xml = br#"<?xml version="1.0" encoding="UTF-8"?><root xmlns:o="urn:test" o:gfxdata="A&#xD;&#xA;B"/>"#;
        let part = parse_xml_part("test.xml", xml).expect("parse xml");
        let out = write_xml_part(&part).expect("write xml");
        let s = String::from_utf8(out).expect("utf8");

        assert!(s.contains(r#"o:gfxdata="A&#xD;&#xA;B""#));
        assert!(!s.contains(r#"o:gfxdata="A&amp;#xD;"#));
    }

    #[test]
    fn attrs_match_by_local_name_and_unescape() {
        let xml = br#"<w:comment xmlns:w="urn:w" w:id="3" w:author="Tom &amp; Jerry"/>"#;
        let part = parse_xml_part("comments.xml", xml).expect("parse");
        let ev = &part.events[0];
        assert!(ev.opens("comment"));
        assert_eq!(ev.attr("id").as_deref(), Some("3"));
        assert_eq!(ev.attr("author").as_deref(), Some("Tom & Jerry"));
    }

    #[test]
    fn built_attrs_are_escaped_once() {
        let part = XmlPart::with_root(
            "people.xml",
            "w15:people",
            &[("xmlns:w15", "urn:w15")],
            vec![XmlEvent::empty("w15:person", &[("w15:author", "A <B> & \"C\"")])],
        );
        let s = String::from_utf8(write_xml_part(&part).unwrap()).unwrap();
        assert!(s.contains(r#"w15:author="A &lt;B&gt; &amp; &quot;C&quot;""#));
        let back = parse_xml_part("people.xml", s.as_bytes()).unwrap();
        let person = back.find("person").unwrap();
        assert_eq!(back.events[person].attr("author").as_deref(), Some("A <B> & \"C\""));
    }

    #[test]
    fn element_range_and_enclosing() {
        let xml = br#"<w:p><w:r><w:rPr/><w:commentReference w:id="1"/></w:r></w:p>"#;
        let part = parse_xml_part("document.xml", xml).unwrap();
        let reference = part.find("commentReference").unwrap();
        let run = part.enclosing(reference, "r").unwrap();
        assert_eq!(run, 1);
        assert_eq!(part.element_range(run), 1..5);
        assert_eq!(part.element_range(reference), reference..reference + 1);
    }
}

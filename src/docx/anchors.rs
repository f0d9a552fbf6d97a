//! Comment anchors inside story parts (`commentRangeStart`, `commentRangeEnd`,
//! and the `commentReference` run).

use std::collections::{BTreeMap, BTreeSet};
use std::ops::Range;

use super::xml::{local_name, XmlEvent, XmlPart};
use crate::model::{Anchor, AnchorMarker};

fn marker_of(ev: &XmlEvent) -> Option<(AnchorMarker, String)> {
    let name = match ev {
        XmlEvent::Start { name, .. } | XmlEvent::Empty { name, .. } => name,
        _ => return None,
    };
    let marker = AnchorMarker::from_local_name(local_name(name))?;
    let id = ev.attr("id")?.trim().to_string();
    if id.is_empty() {
        return None;
    }
    Some((marker, id))
}

/// Count every marker per comment id across `stories`.
pub fn scan_anchors(stories: &[XmlPart]) -> BTreeMap<String, Anchor> {
    let mut anchors: BTreeMap<String, Anchor> = BTreeMap::new();
    for part in stories {
        for ev in &part.events {
            if let Some((marker, id)) = marker_of(ev) {
                anchors
                    .entry(id.clone())
                    .or_insert_with(|| Anchor::new(id))
                    .bump(marker, &part.name);
            }
        }
    }
    anchors
}

/// Ids in order of their first START marker across `stories`.
pub fn start_order(stories: &[XmlPart]) -> Vec<String> {
    let mut seen = BTreeSet::new();
    let mut out = Vec::new();
    for part in stories {
        for ev in &part.events {
            if let Some((AnchorMarker::Start, id)) = marker_of(ev) {
                if seen.insert(id.clone()) {
                    out.push(id);
                }
            }
        }
    }
    out
}

/// Rewrite marker ids through `map`; returns how many markers changed.
pub fn remap_ids(part: &mut XmlPart, map: &BTreeMap<String, String>) -> usize {
    let mut changed = 0;
    for ev in &mut part.events {
        let Some((_, id)) = marker_of(ev) else {
            continue;
        };
        let Some(new_id) = map.get(&id) else {
            continue;
        };
        if let XmlEvent::Start { attrs, .. } | XmlEvent::Empty { attrs, .. } = ev {
            for (k, v) in attrs.iter_mut() {
                if local_name(k) == "id" {
                    *v = new_id.clone();
                }
            }
            changed += 1;
        }
    }
    changed
}

/// Remove every marker of the given ids. A reference run left with nothing
/// but run properties goes with it.
pub fn prune(part: &mut XmlPart, ids: &BTreeSet<String>) -> usize {
    let mut ranges: Vec<Range<usize>> = Vec::new();
    for (idx, ev) in part.events.iter().enumerate() {
        let Some((marker, id)) = marker_of(ev) else {
            continue;
        };
        if !ids.contains(&id) {
            continue;
        }
        let own = part.element_range(idx);
        let range = match marker {
            AnchorMarker::Reference => match part.enclosing(idx, "r") {
                Some(run) if run_holds_only(part, run, &own) => part.element_range(run),
                _ => own,
            },
            _ => own,
        };
        ranges.push(range);
    }
    let removed = ranges.len();
    ranges.sort_by_key(|r| r.start);
    let mut merged: Vec<Range<usize>> = Vec::with_capacity(ranges.len());
    for r in ranges {
        match merged.last_mut() {
            Some(last) if r.start < last.end => last.end = last.end.max(r.end),
            _ => merged.push(r),
        }
    }
    for r in merged.into_iter().rev() {
        part.events.drain(r);
    }
    removed
}

/// True when the run at `run` contains only `rPr`, whitespace text, and `inner`.
fn run_holds_only(part: &XmlPart, run: usize, inner: &Range<usize>) -> bool {
    let range = part.element_range(run);
    let mut i = range.start + 1;
    let end = range.end.saturating_sub(1);
    while i < end {
        if inner.contains(&i) {
            i = inner.end;
            continue;
        }
        let ev = &part.events[i];
        if ev.opens("rPr") {
            i = part.element_range(i).end;
            continue;
        }
        match ev {
            XmlEvent::Text { text } if text.trim().is_empty() => i += 1,
            _ => return false,
        }
    }
    true
}

fn find_marker(part: &XmlPart, marker: AnchorMarker, id: &str) -> Option<usize> {
    part.events
        .iter()
        .position(|ev| marker_of(ev).is_some_and(|(m, found)| m == marker && found == id))
}

fn marker_element(marker: AnchorMarker, id: &str) -> XmlEvent {
    XmlEvent::empty(marker.element(), &[("w:id", id)])
}

/// A `CommentReference`-styled run holding the reference marker for `id`.
pub fn reference_run(id: &str) -> Vec<XmlEvent> {
    vec![
        XmlEvent::start("w:r", &[]),
        XmlEvent::start("w:rPr", &[]),
        XmlEvent::empty("w:rStyle", &[("w:val", "CommentReference")]),
        XmlEvent::end("w:rPr"),
        marker_element(AnchorMarker::Reference, id),
        XmlEvent::end("w:r"),
    ]
}

/// Place `marker` for `child` beside the same marker of `parent` in this part.
/// Returns false when the parent has no such marker here.
pub fn place_beside_parent(part: &mut XmlPart, marker: AnchorMarker, parent: &str, child: &str) -> bool {
    let Some(idx) = find_marker(part, marker, parent) else {
        return false;
    };
    match marker {
        AnchorMarker::Start => {
            let mut at = part.element_range(idx).end;
            while at < part.events.len() && part.events[at].opens("commentRangeStart") {
                at = part.element_range(at).end;
            }
            part.events.insert(at, marker_element(marker, child));
        }
        AnchorMarker::End => {
            let mut at = idx;
            while at > 0 && is_empty_marker(&part.events[at - 1], "commentRangeEnd") {
                at -= 1;
            }
            part.events.insert(at, marker_element(marker, child));
        }
        AnchorMarker::Reference => match part.enclosing(idx, "r") {
            Some(run) => {
                let at = part.element_range(run).end;
                part.events.splice(at..at, reference_run(child));
            }
            None => {
                let at = part.element_range(idx).end;
                part.events.insert(at, marker_element(marker, child));
            }
        },
    }
    true
}

fn is_empty_marker(ev: &XmlEvent, local: &str) -> bool {
    matches!(ev, XmlEvent::Empty { name, .. } if local_name(name) == local)
}

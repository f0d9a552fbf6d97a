//! Images in converted documents.
//!
//! Word shapes with no picture come out of the docx reader as tiny
//! `image<N>` files titled "shape". They are dropped from the tree, and media
//! files extracted by this run that the final Markdown never links are
//! removed again.

use std::collections::BTreeSet;
use std::path::Path;

use anyhow::Context;
use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::Value;

use super::ast::{is, tag, walk_block_lists, walk_inline_lists, Attr};

/// Largest side, in inches, of a shape placeholder.
const PLACEHOLDER_MAX_INCHES: f64 = 0.03;

static PLACEHOLDER_NAME_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^image[0-9]+\.(?:png|jpg|jpeg|gif|bmp|emf|wmf|svg)$").expect("placeholder name regex")
});

static LENGTH_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^\s*(?P<value>[0-9]*\.?[0-9]+(?:[eE][-+]?[0-9]+)?)\s*(?P<unit>[a-zA-Z]*)\s*$")
        .expect("length regex")
});

static IMAGE_REF_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r#"(?s)!\[[^\]]*\]\(<?(?P<md>[^)\s>]+)>?|<img\s[^>]*?src="(?P<html>[^"]+)""#).expect("image ref regex")
});

/// A length attribute in inches; `None` for relative or unknown units.
pub fn length_inches(value: &str) -> Option<f64> {
    let caps = LENGTH_RE.captures(value)?;
    let n: f64 = caps["value"].parse().ok()?;
    let per_inch = match caps["unit"].to_ascii_lowercase().as_str() {
        "" | "in" => 1.0,
        "cm" => 2.54,
        "mm" => 25.4,
        "pt" => 72.0,
        "px" => 96.0,
        _ => return None,
    };
    Some(n / per_inch)
}

/// Source of `node` when it is an empty-alt `shape` image of an extracted
/// `image<N>` file no larger than a few hundredths of an inch.
fn placeholder_source(node: &Value) -> Option<&str> {
    if !is(node, "Image") {
        return None;
    }
    let c = node.get("c")?;
    let alt = c.get(1)?.as_array()?;
    if alt.iter().any(|i| !matches!(tag(i), Some("Space" | "SoftBreak"))) {
        return None;
    }
    let target = c.get(2)?;
    let src = target.get(0)?.as_str()?;
    let title = target.get(1).and_then(Value::as_str).unwrap_or_default();
    if !title.trim().eq_ignore_ascii_case("shape") {
        return None;
    }

    let lower = src.trim().to_ascii_lowercase();
    if !format!("/{lower}").contains("/media/") {
        return None;
    }
    let name = Path::new(&lower).file_name()?.to_str()?;
    if !PLACEHOLDER_NAME_RE.is_match(name) {
        return None;
    }

    let attr = Attr::from_value(c.get(0)?)?;
    let width = length_inches(attr.get("width")?)?;
    let height = length_inches(attr.get("height")?)?;
    (width <= PLACEHOLDER_MAX_INCHES && height <= PLACEHOLDER_MAX_INCHES).then_some(src)
}

fn is_blank_inline(node: &Value) -> bool {
    matches!(tag(node), Some("Space" | "SoftBreak" | "LineBreak"))
}

/// Remove placeholder shape images from `doc`, and the paragraphs they
/// leave empty. Returns the removed image sources.
pub fn strip_placeholder_images(doc: &mut Value) -> Vec<String> {
    let Some(blocks) = doc.get_mut("blocks").and_then(Value::as_array_mut) else {
        return Vec::new();
    };
    let mut removed = Vec::new();
    walk_inline_lists(blocks, &mut |list: &mut Vec<Value>| {
        list.retain(|node| match placeholder_source(node) {
            Some(src) => {
                removed.push(src.to_string());
                false
            }
            None => true,
        });
    });
    if removed.is_empty() {
        return removed;
    }

    walk_block_lists(blocks, &mut |list: &mut Vec<Value>| {
        list.retain(|block| {
            if !matches!(tag(block), Some("Para" | "Plain")) {
                return true;
            }
            block
                .get("c")
                .and_then(Value::as_array)
                .is_some_and(|inlines| !inlines.iter().all(is_blank_inline))
        });
    });
    tracing::debug!(images = removed.len(), "placeholder shape images removed");
    removed
}

/// Paths under `media/` that `text` links as images, relative to `media/`.
pub fn media_refs(text: &str) -> BTreeSet<String> {
    IMAGE_REF_RE
        .captures_iter(text)
        .filter_map(|caps| caps.name("md").or_else(|| caps.name("html")))
        .filter_map(|src| {
            let src = src.as_str().trim();
            let src = src.strip_prefix("./").unwrap_or(src);
            src.strip_prefix("media/").map(str::to_string)
        })
        .collect()
}

/// Every file below `root`, as `/`-separated paths relative to it. A missing
/// root has no files.
pub fn list_files(root: &Path) -> anyhow::Result<BTreeSet<String>> {
    let mut out = BTreeSet::new();
    if root.is_dir() {
        collect_files(root, "", &mut out)?;
    }
    Ok(out)
}

fn collect_files(dir: &Path, prefix: &str, out: &mut BTreeSet<String>) -> anyhow::Result<()> {
    let entries = std::fs::read_dir(dir).with_context(|| format!("read dir: {}", dir.display()))?;
    for entry in entries {
        let entry = entry.with_context(|| format!("read dir: {}", dir.display()))?;
        let name = entry.file_name().to_string_lossy().into_owned();
        let rel = if prefix.is_empty() {
            name
        } else {
            format!("{prefix}/{name}")
        };
        let kind = entry.file_type().with_context(|| format!("stat {}", entry.path().display()))?;
        if kind.is_dir() {
            collect_files(&entry.path(), &rel, out)?;
        } else if kind.is_file() {
            out.insert(rel);
        }
    }
    Ok(())
}

/// Delete files under `media_dir` that appeared after `before` was taken and
/// that `text` does not link, then any directories left empty. Returns the
/// number of files deleted.
pub fn prune_unreferenced_media(media_dir: &Path, before: &BTreeSet<String>, text: &str) -> anyhow::Result<usize> {
    if !media_dir.is_dir() {
        return Ok(0);
    }
    let refs = media_refs(text);
    let mut removed = 0;
    for rel in list_files(media_dir)?.difference(before) {
        if refs.contains(rel) {
            continue;
        }
        let path = media_dir.join(rel);
        std::fs::remove_file(&path).with_context(|| format!("remove {}", path.display()))?;
        tracing::debug!(file = %path.display(), "unreferenced media removed");
        removed += 1;
    }
    remove_empty_dirs(media_dir);
    Ok(removed)
}

/// Remove `dir` and its subdirectories bottom-up where they are empty.
fn remove_empty_dirs(dir: &Path) {
    if let Ok(entries) = std::fs::read_dir(dir) {
        for entry in entries.flatten() {
            if entry.file_type().is_ok_and(|t| t.is_dir()) {
                remove_empty_dirs(&entry.path());
            }
        }
    }
    // Fails while entries remain.
    let _ = std::fs::remove_dir(dir);
}

//! Thread Reconciler: Word-compatible ids, thread keys, durable ids, and the
//! threaded/flattened reply policy, computed before anything is written.

use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::fmt;

use serde::Deserialize;
use sha2::{Digest, Sha256};

use crate::error::CommentError;
use crate::model::{Anchor, Comment, CommentModel};

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReplyPolicy {
    /// Replies stay separate, linked Word comments.
    #[default]
    Threaded,
    /// Replies are folded into their root's body.
    Flattened,
}

impl ReplyPolicy {
    pub fn parse(s: &str) -> anyhow::Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "threaded" | "thread" => Ok(Self::Threaded),
            "flattened" | "flatten" | "flat" => Ok(Self::Flattened),
            other => anyhow::bail!("unknown reply policy: {other} (expected threaded|flattened)"),
        }
    }
}

impl fmt::Display for ReplyPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            ReplyPolicy::Threaded => "threaded",
            ReplyPolicy::Flattened => "flattened",
        })
    }
}

/// Unique 8-hex-digit ids below `0x80000000`, derived from seeds.
#[derive(Debug, Default)]
pub struct KeyAllocator {
    used: HashSet<String>,
}

impl KeyAllocator {
    /// Claim an existing key; false when it is malformed or already taken.
    pub fn reserve(&mut self, key: &str) -> bool {
        let key = key.trim().to_ascii_uppercase();
        let valid = key.len() == 8
            && u32::from_str_radix(&key, 16).is_ok_and(|v| v != 0 && v < 0x8000_0000);
        valid && self.used.insert(key)
    }

    pub fn generate(&mut self, seed: &str) -> String {
        let mut n = 0u32;
        loop {
            let digest = Sha256::digest(format!("{seed}:{n}").as_bytes());
            let value = u32::from_be_bytes([digest[0], digest[1], digest[2], digest[3]]) & 0x7FFF_FFFF;
            let candidate = hex::encode_upper(value.to_be_bytes());
            if value != 0 && self.used.insert(candidate.clone()) {
                return candidate;
            }
            n += 1;
        }
    }

    /// Keep `existing` if it can be reserved, otherwise derive one from `seed`.
    pub fn keep_or_generate(&mut self, existing: Option<&str>, seed: &str) -> String {
        if let Some(key) = existing {
            if self.reserve(key) {
                return key.trim().to_ascii_uppercase();
            }
            tracing::warn!(key, "discarding duplicate or malformed key");
        }
        self.generate(seed)
    }
}

/// Everything the package writer needs, fixed before any part is touched.
#[derive(Debug, Default)]
pub struct WritePlan {
    /// Final comments in parent-before-child order, with Word ids.
    pub model: CommentModel,
    /// Id as written in the converted package -> Word id.
    pub id_map: BTreeMap<String, String>,
    /// Word ids whose story anchors must be removed.
    pub pruned: BTreeSet<String>,
    /// `(reply, parent)` Word ids whose anchors are synthesized beside the parent's.
    pub synthesize: Vec<(String, String)>,
    /// Paragraph keys per comment, one per body paragraph; the last is the thread key.
    pub para_keys: BTreeMap<String, Vec<String>>,
}

/// Ids ordered so every parent precedes its replies; ties keep model order.
pub fn topological_order(model: &CommentModel) -> Vec<String> {
    let mut pending: Vec<&Comment> = model.comments().iter().collect();
    let mut emitted: BTreeSet<&str> = BTreeSet::new();
    let mut out = Vec::with_capacity(pending.len());
    while !pending.is_empty() {
        let before = pending.len();
        pending.retain(|c| {
            let ready = match c.parent_id.as_deref() {
                Some(p) => !model.contains(p) || emitted.contains(p),
                None => true,
            };
            if ready {
                emitted.insert(c.id.as_str());
                out.push(c.id.clone());
            }
            !ready
        });
        if pending.len() == before {
            // Only reachable with a cycle; keep the rest in model order.
            out.extend(pending.drain(..).map(|c| c.id.clone()));
        }
    }
    out
}

/// Decimal ids for Word: numeric ids stay, others get `max + 1` onwards.
pub fn word_id_map(order: &[String]) -> BTreeMap<String, String> {
    let mut next = order
        .iter()
        .filter_map(|id| id.parse::<u64>().ok())
        .max()
        .map(|m| m + 1)
        .unwrap_or(0);
    let mut map = BTreeMap::new();
    for id in order {
        if id.parse::<u64>().is_ok() {
            continue;
        }
        map.insert(id.clone(), next.to_string());
        next += 1;
    }
    map
}

/// The blocks a folded reply contributes to its root's body.
pub fn flattened_reply_blocks(reply: &Comment) -> Vec<String> {
    let who = if reply.author.trim().is_empty() {
        "Unknown"
    } else {
        reply.author.trim()
    };
    let head = match reply.date.as_deref().filter(|d| !d.trim().is_empty()) {
        Some(date) => format!("Reply from: {who} ({date})"),
        None => format!("Reply from: {who}"),
    };
    let mut out = vec!["---".to_string(), head, "---".to_string()];
    out.extend(reply.body.iter().cloned());
    out
}

/// Fold every reply into its root. Returns the removed reply ids.
pub fn flatten(model: &mut CommentModel) -> BTreeSet<String> {
    let roots: Vec<String> = model.roots().map(|c| c.id.clone()).collect();
    let mut folded = BTreeSet::new();
    for root in roots {
        let mut extra = Vec::new();
        for reply in model.thread_descendants(&root) {
            extra.extend(flattened_reply_blocks(reply));
            folded.insert(reply.id.clone());
        }
        if let Some(c) = model.get_mut(&root) {
            c.body.extend(extra);
        }
    }
    // Replies whose chain never reaches a root are dropped with their thread.
    let orphans: Vec<String> = model
        .comments()
        .iter()
        .filter(|c| !c.is_root() && !folded.contains(&c.id))
        .map(|c| c.id.clone())
        .collect();
    for id in orphans {
        tracing::warn!(comment = %id, "reply without a root is dropped when flattening");
        folded.insert(id);
    }
    model.remove(&folded);
    folded
}

/// Reconcile `model` (from Markdown) against the anchors the converter
/// produced (`anchors`, keyed by the ids as written).
pub fn reconcile(
    mut model: CommentModel,
    policy: ReplyPolicy,
    anchors: &BTreeMap<String, Anchor>,
) -> anyhow::Result<WritePlan> {
    if let Some(chain) = model.find_cycle() {
        return Err(CommentError::ThreadCycle {
            part: "comment model".to_string(),
            chain,
        }
        .into());
    }

    let mut pruned = BTreeSet::new();
    if policy == ReplyPolicy::Flattened {
        pruned = flatten(&mut model);
    }

    let order = topological_order(&model);
    // Folded replies still have anchors in the converted package, so they take
    // part in id assignment until those anchors are pruned.
    let all: Vec<String> = order.iter().chain(pruned.iter()).cloned().collect();
    let id_map = word_id_map(&all);
    let word = |id: &str| id_map.get(id).cloned().unwrap_or_else(|| id.to_string());
    let pruned_word: BTreeSet<String> = pruned.iter().map(|id| word(id)).collect();

    let mut synthesize = Vec::new();
    if policy == ReplyPolicy::Threaded {
        for id in &order {
            let Some(c) = model.get(id) else {
                continue;
            };
            let Some(parent) = c.parent_id.as_deref() else {
                continue;
            };
            if !anchors.get(id).is_some_and(Anchor::is_complete) {
                synthesize.push((word(id), word(parent)));
            }
        }
    }

    let mut keys = KeyAllocator::default();
    let mut durables = KeyAllocator::default();
    let mut para_keys = BTreeMap::new();
    let mut ordered = CommentModel::default();
    ordered.authors = model.authors.clone();
    // Existing keys are claimed first so generated ones never collide with them.
    let mut claimed: BTreeMap<String, String> = BTreeMap::new();
    let mut claimed_durable: BTreeMap<String, String> = BTreeMap::new();
    for id in &order {
        let Some(c) = model.get(id) else {
            continue;
        };
        if let Some(k) = c.thread_para_key.as_deref() {
            if keys.reserve(k) {
                claimed.insert(id.clone(), k.trim().to_ascii_uppercase());
            } else {
                tracing::warn!(comment = %id, key = k, "thread key reused or malformed; regenerating");
            }
        }
        if let Some(d) = c.durable_id.as_deref() {
            if durables.reserve(d) {
                claimed_durable.insert(id.clone(), d.trim().to_ascii_uppercase());
            }
        }
    }
    for id in &order {
        let Some(mut c) = model.get(id).cloned() else {
            continue;
        };
        let paragraphs = c.body.len().max(1);
        let mut ids: Vec<String> = (0..paragraphs - 1)
            .map(|i| keys.generate(&format!("comment-{id}-p{i}")))
            .collect();
        let thread_key = match claimed.get(id) {
            Some(k) => k.clone(),
            None => keys.generate(&format!("comment-{id}")),
        };
        ids.push(thread_key.clone());
        let durable = match claimed_durable.get(id) {
            Some(d) => d.clone(),
            None => durables.generate(&format!("durable-{thread_key}")),
        };
        c.thread_para_key = Some(thread_key);
        c.durable_id = Some(durable);
        para_keys.insert(word(id), ids);
        ordered.insert(c, "comment model")?;
    }
    ordered.rename(&id_map);

    Ok(WritePlan {
        model: ordered,
        id_map,
        pruned: pruned_word,
        synthesize,
        para_keys,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{AnchorMarker, CommentState};

    fn comment(id: &str, parent: Option<&str>, body: &[&str]) -> Comment {
        Comment {
            author: format!("author-{id}"),
            parent_id: parent.map(str::to_string),
            body: body.iter().map(|s| s.to_string()).collect(),
            ..Comment::new(id)
        }
    }

    fn complete(id: &str) -> Anchor {
        let mut a = Anchor::new(id);
        for m in AnchorMarker::ALL {
            a.bump(m, "word/document.xml");
        }
        a
    }

    fn model(comments: Vec<Comment>) -> CommentModel {
        let mut m = CommentModel::default();
        for c in comments {
            m.insert(c, "test").unwrap();
        }
        m
    }

    #[test]
    fn generated_keys_are_word_shaped_and_unique() {
        let mut alloc = KeyAllocator::default();
        let a = alloc.generate("comment-1");
        let b = alloc.generate("comment-1");
        assert_ne!(a, b);
        for k in [&a, &b] {
            assert_eq!(k.len(), 8);
            assert!(k.chars().all(|c| c.is_ascii_hexdigit() && !c.is_ascii_lowercase()));
            assert!(u32::from_str_radix(k, 16).unwrap() < 0x8000_0000);
        }
        assert!(!alloc.reserve(&a));
        assert!(!alloc.reserve("FFFFFFFF"));
        assert!(!alloc.reserve("00000000"));
        assert_eq!(KeyAllocator::default().generate("x"), KeyAllocator::default().generate("x"));
    }

    #[test]
    fn topological_order_puts_parents_first() {
        let m = model(vec![
            comment("r2", Some("r1"), &["x"]),
            comment("r1", Some("c1"), &["x"]),
            comment("c1", None, &["x"]),
        ]);
        assert_eq!(topological_order(&m), vec!["c1", "r1", "r2"]);
    }

    #[test]
    fn non_numeric_ids_get_fresh_decimal_ids() {
        let map = word_id_map(&["c1".to_string(), "4".to_string(), "c2".to_string()]);
        assert_eq!(map.get("c1").map(String::as_str), Some("5"));
        assert_eq!(map.get("c2").map(String::as_str), Some("6"));
        assert!(!map.contains_key("4"));
    }

    #[test]
    fn threaded_plan_keeps_all_comments_and_links_parents() {
        let m = model(vec![
            comment("c1", None, &["one", "two"]),
            comment("c2", Some("c1"), &["reply"]),
        ]);
        let anchors = BTreeMap::from([("c1".to_string(), complete("c1"))]);
        let plan = reconcile(m, ReplyPolicy::Threaded, &anchors).unwrap();
        assert_eq!(plan.model.len(), 2);
        assert_eq!(plan.id_map["c1"], "0");
        assert_eq!(plan.id_map["c2"], "1");
        assert_eq!(plan.model.get("1").unwrap().parent_id.as_deref(), Some("0"));
        assert_eq!(plan.synthesize, vec![("1".to_string(), "0".to_string())]);

        let root = plan.model.get("0").unwrap();
        let keys = &plan.para_keys["0"];
        assert_eq!(keys.len(), 2);
        assert_eq!(keys.last(), root.thread_para_key.as_ref());
        assert!(root.durable_id.is_some());
    }

    #[test]
    fn flattened_plan_folds_replies_depth_first() {
        let mut reply = comment("2", Some("1"), &["sure"]);
        reply.date = Some("2024-02-02T00:00:00Z".to_string());
        reply.state = CommentState::Resolved;
        let m = model(vec![
            comment("1", None, &["root"]),
            reply,
            comment("3", Some("2"), &["deeper"]),
        ]);
        let plan = reconcile(m, ReplyPolicy::Flattened, &BTreeMap::new()).unwrap();
        assert_eq!(plan.model.len(), 1);
        assert_eq!(
            plan.model.get("1").unwrap().body,
            vec![
                "root",
                "---",
                "Reply from: author-2 (2024-02-02T00:00:00Z)",
                "---",
                "sure",
                "---",
                "Reply from: author-3",
                "---",
                "deeper",
            ]
        );
        assert_eq!(plan.pruned, BTreeSet::from(["2".to_string(), "3".to_string()]));
        assert!(plan.synthesize.is_empty());
    }

    #[test]
    fn existing_keys_survive_and_duplicates_regenerate() {
        let mut a = comment("1", None, &["a"]);
        a.thread_para_key = Some("0000AB12".to_string());
        a.durable_id = Some("12345678".to_string());
        let mut b = comment("2", None, &["b"]);
        b.thread_para_key = Some("0000AB12".to_string());
        let plan = reconcile(model(vec![a, b]), ReplyPolicy::Threaded, &BTreeMap::new()).unwrap();
        assert_eq!(plan.model.get("1").unwrap().thread_para_key.as_deref(), Some("0000AB12"));
        assert_eq!(plan.model.get("1").unwrap().durable_id.as_deref(), Some("12345678"));
        assert_ne!(plan.model.get("2").unwrap().thread_para_key.as_deref(), Some("0000AB12"));
    }

    #[test]
    fn policy_parses_aliases() {
        assert_eq!(ReplyPolicy::parse("Flatten").unwrap(), ReplyPolicy::Flattened);
        assert_eq!(ReplyPolicy::parse("threaded").unwrap(), ReplyPolicy::Threaded);
        assert!(ReplyPolicy::parse("nested").is_err());
    }
}

//! Byte ranges of Markdown that comment passes must leave alone.
//!
//! Code spans and code blocks hold examples, never markers. Card quotes hold
//! comment text, which may mention marker syntax without being a marker.

use std::ops::Range;

use pulldown_cmark::{Event, Options, Parser, Tag, TagEnd};

use super::grammar::{CardHeader, CARD_META_RE};

/// Code spans and fenced/indented code blocks, in text order.
pub fn code_ranges(text: &str) -> Vec<Range<usize>> {
    Parser::new_ext(text, Options::empty())
        .into_offset_iter()
        .filter(|(event, _)| matches!(event, Event::Code(_) | Event::Start(Tag::CodeBlock(_))))
        .map(|(_, range)| range)
        .collect()
}

/// Outermost quotes that open with a card header or card metadata.
pub fn card_ranges(text: &str) -> Vec<Range<usize>> {
    let mut out = Vec::new();
    let mut depth = 0usize;
    for (event, range) in Parser::new_ext(text, Options::empty()).into_offset_iter() {
        match event {
            Event::Start(Tag::BlockQuote(_)) => {
                if depth == 0 && opens_card(&text[range.clone()]) {
                    out.push(range);
                }
                depth += 1;
            }
            Event::End(TagEnd::BlockQuote(_)) => depth = depth.saturating_sub(1),
            _ => {}
        }
    }
    out
}

fn opens_card(quote: &str) -> bool {
    let Some(first) = quote
        .lines()
        .map(|l| l.trim_start().trim_start_matches(['>', ' ', '\t']).trim())
        .find(|l| !l.is_empty())
    else {
        return false;
    };
    CardHeader::parse(first).is_some() || (first.starts_with("<!--") && CARD_META_RE.is_match(first))
}

/// `text` with every byte in `ranges` blanked to a space; newlines and
/// byte offsets are kept.
pub fn blank_ranges(text: &str, ranges: &[Range<usize>]) -> String {
    let mut bytes = text.as_bytes().to_vec();
    for range in ranges {
        let end = range.end.min(bytes.len());
        for b in &mut bytes[range.start.min(end)..end] {
            if *b != b'\n' {
                *b = b' ';
            }
        }
    }
    String::from_utf8(bytes).unwrap_or_else(|_| text.to_string())
}

/// Replace code content with spaces, keeping byte offsets and newlines.
pub fn mask_code(text: &str) -> String {
    blank_ranges(text, &code_ranges(text))
}

/// Apply `rewrite` to each stretch of `text` outside code, splicing code back
/// unchanged.
pub fn map_prose<F>(text: &str, mut rewrite: F) -> String
where
    F: FnMut(&str) -> String,
{
    let mut out = String::with_capacity(text.len());
    let mut at = 0;
    for range in code_ranges(text) {
        if range.start < at {
            continue;
        }
        out.push_str(&rewrite(&text[at..range.start]));
        out.push_str(&text[range.clone()]);
        at = range.end;
    }
    out.push_str(&rewrite(&text[at..]));
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::markdown::grammar::find_milestones;

    #[test]
    fn code_is_masked_with_offsets_kept() {
        let text = "a `///1.START///` b\n\n```\n///2.END///\n```\n";
        let masked = mask_code(text);
        assert_eq!(masked.len(), text.len());
        assert!(find_milestones(&masked).is_empty());
        assert_eq!(masked.matches('\n').count(), text.matches('\n').count());
    }

    #[test]
    fn prose_rewrites_skip_code() {
        let text = "x AB `AB` y\n\n```\nAB\n```\n\nAB\n";
        let out = map_prose(text, |s| s.replace("AB", "ab"));
        assert_eq!(out, "x ab `AB` y\n\n```\nAB\n```\n\nab\n");
    }

    #[test]
    fn only_card_quotes_are_card_ranges() {
        let text = "Intro ///1.START/// a ///1.END///\n\n\
                    > [!COMMENT 1: A (active)]\n> <!--CARD_META{#1 \"author\":\"A\"}-->\n> say ///x.START/// here\n>\n> > [!REPLY 2: B (active)]\n> > ok\n\n\
                    > just a quote ///y.END///\n";
        let ranges = card_ranges(text);
        assert_eq!(ranges.len(), 1);
        let masked = blank_ranges(text, &ranges);
        let ids: Vec<String> = find_milestones(&masked).into_iter().map(|m| m.raw_id).collect();
        assert_eq!(ids, ["1", "1", "y"]);
    }
}

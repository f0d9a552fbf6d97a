use std::fmt;

use thiserror::Error;

use crate::markdown::grammar::Edge;

/// 1-based line/column inside a Markdown source.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub struct TextLocation {
    pub line: usize,
    pub col: usize,
}

impl TextLocation {
    pub fn at_offset(text: &str, offset: usize) -> Self {
        let offset = offset.min(text.len());
        let head = &text[..offset];
        let line = head.matches('\n').count() + 1;
        let line_start = head.rfind('\n').map(|i| i + 1).unwrap_or(0);
        let col = head[line_start..].chars().count() + 1;
        Self { line, col }
    }
}

impl fmt::Display for TextLocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.line, self.col)
    }
}

fn fmt_locations(locs: &[TextLocation]) -> String {
    if locs.is_empty() {
        return "(none)".to_string();
    }
    locs.iter()
        .map(|l| l.to_string())
        .collect::<Vec<_>>()
        .join(", ")
}

fn fmt_partner(partner: &Option<TextLocation>) -> String {
    match partner {
        Some(p) => format!("; partner marker at {p}"),
        None => "; no partner marker found".to_string(),
    }
}

/// One violated marker invariant found in Markdown text.
#[derive(Clone, Debug, PartialEq, Eq, Error)]
pub enum MarkerIssue {
    #[error(
        "MalformedMarker: comment {id} has a one-sided `==` wrapper around its {edge} marker at {at}; \
         use `///{id}.{edge}///` or `==///{id}.{edge}///==`"
    )]
    MalformedMarker {
        id: String,
        edge: Edge,
        at: TextLocation,
    },

    #[error("UnbalancedMarker: comment {id} {edge} marker at {at} {detail}{}", fmt_partner(.partner))]
    UnbalancedMarker {
        id: String,
        edge: Edge,
        at: TextLocation,
        partner: Option<TextLocation>,
        detail: String,
    },

    #[error("DuplicateCommentId: comment {id} has START markers at {}", fmt_locations(.starts))]
    DuplicateCommentId { id: String, starts: Vec<TextLocation> },

    #[error("MissingParentId: comment {child} names parent {parent}, which is not a comment span or card{}",
        .at.map(|l| format!(" (card at {l})")).unwrap_or_default())]
    MissingParentId {
        child: String,
        parent: String,
        at: Option<TextLocation>,
    },

    #[error("UnanchoredCard: root comment {id} (card at {at}) has no START/END marker pair in the prose")]
    UnanchoredCard { id: String, at: TextLocation },

    #[error("ThreadCycle: parent chain loops: {}", .chain.join(" -> "))]
    ThreadCycle { chain: Vec<String> },
}

impl MarkerIssue {
    pub fn comment_id(&self) -> &str {
        match self {
            MarkerIssue::MalformedMarker { id, .. }
            | MarkerIssue::UnbalancedMarker { id, .. }
            | MarkerIssue::DuplicateCommentId { id, .. }
            | MarkerIssue::UnanchoredCard { id, .. } => id,
            MarkerIssue::MissingParentId { parent, .. } => parent,
            MarkerIssue::ThreadCycle { chain } => chain.first().map(|s| s.as_str()).unwrap_or(""),
        }
    }
}

/// Every issue found by one validator run.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ValidationFailure {
    pub source: String,
    pub issues: Vec<MarkerIssue>,
}

impl fmt::Display for ValidationFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "comment marker validation failed ({})", self.source)?;
        for issue in &self.issues {
            writeln!(f, "- {issue}")?;
        }
        write!(
            f,
            "- keep exactly one `///<ID>.START/// ... ///<ID>.END///` pair per root comment, \
             and point every `parent` at an existing comment"
        )
    }
}

impl std::error::Error for ValidationFailure {}

#[derive(Debug, Error)]
pub enum CommentError {
    #[error(transparent)]
    Validation(#[from] ValidationFailure),

    #[error("DuplicateCommentId: comment id {id} appears more than once in {part}")]
    DuplicateCommentId { id: String, part: String },

    #[error("IncompletePackageParts: {part} references comment(s) {} that the primary comment list lacks{}",
        .ids.join(", "), .detail.as_deref().map(|d| format!(" ({d})")).unwrap_or_default())]
    IncompletePackageParts {
        part: String,
        ids: Vec<String>,
        detail: Option<String>,
    },

    #[error("IncompleteAnchorSynthesis: comment {id} is missing {} ({reason})", .missing.join(", "))]
    IncompleteAnchorSynthesis {
        id: String,
        missing: Vec<&'static str>,
        reason: String,
    },

    #[error("ThreadCycle: {part} links replies in a loop: {}", .chain.join(" -> "))]
    ThreadCycle { part: String, chain: Vec<String> },

    #[error("ExternalConverterUnavailable: {program}: {reason}")]
    ExternalConverterUnavailable { program: String, reason: String },

    #[error("ExternalConverterFailure: `{command}` exited with {status}: {stderr}")]
    ExternalConverterFailure {
        command: String,
        status: String,
        stderr: String,
    },
}

impl CommentError {
    /// Process exit code the CLI reports for this error.
    pub fn exit_code(&self) -> i32 {
        match self {
            CommentError::ExternalConverterUnavailable { .. }
            | CommentError::ExternalConverterFailure { .. } => 3,
            _ => 2,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn location_counts_lines_and_chars() {
        let text = "ab\ncdé\nxyz";
        assert_eq!(TextLocation::at_offset(text, 0), TextLocation { line: 1, col: 1 });
        let off = text.find('x').unwrap();
        assert_eq!(TextLocation::at_offset(text, off), TextLocation { line: 3, col: 1 });
        let off = text.find('é').unwrap() + 'é'.len_utf8();
        assert_eq!(TextLocation::at_offset(text, off), TextLocation { line: 2, col: 4 });
    }

    #[test]
    fn failure_lists_each_issue() {
        let failure = ValidationFailure {
            source: "draft.md".to_string(),
            issues: vec![
                MarkerIssue::MissingParentId {
                    child: "c2".to_string(),
                    parent: "c9".to_string(),
                    at: Some(TextLocation { line: 7, col: 1 }),
                },
                MarkerIssue::DuplicateCommentId {
                    id: "4".to_string(),
                    starts: vec![TextLocation { line: 1, col: 3 }, TextLocation { line: 9, col: 1 }],
                },
            ],
        };
        let msg = failure.to_string();
        assert!(msg.contains("draft.md"));
        assert!(msg.contains("MissingParentId: comment c2 names parent c9"));
        assert!(msg.contains("(card at 7:1)"));
        assert!(msg.contains("START markers at 1:3, 9:1"));
    }
}

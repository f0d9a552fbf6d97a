//! Names, namespaces and wiring constants for the comment-related OOXML parts.

pub const W_NS: &str = "http://schemas.openxmlformats.org/wordprocessingml/2006/main";
pub const W14_NS: &str = "http://schemas.microsoft.com/office/word/2010/wordml";
pub const W15_NS: &str = "http://schemas.microsoft.com/office/word/2012/wordml";
pub const W16CID_NS: &str = "http://schemas.microsoft.com/office/word/2016/wordml/cid";
pub const W16CEX_NS: &str = "http://schemas.microsoft.com/office/word/2018/wordml/cex";
pub const MC_NS: &str = "http://schemas.openxmlformats.org/markup-compatibility/2006";
pub const PKG_REL_NS: &str = "http://schemas.openxmlformats.org/package/2006/relationships";
pub const CT_NS: &str = "http://schemas.openxmlformats.org/package/2006/content-types";

pub const DOCUMENT_RELS: &str = "word/_rels/document.xml.rels";
pub const CONTENT_TYPES: &str = "[Content_Types].xml";

/// One of the five comment-carrying parts.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum CommentPart {
    Comments,
    Extended,
    Ids,
    Extensible,
    People,
}

impl CommentPart {
    pub const ALL: [CommentPart; 5] = [
        CommentPart::Comments,
        CommentPart::Extended,
        CommentPart::Ids,
        CommentPart::Extensible,
        CommentPart::People,
    ];

    /// Zip entry name.
    pub fn entry(self) -> &'static str {
        match self {
            CommentPart::Comments => "word/comments.xml",
            CommentPart::Extended => "word/commentsExtended.xml",
            CommentPart::Ids => "word/commentsIds.xml",
            CommentPart::Extensible => "word/commentsExtensible.xml",
            CommentPart::People => "word/people.xml",
        }
    }

    /// Relationship target relative to `word/`.
    pub fn target(self) -> &'static str {
        &self.entry()["word/".len()..]
    }

    pub fn part_name(self) -> String {
        format!("/{}", self.entry())
    }

    pub fn rel_type(self) -> &'static str {
        match self {
            CommentPart::Comments => {
                "http://schemas.openxmlformats.org/officeDocument/2006/relationships/comments"
            }
            CommentPart::Extended => {
                "http://schemas.microsoft.com/office/2011/relationships/commentsExtended"
            }
            CommentPart::Ids => "http://schemas.microsoft.com/office/2016/09/relationships/commentsIds",
            CommentPart::Extensible => {
                "http://schemas.microsoft.com/office/2018/08/relationships/commentsExtensible"
            }
            CommentPart::People => "http://schemas.microsoft.com/office/2011/relationships/people",
        }
    }

    pub fn content_type(self) -> &'static str {
        match self {
            CommentPart::Comments => {
                "application/vnd.openxmlformats-officedocument.wordprocessingml.comments+xml"
            }
            CommentPart::Extended => {
                "application/vnd.openxmlformats-officedocument.wordprocessingml.commentsExtended+xml"
            }
            CommentPart::Ids => {
                "application/vnd.openxmlformats-officedocument.wordprocessingml.commentsIds+xml"
            }
            CommentPart::Extensible => {
                "application/vnd.openxmlformats-officedocument.wordprocessingml.commentsExtensible+xml"
            }
            CommentPart::People => {
                "application/vnd.openxmlformats-officedocument.wordprocessingml.people+xml"
            }
        }
    }
}

/// Namespace declarations put on every comment part root.
pub const COMMENT_PART_NAMESPACES: [(&str, &str); 7] = [
    ("xmlns:w", W_NS),
    ("xmlns:w14", W14_NS),
    ("xmlns:w15", W15_NS),
    ("xmlns:w16cid", W16CID_NS),
    ("xmlns:w16cex", W16CEX_NS),
    ("xmlns:mc", MC_NS),
    ("mc:Ignorable", "w14 w15 w16cid w16cex"),
];

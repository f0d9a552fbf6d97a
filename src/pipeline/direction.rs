use std::fmt;
use std::path::{Path, PathBuf};

const MARKDOWN_EXTENSIONS: [&str; 4] = ["md", "markdown", "mdown", "mkd"];

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Direction {
    DocxToMarkdown,
    MarkdownToDocx,
}

impl Direction {
    /// `docx2md`/`d2m` or `md2docx`/`m2d`, any case.
    pub fn parse(name: &str) -> Option<Self> {
        match name.trim().to_ascii_lowercase().as_str() {
            "docx2md" | "d2m" => Some(Direction::DocxToMarkdown),
            "md2docx" | "m2d" => Some(Direction::MarkdownToDocx),
            _ => None,
        }
    }

    /// Direction implied by the input's extension.
    pub fn detect(input: &Path) -> Option<Self> {
        let ext = input.extension()?.to_str()?.to_ascii_lowercase();
        if ext == "docx" {
            Some(Direction::DocxToMarkdown)
        } else if MARKDOWN_EXTENSIONS.contains(&ext.as_str()) {
            Some(Direction::MarkdownToDocx)
        } else {
            None
        }
    }

    /// Input path with the other format's extension.
    pub fn default_output(self, input: &Path) -> PathBuf {
        match self {
            Direction::DocxToMarkdown => input.with_extension("md"),
            Direction::MarkdownToDocx => input.with_extension("docx"),
        }
    }
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Direction::DocxToMarkdown => "docx2md",
            Direction::MarkdownToDocx => "md2docx",
        })
    }
}

mod converter;
mod direction;
mod docx2md;
mod md2docx;

use std::path::Path;

pub use converter::{
    has_flag, json_render_args, parse_version, without_format_args, writer_format, ContentConverter, Pandoc,
};
pub use direction::Direction;
pub use docx2md::{docx_reader_args, docx_to_markdown, finish_markdown, repair_converted};
pub use md2docx::{finish_package, markdown_to_docx, validate_and_model};

use crate::config::AppConfig;
use crate::progress::ConsoleProgress;
use crate::reconcile::ReplyPolicy;
use crate::workspace::Workspace;

/// Per-run options after config file and command line are merged.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ConversionSettings {
    pub reply_policy: ReplyPolicy,
    pub wrap_milestones: bool,
    /// Pass-through converter arguments, config `extra_args` first.
    pub converter_args: Vec<String>,
}

impl ConversionSettings {
    pub fn from_config(cfg: &AppConfig, reply_policy: Option<ReplyPolicy>, user_args: &[String]) -> Self {
        Self {
            reply_policy: reply_policy.unwrap_or(cfg.conversion.reply_policy),
            wrap_milestones: cfg.conversion.wrap_milestones,
            converter_args: cfg.converter.extra_args.iter().chain(user_args).cloned().collect(),
        }
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ConversionReport {
    pub comments: usize,
    pub threads: usize,
    pub milestones: usize,
    /// Comment spans fixed up after the docx conversion.
    pub repairs: usize,
    /// Root comments with no range in the document.
    pub unanchored: Vec<String>,
    /// Empty Word shapes dropped from the document.
    pub placeholder_images: usize,
    /// Extracted media files nothing links to, deleted after writing.
    pub pruned_media: usize,
}

/// Run one conversion in a fresh workspace beside `output`.
pub fn convert(
    direction: Direction,
    input: &Path,
    output: &Path,
    settings: &ConversionSettings,
    converter: &dyn ContentConverter,
    progress: ConsoleProgress,
) -> anyhow::Result<ConversionReport> {
    let workspace = Workspace::beside(output)?;
    match direction {
        Direction::DocxToMarkdown => {
            let progress = progress.with_stages(docx2md::STAGES);
            docx_to_markdown(input, output, settings, converter, &workspace, &progress)
        }
        Direction::MarkdownToDocx => {
            let progress = progress.with_stages(md2docx::STAGES);
            markdown_to_docx(input, output, settings, converter, &workspace, &progress)
        }
    }
}

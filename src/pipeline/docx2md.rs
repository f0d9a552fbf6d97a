//! DOCX -> Markdown: comments become milestones in the prose plus thread cards.

use std::path::{Path, PathBuf};

use anyhow::Context;

use super::converter::{has_flag, json_render_args, without_format_args, writer_format, ContentConverter};
use super::{ConversionReport, ConversionSettings};
use crate::docx::build::build_model;
use crate::docx::package::DocxPackage;
use crate::error::CommentError;
use crate::markdown::media::{list_files, prune_unreferenced_media, strip_placeholder_images};
use crate::markdown::project::{normalize_card_layout, project};
use crate::markdown::repair::{flatten_nested_ends, insert_missing_ends};
use crate::markdown::validate::check_projection;
use crate::model::CommentModel;
use crate::progress::ConsoleProgress;
use crate::workspace::Workspace;

pub const STAGES: usize = 6;

/// The converter's own Markdown dialect; it is the only one that keeps
/// comment spans as bracketed spans.
const INTERMEDIATE_FORMAT: &str = "markdown";

/// Arguments for the docx -> intermediate conversion.
pub fn docx_reader_args(user: &[String]) -> Vec<String> {
    let mut args = without_format_args(user);
    if !has_flag(&args, "--track-changes") {
        args.push("--track-changes=all".to_string());
    }
    if !has_flag(&args, "--extract-media") {
        args.push("--extract-media=.".to_string());
    }
    args
}

/// Restore END spans the converter dropped and pull nested ENDs out of
/// their host spans. Returns the text and the number of repairs.
pub fn repair_converted(text: &str, model: &CommentModel) -> (String, usize) {
    let (text, inserted) = insert_missing_ends(text, |id| {
        model.get(id).and_then(|c| c.parent_id.clone())
    });
    let (text, flattened) = flatten_nested_ends(&text);
    if inserted + flattened > 0 {
        tracing::debug!(inserted, flattened, "converted markdown repaired");
    }
    (text, inserted + flattened)
}

/// Normalise the rendered Markdown and check it before it is written.
pub fn finish_markdown(label: &str, rendered: &str, model: &CommentModel) -> anyhow::Result<String> {
    let text = normalize_card_layout(rendered);
    check_projection(label, &text, model).map_err(CommentError::from)?;
    Ok(text)
}

fn output_dir(output: &Path) -> PathBuf {
    match output.parent() {
        Some(p) if !p.as_os_str().is_empty() => p.to_path_buf(),
        _ => PathBuf::from("."),
    }
}

pub fn docx_to_markdown(
    input: &Path,
    output: &Path,
    settings: &ConversionSettings,
    converter: &dyn ContentConverter,
    workspace: &Workspace,
    progress: &ConsoleProgress,
) -> anyhow::Result<ConversionReport> {
    converter.ensure_available()?;
    let input = input
        .canonicalize()
        .with_context(|| format!("input not found: {}", input.display()))?;

    progress.stage(1, format!("reading comments from {}", input.display()));
    let pkg = DocxPackage::read(&input)?;
    let model = build_model(&pkg)?;
    tracing::debug!(comments = model.len(), "package model built");

    progress.stage(2, format!("converting with {}", converter.program()));
    let converted = workspace.file("converted.md");
    // Media is extracted relative to the output so the links it writes stay valid.
    let media_dir = output_dir(output);
    let media_root = media_dir.join("media");
    let media_before = list_files(&media_root)?;
    converter.convert(
        &input,
        "docx",
        INTERMEDIATE_FORMAT,
        &converted,
        &docx_reader_args(&settings.converter_args),
        Some(&media_dir),
    )?;

    progress.stage(3, "repairing comment spans");
    let (repaired_text, repaired) = repair_converted(&workspace.read_text("converted.md")?, &model);
    let repaired_path = workspace.write("repaired.md", repaired_text.as_bytes())?;

    progress.stage(4, "placing milestones and thread cards");
    let render_args = json_render_args(&settings.converter_args);
    let mut doc = converter.to_ast(&repaired_path, INTERMEDIATE_FORMAT, &render_args)?;
    let placeholders = strip_placeholder_images(&mut doc);
    let projection = project(&mut doc, &model, settings.wrap_milestones)?;
    let tree = serde_json::to_vec(&doc).context("serialize projected document")?;
    let tree_path = workspace.write("projected.json", &tree)?;

    progress.stage(5, "rendering markdown");
    let writer = writer_format(&settings.converter_args, INTERMEDIATE_FORMAT);
    converter.convert(
        &tree_path,
        "json",
        &writer,
        &workspace.file("rendered.md"),
        &render_args,
        None,
    )?;
    let text = finish_markdown(
        &output.display().to_string(),
        &workspace.read_text("rendered.md")?,
        &model,
    )?;

    progress.stage(6, format!("writing {}", output.display()));
    let staged = workspace.write("final.md", text.as_bytes())?;
    workspace.persist(&staged, output)?;
    let pruned_media = match prune_unreferenced_media(&media_root, &media_before, &text) {
        Ok(n) => n,
        Err(e) => {
            tracing::warn!(dir = %media_root.display(), "media cleanup incomplete: {e:#}");
            0
        }
    };

    Ok(ConversionReport {
        comments: model.len(),
        threads: model.roots().count(),
        milestones: projection.milestones,
        repairs: repaired,
        unanchored: projection.unanchored,
        placeholder_images: placeholders.len(),
        pruned_media,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::Comment;

    fn model() -> CommentModel {
        let mut model = CommentModel::default();
        model.insert(Comment::new("0"), "test").unwrap();
        let mut reply = Comment::new("1");
        reply.parent_id = Some("0".to_string());
        model.insert(reply, "test").unwrap();
        model
    }

    fn args(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn reader_args_add_track_changes_and_media() {
        assert_eq!(
            docx_reader_args(&args(&["-t", "gfm", "--wrap=none"])),
            args(&["--wrap=none", "--track-changes=all", "--extract-media=."])
        );
        assert_eq!(
            docx_reader_args(&args(&["--track-changes", "accept", "--extract-media=img"])),
            args(&["--track-changes", "accept", "--extract-media=img"])
        );
    }

    #[test]
    fn dropped_end_is_restored_after_the_reply() {
        let text = "[Hello]{.comment-start id=\"0\" author=\"A\"} \
                    []{.comment-start id=\"1\" author=\"B\"}[]{.comment-end id=\"1\"} world\n";
        let (fixed, repairs) = repair_converted(text, &model());
        assert_eq!(repairs, 1);
        let reply_end = fixed.find("[]{.comment-end id=\"1\"}").unwrap();
        let root_end = fixed.find("[]{.comment-end id=\"0\"}").unwrap();
        assert!(root_end > reply_end);
    }

    #[test]
    fn balanced_text_is_left_alone() {
        let text = "[Hello]{.comment-start id=\"0\"}[]{.comment-end id=\"0\"}\n";
        assert_eq!(repair_converted(text, &model()), (text.to_string(), 0));
    }

    #[test]
    fn rendered_cards_are_tidied_and_checked() {
        let rendered = "Intro ///0.START///text///0.END///\n\n\
                        > [!COMMENT 0: A (open)]\n>\n> <!--CARD_META{#0 \"author\":\"A\",\"state\":\"open\"}-->\n>\n> Body\n";
        let text = finish_markdown("out.md", rendered, &model()).unwrap();
        assert!(text.contains("> [!COMMENT 0: A (open)]\n> <!--CARD_META"));

        let broken = "Intro ///0.START///text\n";
        let err = finish_markdown("out.md", broken, &model()).unwrap_err();
        let typed = err.downcast_ref::<CommentError>().unwrap();
        assert!(matches!(typed, CommentError::Validation(_)));
    }

    #[test]
    fn marker_syntax_in_card_bodies_is_not_checked() {
        let rendered = "Intro ///0.START///text///0.END///\n\n\
                        > [!COMMENT 0: A (active)]\n>\n> <!--CARD_META{#0 \"author\":\"A\"}-->\n>\n> write ///x.START/// to open\n";
        let text = finish_markdown("out.md", rendered, &model()).unwrap();
        assert!(text.contains("> write ///x.START/// to open"));
    }

    #[test]
    fn spans_in_converted_code_are_not_repaired() {
        let text = "[Hello]{.comment-start id=\"0\"}[]{.comment-end id=\"0\"}\n\n\
                    ```\n[x]{.comment-start id=\"0\"}\n```\n";
        assert_eq!(repair_converted(text, &model()), (text.to_string(), 0));
    }
}

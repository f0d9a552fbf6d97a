//! Markdown -> DOCX: milestones and cards become Word comments and replies.

use std::path::Path;

use anyhow::Context;

use super::converter::{json_render_args, without_format_args, ContentConverter};
use super::{ConversionReport, ConversionSettings};
use crate::docx::build::package_anchors;
use crate::docx::package::{DocxPackage, PartChanges};
use crate::docx::write::write_package;
use crate::error::CommentError;
use crate::markdown::extract::{extract, Extraction};
use crate::markdown::grammar::strip_transport_attrs;
use crate::markdown::media::strip_placeholder_images;
use crate::markdown::repair::flatten_nested_ends;
use crate::markdown::validate::validate_markdown;
use crate::model::CommentModel;
use crate::progress::ConsoleProgress;
use crate::reconcile::{reconcile, ReplyPolicy};
use crate::workspace::Workspace;

pub const STAGES: usize = 6;

const READER_FORMAT: &str = "markdown";

/// Validate the source and its normalised rendering, then build the model
/// and the Markdown handed to the docx writer (transport keys removed).
pub fn validate_and_model(
    label: &str,
    source: &str,
    normalized: &str,
    extraction: &Extraction,
) -> anyhow::Result<(CommentModel, String)> {
    let (normalized, flattened) = flatten_nested_ends(normalized);
    if flattened > 0 {
        tracing::debug!(flattened, "nested END spans flattened");
    }
    validate_markdown(label, source, &normalized, extraction).map_err(CommentError::from)?;
    let model = extraction.to_model()?;
    let (clean, stripped) = strip_transport_attrs(&normalized);
    tracing::debug!(comments = model.len(), stripped, "markdown model built");
    Ok((model, clean))
}

/// Reconcile `model` against the anchors the converter wrote into `pkg` and
/// compute every part change.
pub fn finish_package(pkg: &DocxPackage, model: CommentModel, policy: ReplyPolicy) -> anyhow::Result<PartChanges> {
    let anchors = package_anchors(pkg)?;
    let plan = reconcile(model, policy, &anchors)?;
    if !plan.synthesize.is_empty() {
        tracing::debug!(replies = plan.synthesize.len(), "synthesizing reply anchors");
    }
    write_package(pkg, &plan)
}

pub fn markdown_to_docx(
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
    let label = input.display().to_string();
    let source = std::fs::read_to_string(&input)
        .with_context(|| format!("read markdown: {}", input.display()))?;
    let render_args = json_render_args(&settings.converter_args);

    progress.stage(1, format!("reading {}", input.display()));
    let mut doc = converter.to_ast(&input, READER_FORMAT, &render_args)?;
    let placeholders = strip_placeholder_images(&mut doc);
    let extraction = extract(&mut doc)?;
    tracing::debug!(cards = extraction.cards.len(), milestones = extraction.milestones, "markdown extracted");

    progress.stage(2, "normalizing comment spans");
    let tree = serde_json::to_vec(&doc).context("serialize extracted document")?;
    let tree_path = workspace.write("extracted.json", &tree)?;
    converter.convert(
        &tree_path,
        "json",
        READER_FORMAT,
        &workspace.file("normalized.md"),
        &render_args,
        None,
    )?;

    progress.stage(3, "validating comment markers");
    let normalized = workspace.read_text("normalized.md")?;
    let (model, clean) = validate_and_model(&label, &source, &normalized, &extraction)?;
    let clean_path = workspace.write("clean.md", clean.as_bytes())?;

    progress.stage(4, format!("converting with {}", converter.program()));
    let converted = workspace.file("converted.docx");
    // Relative image paths resolve against the source file.
    let source_dir = input.parent().unwrap_or(Path::new("."));
    converter.convert(
        &clean_path,
        READER_FORMAT,
        "docx",
        &converted,
        &without_format_args(&settings.converter_args),
        Some(source_dir),
    )?;

    progress.stage(5, format!("writing comments ({} replies)", settings.reply_policy));
    let comments = model.len();
    let threads = model.roots().count();
    let pkg = DocxPackage::read(&converted)?;
    let changes = finish_package(&pkg, model, settings.reply_policy)?;
    let staged = workspace.file("final.docx");
    pkg.write_with_changes(&staged, &changes)?;

    progress.stage(6, format!("writing {}", output.display()));
    workspace.persist(&staged, output)?;

    Ok(ConversionReport {
        comments,
        threads,
        milestones: extraction.milestones,
        repairs: 0,
        unanchored: Vec::new(),
        placeholder_images: placeholders.len(),
        pruned_media: 0,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::docx::build::build_model;
    use crate::docx::fixtures::{package, CONTENT_TYPES_XML, DOCUMENT_RELS_XML};
    use crate::error::MarkerIssue;
    use crate::markdown::ast::text_to_inlines;
    use crate::model::{Comment, CommentState};
    use crate::pipeline::converter::Pandoc;
    use serde_json::{json, Value};

    fn para(text: &str) -> Value {
        json!({"t": "Para", "c": text_to_inlines(text)})
    }

    fn card(header: &str, meta: &str, body: &str, nested: Vec<Value>) -> Value {
        let mut first = text_to_inlines(header);
        first.push(json!({"t": "SoftBreak"}));
        first.push(json!({"t": "RawInline", "c": ["html", meta]}));
        first.push(json!({"t": "SoftBreak"}));
        first.extend(text_to_inlines(body));
        let mut blocks = vec![json!({"t": "Para", "c": first})];
        blocks.extend(nested);
        json!({"t": "BlockQuote", "c": blocks})
    }

    fn extraction_of(blocks: Vec<Value>) -> Extraction {
        let mut doc = json!({"pandoc-api-version": [1, 23], "meta": {}, "blocks": blocks});
        extract(&mut doc).unwrap()
    }

    fn issues_of(err: anyhow::Error) -> Vec<MarkerIssue> {
        match err.downcast::<CommentError>() {
            Ok(CommentError::Validation(failure)) => failure.issues,
            other => panic!("expected a validation failure, got {other:?}"),
        }
    }

    const SOURCE: &str = "Intro ///c1.START/// text ///c1.END///\n\n\
        > [!COMMENT c1: Ann (active)]\n\
        > <!--CARD_META{#c1 \"author\":\"Ann\",\"paraId\":\"0000AB12\"}-->\n\
        > Check this\n\
        >\n\
        > > [!REPLY c2: Bob (resolved)]\n\
        > > <!--CARD_META{#c2 \"author\":\"Bob\",\"parent\":\"c1\"}-->\n\
        > > Agreed\n";

    fn source_extraction() -> Extraction {
        let reply = card(
            "[!REPLY c2: Bob (resolved)]",
            "<!--CARD_META{#c2 \"author\":\"Bob\",\"parent\":\"c1\"}-->",
            "Agreed",
            vec![],
        );
        let root = card(
            "[!COMMENT c1: Ann (active)]",
            "<!--CARD_META{#c1 \"author\":\"Ann\",\"paraId\":\"0000AB12\"}-->",
            "Check this",
            vec![reply],
        );
        extraction_of(vec![para("Intro ///c1.START/// text ///c1.END///"), root])
    }

    #[test]
    fn validated_markdown_loses_transport_keys() {
        let normalized = "Intro [ text ]{.comment-start id=\"c1\" author=\"Ann\" paraId=\"0000AB12\"}[]{.comment-end id=\"c1\"}\n";
        let (model, clean) =
            validate_and_model("draft.md", SOURCE, normalized, &source_extraction()).unwrap();

        assert_eq!(model.len(), 2);
        assert_eq!(model.get("c1").unwrap().thread_para_key.as_deref(), Some("0000AB12"));
        assert_eq!(model.get("c2").unwrap().state, CommentState::Resolved);
        assert!(!clean.contains("paraId"));
        assert!(clean.contains("author=\"Ann\""));
    }

    #[test]
    fn code_keeps_comment_syntax_verbatim() {
        let fence = "```\n[x]{.comment-start id=\"9\" paraId=\"0000AB12\"}\n[[]{.comment-end id=\"8\"}]{.comment-end id=\"7\"}\n```\n";
        let source = format!("{SOURCE}\n{fence}");
        let normalized = format!(
            "Intro [ text ]{{.comment-start id=\"c1\" author=\"Ann\" paraId=\"0000AB12\"}}[]{{.comment-end id=\"c1\"}}\n\n{fence}"
        );
        let (model, clean) = validate_and_model("draft.md", &source, &normalized, &source_extraction()).unwrap();

        assert_eq!(model.len(), 2);
        assert!(clean.starts_with("Intro [ text ]{.comment-start id=\"c1\" author=\"Ann\"}"));
        assert!(clean.ends_with(fence));
    }

    #[test]
    fn marker_syntax_in_a_card_body_is_comment_text() {
        let source = "Intro ///c1.START/// text ///c1.END///\n\n\
            > [!COMMENT c1: Ann (active)]\n\
            > <!--CARD_META{#c1 \"author\":\"Ann\"}-->\n\
            > write ///x.START/// to open\n";
        let root = card(
            "[!COMMENT c1: Ann (active)]",
            "<!--CARD_META{#c1 \"author\":\"Ann\"}-->",
            "write ///x.START/// to open",
            vec![],
        );
        let extraction = extraction_of(vec![para("Intro ///c1.START/// text ///c1.END///"), root]);
        let normalized = "Intro [ text ]{.comment-start id=\"c1\" author=\"Ann\"}[]{.comment-end id=\"c1\"}\n";
        let (model, _) = validate_and_model("draft.md", source, normalized, &extraction).unwrap();
        assert_eq!(model.get("c1").unwrap().body, ["write ///x.START/// to open"]);
    }

    #[test]
    fn unknown_parent_is_reported_with_its_location() {
        let source = "Text ///c1.START/// a ///c1.END///\n\n\
            > [!COMMENT c1: Ann (active)]\n\
            > <!--CARD_META{#c1 \"author\":\"Ann\"}-->\n\
            > Root\n\n\
            > [!REPLY c2: Bob (active)]\n\
            > <!--CARD_META{#c2 \"author\":\"Bob\",\"parent\":\"c9\"}-->\n\
            > Orphan\n";
        let orphan = card(
            "[!REPLY c2: Bob (active)]",
            "<!--CARD_META{#c2 \"author\":\"Bob\",\"parent\":\"c9\"}-->",
            "Orphan",
            vec![],
        );
        let root = card("[!COMMENT c1: Ann (active)]", "<!--CARD_META{#c1 \"author\":\"Ann\"}-->", "Root", vec![]);
        let ex = extraction_of(vec![para("Text ///c1.START/// a ///c1.END///"), root, orphan]);

        let err = validate_and_model("draft.md", source, "", &ex).unwrap_err();
        let issues = issues_of(err);
        assert_eq!(issues.len(), 1, "{issues:?}");
        match &issues[0] {
            MarkerIssue::MissingParentId { child, parent, .. } => {
                assert_eq!(child, "c2");
                assert_eq!(parent, "c9");
            }
            other => panic!("unexpected issue: {other:?}"),
        }
    }

    #[test]
    fn one_sided_highlight_is_malformed() {
        let source = "A ==///5.START/// b ///5.END///\n";
        let ex = extraction_of(vec![para("A ==///5.START/// b ///5.END///")]);
        let issues = issues_of(validate_and_model("draft.md", source, "", &ex).unwrap_err());
        assert!(issues
            .iter()
            .any(|i| matches!(i, MarkerIssue::MalformedMarker { id, .. } if id == "5")));
    }

    #[test]
    fn converter_output_gets_threaded_reply_anchors() {
        let pkg = package(&[
            ("[Content_Types].xml", CONTENT_TYPES_XML),
            ("word/_rels/document.xml.rels", DOCUMENT_RELS_XML),
            (
                "word/document.xml",
                r#"<w:document xmlns:w="http://schemas.openxmlformats.org/wordprocessingml/2006/main"><w:body><w:p><w:r><w:t xml:space="preserve">Intro </w:t></w:r><w:commentRangeStart w:id="c1"/><w:r><w:t xml:space="preserve"> text </w:t></w:r><w:commentRangeEnd w:id="c1"/><w:r><w:rPr><w:rStyle w:val="CommentReference"/></w:rPr><w:commentReference w:id="c1"/></w:r></w:p></w:body></w:document>"#,
            ),
            (
                "word/comments.xml",
                r#"<w:comments xmlns:w="http://schemas.openxmlformats.org/wordprocessingml/2006/main"><w:comment w:id="c1" w:author="Ann"><w:p><w:r><w:t>Check this</w:t></w:r></w:p></w:comment></w:comments>"#,
            ),
        ]);

        let mut model = CommentModel::default();
        let mut root = Comment::new("c1");
        root.author = "Ann".to_string();
        root.set_body_text("Check this");
        model.insert(root, "test").unwrap();
        let mut reply = Comment::new("c2");
        reply.author = "Bob".to_string();
        reply.parent_id = Some("c1".to_string());
        reply.state = CommentState::Resolved;
        reply.set_body_text("Agreed");
        model.insert(reply, "test").unwrap();

        let changes = finish_package(&pkg, model, ReplyPolicy::Threaded).unwrap();
        let out = DocxPackage::from_bytes(pkg.to_bytes(&changes).unwrap()).unwrap();
        let written = build_model(&out).unwrap();

        assert_eq!(written.len(), 2);
        assert!(written.has_complete_anchor("0"));
        assert!(written.has_complete_anchor("1"));
        let reply = written.get("1").unwrap();
        assert_eq!(reply.parent_id.as_deref(), Some("0"));
        assert_eq!(reply.author, "Bob");
        assert_eq!(reply.state, CommentState::Resolved);
    }

    #[test]
    fn missing_converter_fails_before_any_output() {
        let dir = tempfile::tempdir().unwrap();
        let input = dir.path().join("draft.md");
        std::fs::write(&input, SOURCE).unwrap();
        let output = dir.path().join("draft.docx");
        let workspace = Workspace::beside(&output).unwrap();
        let pandoc = Pandoc::new("dmt-no-such-converter-4242", (2, 14));

        let err = markdown_to_docx(
            &input,
            &output,
            &ConversionSettings::default(),
            &pandoc,
            &workspace,
            &ConsoleProgress::new(false),
        )
        .unwrap_err();
        assert_eq!(err.downcast_ref::<CommentError>().map(CommentError::exit_code), Some(3));
        assert!(!output.exists());
    }
}

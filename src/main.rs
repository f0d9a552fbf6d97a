use std::path::{Path, PathBuf};
use std::process::ExitCode;

use anyhow::Context;
use clap::{CommandFactory, Parser};
use tracing_subscriber::filter::LevelFilter;
use tracing_subscriber::EnvFilter;

use dmt::config::{init_default_config, resolve_config, CONFIG_ENV};
use dmt::error::CommentError;
use dmt::pipeline::{convert, ConversionSettings, Direction, Pandoc};
use dmt::progress::ConsoleProgress;
use dmt::reconcile::ReplyPolicy;

const LOG_ENV: &str = "DMT_LOG";

#[derive(Parser, Debug)]
#[command(name = "dmt")]
#[command(about = "DOCX <-> Markdown conversion that keeps Word comment threads", long_about = None)]
struct Args {
    /// Write a default dmt.toml, then exit
    #[arg(long)]
    init_config: bool,

    /// Directory to write dmt.toml to (default: current directory)
    #[arg(long, value_name = "DIR")]
    init_config_dir: Option<PathBuf>,

    /// Overwrite an existing dmt.toml when used with --init-config
    #[arg(long)]
    force: bool,

    /// Conversion direction; `auto` picks it from the input extension
    #[arg(long, default_value = "auto", value_parser = ["auto", "docx2md", "md2docx", "d2m", "m2d"])]
    mode: String,

    /// Input file. A leading `docx2md`/`md2docx` (or `d2m`/`m2d`) also selects the mode.
    #[arg(value_name = "INPUT", num_args = 0..=2)]
    positional: Vec<String>,

    /// Output file (default: input with the other extension)
    #[arg(short, long, value_name = "FILE")]
    output: Option<PathBuf>,

    /// How md2docx writes replies: threaded | flattened
    #[arg(long, value_name = "POLICY", value_parser = parse_reply_policy)]
    reply_policy: Option<ReplyPolicy>,

    /// Config file path (default: DMT_CONFIG, or dmt.toml searched upwards)
    #[arg(long, value_name = "TOML")]
    config: Option<PathBuf>,

    /// No progress lines
    #[arg(short, long)]
    quiet: bool,

    /// Arguments passed through to the converter
    #[arg(last = true, value_name = "CONVERTER_ARGS")]
    converter_args: Vec<String>,
}

fn parse_reply_policy(s: &str) -> Result<ReplyPolicy, String> {
    ReplyPolicy::parse(s).map_err(|e| e.to_string())
}

fn init_tracing() {
    let filter = EnvFilter::builder()
        .with_default_directive(LevelFilter::WARN.into())
        .with_env_var(LOG_ENV)
        .from_env_lossy();
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .try_init();
}

/// Direction and input from `--mode` and the positionals.
fn resolve_input(args: &Args) -> anyhow::Result<Option<(Direction, PathBuf)>> {
    let (legacy, input) = match args.positional.as_slice() {
        [] => return Ok(None),
        [input] => (None, PathBuf::from(input)),
        [mode, input] => {
            let legacy = Direction::parse(mode)
                .with_context(|| format!("unknown mode `{mode}` (expected docx2md, md2docx, d2m or m2d)"))?;
            (Some(legacy), PathBuf::from(input))
        }
        _ => anyhow::bail!("expected at most a mode and one input file"),
    };

    let direction = match (Direction::parse(&args.mode), legacy) {
        (Some(flag), Some(positional)) if flag != positional => {
            anyhow::bail!("--mode {flag} conflicts with the positional mode {positional}")
        }
        (Some(flag), _) => flag,
        (None, Some(positional)) => positional,
        (None, None) => Direction::detect(&input).with_context(|| {
            format!(
                "cannot tell the direction from {}; use --mode docx2md or --mode md2docx",
                input.display()
            )
        })?,
    };
    Ok(Some((direction, input)))
}

fn input_dir(input: &Path) -> PathBuf {
    match input.parent() {
        Some(p) if !p.as_os_str().is_empty() => p.to_path_buf(),
        _ => PathBuf::from("."),
    }
}

fn run(args: Args) -> anyhow::Result<()> {
    if args.init_config {
        let dir = args
            .init_config_dir
            .clone()
            .unwrap_or_else(|| std::env::current_dir().unwrap_or_else(|_| PathBuf::from(".")));
        let cfg_path = init_default_config(&dir, args.force).context("init default config")?;
        eprintln!("Wrote config: {}", cfg_path.display());
        return Ok(());
    }

    let Some((direction, input)) = resolve_input(&args)? else {
        let mut cmd = Args::command();
        cmd.print_help().context("print help")?;
        eprintln!(
            "\n\nUSAGE:\n  dmt report.docx            (writes report.md)\n  dmt report.md -o out.docx\n  dmt report.docx -- --wrap=none\n\nTIPS:\n  - Config search: --config, {CONFIG_ENV}, or dmt.toml upwards.\n  - Set {LOG_ENV}=debug for diagnostics.\n"
        );
        return Ok(());
    };
    let output = args
        .output
        .clone()
        .unwrap_or_else(|| direction.default_output(&input));

    let (cfg, cfg_path) = resolve_config(args.config.as_deref(), &input_dir(&input))?;
    match &cfg_path {
        Some(p) => tracing::debug!(config = %p.display(), "config loaded"),
        None => tracing::debug!("no config file, using defaults"),
    }
    let settings = ConversionSettings::from_config(&cfg, args.reply_policy, &args.converter_args);
    let converter = Pandoc::from_config(&cfg.converter)?;

    let progress = ConsoleProgress::new(!args.quiet);
    progress.info(format!("{direction}: {} -> {}", input.display(), output.display()));
    let report = convert(direction, &input, &output, &settings, &converter, progress)?;

    if !report.unanchored.is_empty() {
        tracing::warn!(
            comments = %report.unanchored.join(", "),
            "comments without a range were placed at the end"
        );
    }
    if report.placeholder_images + report.pruned_media > 0 {
        tracing::info!(
            placeholders = report.placeholder_images,
            pruned = report.pruned_media,
            "unused images dropped"
        );
    }
    if !args.quiet {
        eprintln!(
            "Wrote {} ({} comments in {} threads, {} milestones)",
            output.display(),
            report.comments,
            report.threads,
            report.milestones
        );
    }
    Ok(())
}

fn main() -> ExitCode {
    init_tracing();
    match run(Args::parse()) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            eprintln!("error: {err:#}");
            let code = err
                .downcast_ref::<CommentError>()
                .map(CommentError::exit_code)
                .unwrap_or(1);
            ExitCode::from(u8::try_from(code).unwrap_or(1))
        }
    }
}

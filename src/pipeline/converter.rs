//! The external document converter (pandoc) behind a small trait.

use std::path::Path;
use std::process::Command;

use anyhow::Context;
use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::Value;

use crate::config::ConverterSection;
use crate::error::CommentError;

pub trait ContentConverter {
    fn program(&self) -> &str;

    /// Fails with `ExternalConverterUnavailable` when the converter is missing or too old.
    fn ensure_available(&self) -> anyhow::Result<()>;

    /// Convert `input` to `output`. `args` are passed through as given.
    fn convert(
        &self,
        input: &Path,
        from: &str,
        to: &str,
        output: &Path,
        args: &[String],
        cwd: Option<&Path>,
    ) -> anyhow::Result<()>;

    /// Read `input` into the converter's JSON document tree.
    fn to_ast(&self, input: &Path, from: &str, args: &[String]) -> anyhow::Result<Value>;
}

#[derive(Clone, Debug)]
pub struct Pandoc {
    program: String,
    min_version: (u32, u32),
}

static VERSION_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\b(\d+)\.(\d+)(?:\.(\d+))?").expect("version regex"));

/// `(major, minor, patch)` from the first line of `--version` output.
pub fn parse_version(text: &str) -> Option<(u32, u32, u32)> {
    let first = text.lines().next()?;
    let caps = VERSION_RE.captures(first)?;
    let num = |i: usize| caps.get(i).and_then(|m| m.as_str().parse::<u32>().ok());
    Some((num(1)?, num(2)?, num(3).unwrap_or(0)))
}

const FORMAT_FLAGS: [&str; 6] = ["-f", "--from", "-t", "--to", "-o", "--output"];
const RENDER_ONLY_FLAGS: [&str; 2] = ["--extract-media", "--track-changes"];

fn drop_flags(args: &[String], flags: &[&str]) -> Vec<String> {
    let mut out = Vec::with_capacity(args.len());
    let mut i = 0;
    while i < args.len() {
        let arg = args[i].as_str();
        if flags.contains(&arg) {
            i += 2;
            continue;
        }
        let long_eq = flags
            .iter()
            .filter(|f| f.starts_with("--"))
            .any(|f| arg.strip_prefix(f).is_some_and(|rest| rest.starts_with('=')));
        if !long_eq {
            out.push(args[i].clone());
        }
        i += 1;
    }
    out
}

/// Pass-through args minus input/output/format selection.
pub fn without_format_args(args: &[String]) -> Vec<String> {
    drop_flags(args, &FORMAT_FLAGS)
}

/// Pass-through args usable when reading or rendering the JSON tree: format,
/// output, media and track-changes options removed.
pub fn json_render_args(args: &[String]) -> Vec<String> {
    let flags: Vec<&str> = FORMAT_FLAGS.iter().chain(RENDER_ONLY_FLAGS.iter()).copied().collect();
    drop_flags(args, &flags)
}

/// Markdown flavour the user asked for with `-t`/`--to`, else `default`.
pub fn writer_format(args: &[String], default: &str) -> String {
    let mut writer = default.to_string();
    let mut i = 0;
    while i < args.len() {
        let arg = args[i].as_str();
        if (arg == "-t" || arg == "--to") && i + 1 < args.len() {
            writer = args[i + 1].clone();
            i += 2;
            continue;
        }
        if let Some(v) = arg.strip_prefix("--to=") {
            writer = v.to_string();
        }
        i += 1;
    }
    if writer.trim().is_empty() {
        default.to_string()
    } else {
        writer
    }
}

pub fn has_flag(args: &[String], flag: &str) -> bool {
    args.iter()
        .any(|a| a == flag || a.strip_prefix(flag).is_some_and(|rest| rest.starts_with('=')))
}

impl Pandoc {
    pub fn new(program: impl Into<String>, min_version: (u32, u32)) -> Self {
        Self {
            program: program.into(),
            min_version,
        }
    }

    pub fn from_config(section: &ConverterSection) -> anyhow::Result<Self> {
        let (major, minor, _) = parse_version(&section.min_version)
            .with_context(|| format!("converter.min_version is not a version: {:?}", section.min_version))?;
        Ok(Self::new(section.program.clone(), (major, minor)))
    }

    fn unavailable(&self, reason: impl Into<String>) -> anyhow::Error {
        CommentError::ExternalConverterUnavailable {
            program: self.program.clone(),
            reason: reason.into(),
        }
        .into()
    }

    fn run(&self, args: &[String], cwd: Option<&Path>) -> anyhow::Result<Vec<u8>> {
        let mut cmd = Command::new(&self.program);
        cmd.args(args);
        if let Some(dir) = cwd {
            cmd.current_dir(dir);
        }
        tracing::debug!(program = %self.program, ?args, "running converter");
        let output = cmd
            .output()
            .map_err(|e| self.unavailable(format!("failed to start: {e}")))?;
        if !output.status.success() {
            return Err(CommentError::ExternalConverterFailure {
                command: std::iter::once(self.program.as_str())
                    .chain(args.iter().map(String::as_str))
                    .collect::<Vec<_>>()
                    .join(" "),
                status: output.status.to_string(),
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            }
            .into());
        }
        Ok(output.stdout)
    }
}

impl ContentConverter for Pandoc {
    fn program(&self) -> &str {
        &self.program
    }

    fn ensure_available(&self) -> anyhow::Result<()> {
        let output = Command::new(&self.program)
            .arg("--version")
            .output()
            .map_err(|e| self.unavailable(format!("not runnable: {e}")))?;
        if !output.status.success() {
            return Err(self.unavailable(format!("`--version` exited with {}", output.status)));
        }
        let text = String::from_utf8_lossy(&output.stdout);
        let Some((major, minor, patch)) = parse_version(&text) else {
            return Err(self.unavailable("could not read a version from `--version`"));
        };
        if (major, minor) < self.min_version {
            return Err(self.unavailable(format!(
                "version {major}.{minor}.{patch} is older than the required {}.{}",
                self.min_version.0, self.min_version.1
            )));
        }
        tracing::debug!(program = %self.program, version = %format!("{major}.{minor}.{patch}"), "converter available");
        Ok(())
    }

    fn convert(
        &self,
        input: &Path,
        from: &str,
        to: &str,
        output: &Path,
        args: &[String],
        cwd: Option<&Path>,
    ) -> anyhow::Result<()> {
        let mut all = vec![
            input.display().to_string(),
            "-f".to_string(),
            from.to_string(),
            "-t".to_string(),
            to.to_string(),
        ];
        all.extend(args.iter().cloned());
        all.push("-o".to_string());
        all.push(output.display().to_string());
        self.run(&all, cwd)?;
        Ok(())
    }

    fn to_ast(&self, input: &Path, from: &str, args: &[String]) -> anyhow::Result<Value> {
        let mut all = vec![input.display().to_string(), "-f".to_string(), from.to_string()];
        all.extend(args.iter().cloned());
        all.push("-t".to_string());
        all.push("json".to_string());
        let stdout = self.run(&all, None)?;
        serde_json::from_slice(&stdout)
            .with_context(|| format!("parse converter JSON for {}", input.display()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn version_comes_from_the_first_line() {
        assert_eq!(parse_version("pandoc 3.1.11.1\nFeatures: +server"), Some((3, 1, 11)));
        assert_eq!(parse_version("pandoc.exe 2.9\n"), Some((2, 9, 0)));
        assert_eq!(parse_version("no digits\n2.19"), None);
    }

    #[test]
    fn render_args_drop_io_format_and_media_options() {
        let given = args(&[
            "-t", "gfm", "--wrap=none", "--extract-media", "media", "--track-changes=all", "--to=commonmark",
            "--columns", "100", "-o", "x.md",
        ]);
        assert_eq!(json_render_args(&given), args(&["--wrap=none", "--columns", "100"]));
        assert_eq!(
            without_format_args(&given),
            args(&["--wrap=none", "--extract-media", "media", "--track-changes=all", "--columns", "100"])
        );
    }

    #[test]
    fn writer_format_takes_the_last_choice() {
        assert_eq!(writer_format(&args(&["-t", "gfm", "--to=commonmark_x"]), "markdown"), "commonmark_x");
        assert_eq!(writer_format(&args(&["--wrap=none"]), "markdown"), "markdown");
        assert_eq!(writer_format(&args(&["-t"]), "markdown"), "markdown");
    }

    #[test]
    fn flag_lookup_accepts_both_spellings() {
        assert!(has_flag(&args(&["--extract-media=."]), "--extract-media"));
        assert!(has_flag(&args(&["--track-changes", "accept"]), "--track-changes"));
        assert!(!has_flag(&args(&["--extract-mediax"]), "--extract-media"));
    }

    #[test]
    fn missing_program_is_unavailable() {
        let pandoc = Pandoc::new("dmt-no-such-converter-4242", (2, 14));
        let err = pandoc.ensure_available().unwrap_err();
        let typed = err.downcast_ref::<CommentError>().unwrap();
        assert!(matches!(typed, CommentError::ExternalConverterUnavailable { .. }));
        assert_eq!(typed.exit_code(), 3);
    }

    #[test]
    fn config_version_is_parsed() {
        let section = ConverterSection {
            min_version: "3.0".to_string(),
            ..ConverterSection::default()
        };
        let pandoc = Pandoc::from_config(&section).unwrap();
        assert_eq!(pandoc.min_version, (3, 0));
        assert_eq!(pandoc.program(), "pandoc");

        let bad = ConverterSection {
            min_version: "latest".to_string(),
            ..ConverterSection::default()
        };
        assert!(Pandoc::from_config(&bad).is_err());
    }
}

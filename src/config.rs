use std::path::{Path, PathBuf};

use anyhow::Context;
use serde::Deserialize;

use crate::reconcile::ReplyPolicy;

pub const CONFIG_FILE_NAME: &str = "dmt.toml";
pub const CONFIG_ENV: &str = "DMT_CONFIG";

#[derive(Clone, Debug, Deserialize, Default, PartialEq)]
pub struct AppConfig {
    #[serde(default)]
    pub conversion: ConversionSection,
    #[serde(default)]
    pub converter: ConverterSection,
}

#[derive(Clone, Debug, Deserialize, PartialEq)]
pub struct ConversionSection {
    /// How md2docx writes replies: "threaded" keeps them as Word replies,
    /// "flattened" folds them into the root comment's text.
    #[serde(default)]
    pub reply_policy: ReplyPolicy,

    /// Emit `==///id.START///==` instead of the bare token.
    #[serde(default)]
    pub wrap_milestones: bool,
}

impl Default for ConversionSection {
    fn default() -> Self {
        Self {
            reply_policy: ReplyPolicy::Threaded,
            wrap_milestones: false,
        }
    }
}

#[derive(Clone, Debug, Deserialize, PartialEq)]
pub struct ConverterSection {
    #[serde(default = "default_program")]
    pub program: String,

    /// Oldest accepted converter version, as `major.minor`.
    #[serde(default = "default_min_version")]
    pub min_version: String,

    /// Prepended to the converter arguments given on the command line.
    #[serde(default)]
    pub extra_args: Vec<String>,
}

impl Default for ConverterSection {
    fn default() -> Self {
        Self {
            program: default_program(),
            min_version: default_min_version(),
            extra_args: Vec::new(),
        }
    }
}

fn default_program() -> String {
    "pandoc".to_string()
}

fn default_min_version() -> String {
    "2.14".to_string()
}

pub fn find_file_upwards(start_dir: &Path, filename: &str, max_levels: usize) -> Option<PathBuf> {
    let mut dir = start_dir;
    for _ in 0..=max_levels {
        let candidate = dir.join(filename);
        if candidate.is_file() {
            return Some(candidate);
        }
        dir = dir.parent()?;
    }
    None
}

/// `dmt.toml` above the current directory, then above `input_dir`.
pub fn find_default_config(input_dir: &Path) -> Option<PathBuf> {
    if let Ok(cwd) = std::env::current_dir() {
        if let Some(p) = find_file_upwards(&cwd, CONFIG_FILE_NAME, 8) {
            return Some(p);
        }
    }
    find_file_upwards(input_dir, CONFIG_FILE_NAME, 8)
}

pub fn load_config(path: &Path) -> anyhow::Result<AppConfig> {
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("read config: {}", path.display()))?;
    let cfg: AppConfig =
        toml::from_str(&text).with_context(|| format!("parse config toml: {}", path.display()))?;
    Ok(cfg)
}

/// Resolve and load the configuration: explicit path, `DMT_CONFIG`, a
/// `dmt.toml` found upwards, or built-in defaults. Returns the file used.
pub fn resolve_config(
    explicit: Option<&Path>,
    input_dir: &Path,
) -> anyhow::Result<(AppConfig, Option<PathBuf>)> {
    if let Some(p) = explicit {
        return Ok((load_config(p)?, Some(p.to_path_buf())));
    }
    if let Some(p) = std::env::var_os(CONFIG_ENV).filter(|v| !v.is_empty()) {
        let p = PathBuf::from(p);
        return Ok((
            load_config(&p).with_context(|| format!("{CONFIG_ENV} points at an unusable file"))?,
            Some(p),
        ));
    }
    match find_default_config(input_dir) {
        Some(p) => Ok((load_config(&p)?, Some(p))),
        None => Ok((AppConfig::default(), None)),
    }
}

const DEFAULT_CONFIG_TOML: &str = r#"[conversion]
# "threaded": replies stay Word replies (md2docx synthesises their anchors).
# "flattened": replies are folded into the root comment's text.
reply_policy = "threaded"

# Write milestones as ==///id.START///== so they stand out in editors
# that render highlight marks.
wrap_milestones = false

[converter]
program = "pandoc"
min_version = "2.14"
# Arguments prepended to any passed after `--` on the command line.
# extra_args = ["--wrap=none"]
extra_args = []
"#;

pub fn init_default_config(dir: &Path, force: bool) -> anyhow::Result<PathBuf> {
    std::fs::create_dir_all(dir)
        .with_context(|| format!("create config dir: {}", dir.display()))?;
    let cfg_path = dir.join(CONFIG_FILE_NAME);
    if cfg_path.exists() && !force {
        return Ok(cfg_path);
    }
    std::fs::write(&cfg_path, DEFAULT_CONFIG_TOML)
        .with_context(|| format!("write config: {}", cfg_path.display()))?;
    Ok(cfg_path)
}

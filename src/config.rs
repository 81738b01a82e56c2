use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Context;
use serde::Deserialize;

use crate::compiler::Engine;

pub const CONFIG_FILENAME: &str = "paper-translator.toml";
pub const CONFIG_ENV_VAR: &str = "PAPER_TRANSLATOR_CONFIG";

#[derive(Clone, Debug, Deserialize, Default)]
pub struct AppConfig {
    #[serde(default)]
    pub pipeline: PipelineSection,
    #[serde(default)]
    pub llm: LlmSection,
    #[serde(default)]
    pub paths: PathsSection,
    #[serde(default)]
    pub prompts: PromptsSection,
}

#[derive(Clone, Debug, Deserialize, Default)]
pub struct PipelineSection {
    /// Engine for the original compile; the translated compile always runs
    /// XeLaTeX unless overridden here.
    #[serde(default)]
    pub engine: Option<String>,
    #[serde(default)]
    pub translated_engine: Option<String>,

    /// Concurrent chunk translations in flight (1..=16).
    #[serde(default)]
    pub concurrency: Option<usize>,

    /// Model context window in tokens; chunk sizing derives from it.
    #[serde(default)]
    pub context_window: Option<usize>,

    #[serde(default)]
    pub rule_retry: Option<usize>,
    #[serde(default)]
    pub llm_retry: Option<usize>,
    #[serde(default)]
    pub agent_max_iterations: Option<usize>,
    #[serde(default)]
    pub agent_max_edits: Option<usize>,
    #[serde(default)]
    pub agent_wall_clock_secs: Option<u64>,

    #[serde(default)]
    pub compile_timeout_secs: Option<u64>,

    /// Cap on bytes extracted from a source archive.
    #[serde(default)]
    pub max_extract_bytes: Option<u64>,

    #[serde(default)]
    pub trace_prompts: Option<bool>,
}

#[derive(Clone, Debug, Deserialize, Default)]
pub struct LlmSection {
    /// External command receiving the prompt on stdin and answering on
    /// stdout, e.g. `["my-llm", "--model", "qwen"]`.
    #[serde(default)]
    pub command: Vec<String>,
    #[serde(default)]
    pub request_timeout_secs: Option<u64>,
}

#[derive(Clone, Debug, Deserialize, Default)]
pub struct PathsSection {
    #[serde(default)]
    pub work_dir: Option<PathBuf>,
    #[serde(default)]
    pub results_dir: Option<PathBuf>,
    #[serde(default)]
    pub trace_dir: Option<PathBuf>,
}

#[derive(Clone, Debug, Deserialize, Default)]
pub struct PromptsSection {
    #[serde(default)]
    pub translate: Option<String>,
    #[serde(default)]
    pub fix_whole: Option<String>,
    #[serde(default)]
    pub fix_section: Option<String>,
    #[serde(default)]
    pub agent_step: Option<String>,
}

/// Fully resolved settings threaded into the pipeline at construction.
/// No process-wide state: every component receives what it needs from here.
#[derive(Clone, Debug)]
pub struct Settings {
    pub engine: Engine,
    pub translated_engine: Engine,
    pub concurrency: usize,
    pub context_window: usize,
    pub rule_retry: usize,
    pub llm_retry: usize,
    pub agent_max_iterations: usize,
    pub agent_max_edits: usize,
    pub agent_wall_clock: Duration,
    pub compile_timeout: Duration,
    pub llm_request_timeout: Duration,
    pub max_extract_bytes: u64,
    pub work_dir: PathBuf,
    pub results_dir: PathBuf,
    pub trace_dir: PathBuf,
    pub trace_prompts: bool,
    pub llm_command: Vec<String>,
    pub prompt_overrides: PromptsSection,
}

impl Settings {
    pub fn from_config(cfg: &AppConfig, home: &Path) -> anyhow::Result<Self> {
        let p = &cfg.pipeline;
        let engine = match p.engine.as_deref() {
            Some(s) => Engine::parse(s)
                .ok_or_else(|| anyhow::anyhow!("unknown engine in config: {s}"))?,
            None => Engine::Pdflatex,
        };
        let translated_engine = match p.translated_engine.as_deref() {
            Some(s) => Engine::parse(s)
                .ok_or_else(|| anyhow::anyhow!("unknown translated_engine in config: {s}"))?,
            None => Engine::Xelatex,
        };

        let base = home.join(".paper-translator");
        let work_dir = cfg.paths.work_dir.clone().unwrap_or_else(|| base.join("work"));
        let results_dir = cfg
            .paths
            .results_dir
            .clone()
            .unwrap_or_else(|| base.join("results"));
        let trace_dir = cfg.paths.trace_dir.clone().unwrap_or_else(|| base.join("trace"));

        Ok(Self {
            engine,
            translated_engine,
            concurrency: p.concurrency.unwrap_or(4).clamp(1, 16),
            context_window: p.context_window.unwrap_or(32_768).max(1024),
            rule_retry: p.rule_retry.unwrap_or(2).max(1),
            llm_retry: p.llm_retry.unwrap_or(2).max(1),
            agent_max_iterations: p.agent_max_iterations.unwrap_or(6).max(1),
            agent_max_edits: p.agent_max_edits.unwrap_or(20).max(1),
            agent_wall_clock: Duration::from_secs(p.agent_wall_clock_secs.unwrap_or(600)),
            compile_timeout: Duration::from_secs(p.compile_timeout_secs.unwrap_or(120)),
            llm_request_timeout: Duration::from_secs(
                cfg.llm.request_timeout_secs.unwrap_or(120),
            ),
            max_extract_bytes: p.max_extract_bytes.unwrap_or(512 * 1024 * 1024),
            work_dir,
            results_dir,
            trace_dir,
            trace_prompts: p.trace_prompts.unwrap_or(false),
            llm_command: cfg.llm.command.clone(),
            prompt_overrides: cfg.prompts.clone(),
        })
    }

    /// Per-compile timeout scaled by project size: 2 min baseline, 10 min
    /// past 20 `.tex` files, 15 min past 50.
    #[must_use]
    pub fn compile_timeout_for(&self, tex_file_count: usize) -> Duration {
        let scaled = if tex_file_count > 50 {
            Duration::from_secs(15 * 60)
        } else if tex_file_count > 20 {
            Duration::from_secs(10 * 60)
        } else {
            self.compile_timeout
        };
        scaled.max(self.compile_timeout)
    }

    /// Chunk byte budget: half the context window plus headroom for the
    /// prompt scaffold and the reply.
    #[must_use]
    pub fn chunk_byte_budget(&self) -> usize {
        self.context_window.saturating_mul(3) / 2
    }
}

pub fn find_file_upwards(start_dir: &Path, filename: &str, max_levels: usize) -> Option<PathBuf> {
    let mut dir = start_dir;
    for _ in 0..=max_levels {
        let candidate = dir.join(filename);
        if candidate.exists() {
            return Some(candidate);
        }
        dir = dir.parent()?;
    }
    None
}

pub fn find_default_config(workdir: &Path) -> Option<PathBuf> {
    if let Ok(env_path) = std::env::var(CONFIG_ENV_VAR) {
        let p = PathBuf::from(env_path);
        if p.exists() {
            return Some(p);
        }
    }
    if let Ok(cwd) = std::env::current_dir() {
        if let Some(p) = find_file_upwards(&cwd, CONFIG_FILENAME, 8) {
            return Some(p);
        }
    }
    if let Some(p) = find_file_upwards(workdir, CONFIG_FILENAME, 8) {
        return Some(p);
    }
    if let Ok(exe) = std::env::current_exe() {
        if let Some(dir) = exe.parent() {
            if let Some(p) = find_file_upwards(dir, CONFIG_FILENAME, 10) {
                return Some(p);
            }
        }
    }
    None
}

pub fn load_config(path: &Path) -> anyhow::Result<AppConfig> {
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("read config: {}", path.display()))?;
    let cfg: AppConfig = toml::from_str(&text).context("parse config toml")?;
    Ok(cfg)
}

pub const DEFAULT_CONFIG_TEMPLATE: &str = r#"# paper-translator configuration

[pipeline]
# engine = "pdflatex"            # original compile
# translated_engine = "xelatex"  # translated compile
# concurrency = 4                # chunk translations in flight
# context_window = 32768         # model context size in tokens
# rule_retry = 2
# llm_retry = 2
# agent_max_iterations = 6
# agent_max_edits = 20
# compile_timeout_secs = 120

[llm]
# External command: prompt on stdin, completion on stdout.
# command = ["my-llm", "--model", "qwen2.5"]
# request_timeout_secs = 120

[paths]
# work_dir = "/tmp/paper-translator/work"
# results_dir = "~/.paper-translator/results"

[prompts]
# translate = "prompts/translate.txt"
# fix_whole = "prompts/fix_whole.txt"
# fix_section = "prompts/fix_section.txt"
# agent_step = "prompts/agent_step.txt"
"#;

/// Write the default config next to `dir`, refusing to clobber unless
/// `force`.
pub fn init_default_config(dir: &Path, force: bool) -> anyhow::Result<PathBuf> {
    std::fs::create_dir_all(dir).with_context(|| format!("create dir: {}", dir.display()))?;
    let path = dir.join(CONFIG_FILENAME);
    if path.exists() && !force {
        anyhow::bail!("config already exists: {} (use --force)", path.display());
    }
    std::fs::write(&path, DEFAULT_CONFIG_TEMPLATE)
        .with_context(|| format!("write config: {}", path.display()))?;
    Ok(path)
}

use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::time::{Duration, Instant};

use anyhow::Context;
use serde::{Deserialize, Serialize};

/// LaTeX engine selection. XeLaTeX is the default for translated documents
/// because of its CJK font handling.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Engine {
    Pdflatex,
    Xelatex,
    Lualatex,
}

impl Engine {
    #[must_use]
    pub fn command(&self) -> &'static str {
        match self {
            Self::Pdflatex => "pdflatex",
            Self::Xelatex => "xelatex",
            Self::Lualatex => "lualatex",
        }
    }

    #[must_use]
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "pdflatex" => Some(Self::Pdflatex),
            "xelatex" => Some(Self::Xelatex),
            "lualatex" => Some(Self::Lualatex),
            _ => None,
        }
    }
}

impl std::fmt::Display for Engine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.command())
    }
}

/// Result of one compile invocation. `log` always carries whatever the
/// engine produced, success or not.
#[derive(Clone, Debug)]
pub struct CompileOutcome {
    pub success: bool,
    pub pdf_path: Option<PathBuf>,
    pub log: String,
    pub error_msg: Option<String>,
}

/// The toolchain seam. The pipeline only ever sees this trait; production
/// wires `TexLiveCompiler`, tests wire fakes.
pub trait LatexCompiler: Send + Sync {
    fn compile(
        &self,
        main_path: &Path,
        output_dir: &Path,
        engine: Engine,
        timeout: Duration,
    ) -> anyhow::Result<CompileOutcome>;
}

/// Shells out to a TeX Live engine in nonstop mode, killing the child on
/// timeout. Reruns once when the log asks for a second pass.
pub struct TexLiveCompiler;

impl TexLiveCompiler {
    #[must_use]
    pub fn new() -> Self {
        Self
    }

    fn run_once(
        &self,
        main_path: &Path,
        output_dir: &Path,
        engine: Engine,
        timeout: Duration,
    ) -> anyhow::Result<CompileOutcome> {
        let work_dir = main_path.parent().unwrap_or_else(|| Path::new("."));
        let main_name = main_path
            .file_name()
            .ok_or_else(|| anyhow::anyhow!("main path has no file name: {}", main_path.display()))?;
        std::fs::create_dir_all(output_dir)
            .with_context(|| format!("create output dir: {}", output_dir.display()))?;

        let mut child = Command::new(engine.command())
            .arg("-interaction=nonstopmode")
            .arg("-halt-on-error")
            .arg(format!("-output-directory={}", output_dir.display()))
            .arg(main_name)
            .current_dir(work_dir)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .spawn()
            .with_context(|| format!("spawn {}", engine.command()))?;

        // Drain stdout as the engine runs; an unread pipe fills up and
        // stalls the child.
        let stdout_reader = child.stdout.take().map(|mut out| {
            std::thread::spawn(move || {
                use std::io::Read;
                let mut buf = String::new();
                let _ = out.read_to_string(&mut buf);
                buf
            })
        });

        let deadline = Instant::now() + timeout;
        let status = loop {
            match child.try_wait().context("poll compiler")? {
                Some(status) => break Some(status),
                None => {
                    if Instant::now() >= deadline {
                        let _ = child.kill();
                        let _ = child.wait();
                        break None;
                    }
                    std::thread::sleep(Duration::from_millis(200));
                }
            }
        };

        let stem = main_path
            .file_stem()
            .and_then(|s| s.to_str())
            .unwrap_or("main");
        let log_path = output_dir.join(format!("{stem}.log"));
        let mut log = std::fs::read_to_string(&log_path).unwrap_or_default();
        if let Some(handle) = stdout_reader {
            if let Ok(buf) = handle.join() {
                if log.is_empty() {
                    log = buf;
                }
            }
        }

        let Some(status) = status else {
            return Ok(CompileOutcome {
                success: false,
                pdf_path: None,
                log,
                error_msg: Some(format!("{engine} 编译超时 ({}s)", timeout.as_secs())),
            });
        };

        let pdf_path = output_dir.join(format!("{stem}.pdf"));
        let produced = pdf_path.is_file()
            && std::fs::metadata(&pdf_path).map(|m| m.len() > 0).unwrap_or(false);
        let success = status.success() && produced;
        Ok(CompileOutcome {
            success,
            pdf_path: produced.then_some(pdf_path),
            log,
            error_msg: if success {
                None
            } else {
                Some(format!("{engine} 退出码 {:?}", status.code()))
            },
        })
    }
}

impl Default for TexLiveCompiler {
    fn default() -> Self {
        Self::new()
    }
}

impl LatexCompiler for TexLiveCompiler {
    fn compile(
        &self,
        main_path: &Path,
        output_dir: &Path,
        engine: Engine,
        timeout: Duration,
    ) -> anyhow::Result<CompileOutcome> {
        let first = self.run_once(main_path, output_dir, engine, timeout)?;
        if first.success && first.log.contains("Rerun to get cross-references") {
            return self.run_once(main_path, output_dir, engine, timeout);
        }
        Ok(first)
    }
}

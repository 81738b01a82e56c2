use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// Pipeline stage attached to persisted error records.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum ErrorStage {
    Download,
    Extract,
    OriginalCompile,
    Translation,
    TranslatedCompile,
    PdfGeneration,
    PageCountMismatch,
}

impl ErrorStage {
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Download => "download",
            Self::Extract => "extract",
            Self::OriginalCompile => "original_compile",
            Self::Translation => "translation",
            Self::TranslatedCompile => "translated_compile",
            Self::PdfGeneration => "pdf_generation",
            Self::PageCountMismatch => "page_count_mismatch",
        }
    }
}

/// Escalation level of the hierarchical fixer.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum FixLevel {
    Rule,
    Llm,
    Agent,
}

impl FixLevel {
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Rule => "rule",
            Self::Llm => "llm",
            Self::Agent => "agent",
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum EncodingErrorKind {
    UnconvertibleBytes,
    NotUtf8,
    BomRewriteFailed,
}

/// Error taxonomy of the translation core.
///
/// The display strings are the short user-facing messages; machine callers
/// match on the variant and its fields.
#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    #[error("无效的输入: {0}")]
    InvalidInput(String),

    #[error("文件不存在: {}", .0.display())]
    FileNotFound(PathBuf),

    #[error("下载失败: {0}")]
    DownloadFailed(String),

    #[error("解压失败: {0}")]
    ExtractionFailed(String),

    #[error("编译失败 ({engine}, {}): {log_excerpt}", stage.as_str())]
    CompileFailed {
        engine: String,
        stage: ErrorStage,
        log_excerpt: String,
    },

    #[error("翻译失败: {cause}")]
    TranslationFailed { cause: String },

    #[error("自动修复失败 (最高级别 {})", final_level.as_str())]
    FixFailed {
        final_level: FixLevel,
        log_excerpt: String,
    },

    #[error("编码错误: {kind:?}")]
    EncodingError { kind: EncodingErrorKind },

    #[error("已取消")]
    Cancelled,

    #[error("另一个任务正在运行")]
    AlreadyRunning,

    #[error("内部错误: {0}")]
    Internal(String),
}

impl PipelineError {
    /// Stage used when writing an error record for this failure.
    #[must_use]
    pub fn stage(&self) -> ErrorStage {
        match self {
            Self::InvalidInput(_) | Self::DownloadFailed(_) => ErrorStage::Download,
            Self::FileNotFound(_) | Self::ExtractionFailed(_) => ErrorStage::Extract,
            Self::CompileFailed { stage, .. } => *stage,
            Self::TranslationFailed { .. } => ErrorStage::Translation,
            Self::FixFailed { .. } => ErrorStage::TranslatedCompile,
            Self::EncodingError { .. } => ErrorStage::Translation,
            Self::Cancelled | Self::AlreadyRunning | Self::Internal(_) => ErrorStage::Translation,
        }
    }
}

pub type Result<T> = std::result::Result<T, PipelineError>;

/// Error record handed to the external error store.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ErrorRecord {
    pub id: String,
    pub title: String,
    pub input: String,
    pub stage: ErrorStage,
    pub message: String,
    pub timestamp: String,
    pub retry_count: u32,
    pub reported: bool,
}

/// External error store consumed by the orchestrator. Failures in the sink
/// itself are swallowed by callers; error reporting must never fail a run.
pub trait ErrorSink: Send + Sync {
    fn record(&self, record: &ErrorRecord);
}

/// Default sink: JSON lines appended to `errors.jsonl` under the results dir.
pub struct JsonlErrorSink {
    path: PathBuf,
}

impl JsonlErrorSink {
    #[must_use]
    pub fn new(path: PathBuf) -> Self {
        Self { path }
    }
}

impl ErrorSink for JsonlErrorSink {
    fn record(&self, record: &ErrorRecord) {
        let Ok(line) = serde_json::to_string(record) else {
            return;
        };
        if let Some(parent) = self.path.parent() {
            let _ = std::fs::create_dir_all(parent);
        }
        use std::io::Write;
        if let Ok(mut f) = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
        {
            let _ = writeln!(f, "{line}");
        }
    }
}

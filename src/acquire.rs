use std::fs::File;
use std::io::Read;
use std::path::{Path, PathBuf};

use md5::{Digest, Md5};
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use zip::ZipArchive;

use crate::error::{PipelineError, Result};

static ARXIV_NEW_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^\d{4}\.\d{4,5}(v\d+)?$").expect("arxiv id regex"));
static ARXIV_LEGACY_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[a-z\-]+/\d{7}$").expect("legacy arxiv id regex"));

/// What the user handed us. Immutable once parsed.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum SourceSpec {
    ArxivId(String),
    Url(String),
    LocalZipPath(PathBuf),
    LocalPdfPath(PathBuf),
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceType {
    Arxiv,
    Url,
    LocalZip,
    LocalPdf,
}

impl SourceSpec {
    /// Classify a raw input string. Order matters: arXiv ids are checked
    /// before URLs so `2301.00001` never reads as a relative path.
    pub fn parse(input: &str) -> Result<Self> {
        let input = input.trim();
        if input.is_empty() {
            return Err(PipelineError::InvalidInput("空输入".to_string()));
        }
        if ARXIV_NEW_RE.is_match(input) || ARXIV_LEGACY_RE.is_match(input) {
            return Ok(Self::ArxivId(input.to_string()));
        }
        if input.starts_with("http://") || input.starts_with("https://") {
            // arXiv abs/pdf links reduce to the id.
            if let Some(id) = arxiv_id_from_url(input) {
                return Ok(Self::ArxivId(id));
            }
            return Ok(Self::Url(input.to_string()));
        }
        let lower = input.to_ascii_lowercase();
        if lower.ends_with(".zip") {
            return Ok(Self::LocalZipPath(PathBuf::from(input)));
        }
        if lower.ends_with(".pdf") {
            return Ok(Self::LocalPdfPath(PathBuf::from(input)));
        }
        Err(PipelineError::InvalidInput(format!(
            "无法识别的输入: {input}"
        )))
    }

    #[must_use]
    pub fn source_type(&self) -> SourceType {
        match self {
            Self::ArxivId(_) => SourceType::Arxiv,
            Self::Url(_) => SourceType::Url,
            Self::LocalZipPath(_) => SourceType::LocalZip,
            Self::LocalPdfPath(_) => SourceType::LocalPdf,
        }
    }

    #[must_use]
    pub fn original_ref(&self) -> String {
        match self {
            Self::ArxivId(id) => id.clone(),
            Self::Url(url) => url.clone(),
            Self::LocalZipPath(p) | Self::LocalPdfPath(p) => p.display().to_string(),
        }
    }
}

fn arxiv_id_from_url(url: &str) -> Option<String> {
    for marker in ["/abs/", "/pdf/"] {
        if let Some(pos) = url.find(marker) {
            let tail = &url[pos + marker.len()..];
            let tail = tail.trim_end_matches(".pdf");
            let tail = tail.split(['?', '#']).next().unwrap_or(tail);
            if ARXIV_NEW_RE.is_match(tail) || ARXIV_LEGACY_RE.is_match(tail) {
                return Some(tail.to_string());
            }
        }
    }
    None
}

/// Download transport. Injected; the core never opens a socket itself.
pub trait Downloader: Send + Sync {
    fn download_url(&self, url: &str) -> anyhow::Result<PathBuf>;
    fn download_by_id(&self, id: &str) -> anyhow::Result<PathBuf>;
}

/// Extracted project tree plus everything later phases need to know about
/// where it came from.
#[derive(Clone, Debug)]
pub struct SourceInfo {
    pub extract_dir: PathBuf,
    pub main_tex: PathBuf,
    pub all_tex_files: Vec<PathBuf>,
    pub source_type: SourceType,
    pub original_ref: String,
}

pub struct SourceAcquirer<'a> {
    downloader: Option<&'a dyn Downloader>,
    max_extract_bytes: u64,
}

impl<'a> SourceAcquirer<'a> {
    #[must_use]
    pub fn new(downloader: Option<&'a dyn Downloader>, max_extract_bytes: u64) -> Self {
        Self {
            downloader,
            max_extract_bytes,
        }
    }

    /// Resolve the spec to a local archive and extract it into
    /// `extract_dir`. The PDF variant has no LaTeX source to extract and is
    /// rejected here.
    pub fn acquire(&self, spec: &SourceSpec, extract_dir: &Path) -> Result<()> {
        let archive = match spec {
            SourceSpec::ArxivId(id) => self
                .downloader
                .ok_or_else(|| {
                    PipelineError::DownloadFailed("未配置下载器".to_string())
                })?
                .download_by_id(id)
                .map_err(|e| PipelineError::DownloadFailed(e.to_string()))?,
            SourceSpec::Url(url) => self
                .downloader
                .ok_or_else(|| {
                    PipelineError::DownloadFailed("未配置下载器".to_string())
                })?
                .download_url(url)
                .map_err(|e| PipelineError::DownloadFailed(e.to_string()))?,
            SourceSpec::LocalZipPath(p) => {
                if !p.is_file() {
                    return Err(PipelineError::FileNotFound(p.clone()));
                }
                p.clone()
            }
            SourceSpec::LocalPdfPath(_) => {
                return Err(PipelineError::InvalidInput(
                    "PDF 输入不走 LaTeX 翻译流程".to_string(),
                ));
            }
        };
        extract_archive(&archive, extract_dir, self.max_extract_bytes)
    }
}

/// Dispatch on the archive's magic bytes: zip or gzip'd tar (the two
/// bundle formats paper sources come in).
pub fn extract_archive(archive: &Path, dest: &Path, max_bytes: u64) -> Result<()> {
    let mut head = [0u8; 4];
    {
        let mut f =
            File::open(archive).map_err(|_| PipelineError::FileNotFound(archive.to_path_buf()))?;
        let n = f
            .read(&mut head)
            .map_err(|e| PipelineError::ExtractionFailed(format!("读取文件头失败: {e}")))?;
        if n < 2 {
            return Err(PipelineError::ExtractionFailed("文件过小".to_string()));
        }
    }
    if head[..2] == [0x1F, 0x8B] {
        return extract_tar_gz(archive, dest, max_bytes);
    }
    if head[..4] == [b'P', b'K', 0x03, 0x04] || head[..2] == [b'P', b'K'] {
        return extract_zip(archive, dest, max_bytes);
    }
    Err(PipelineError::ExtractionFailed(
        "无法识别的压缩格式 (期望 zip 或 tar.gz)".to_string(),
    ))
}

/// tar.gz extraction under the same guards as the zip path.
pub fn extract_tar_gz(archive: &Path, dest: &Path, max_bytes: u64) -> Result<()> {
    let f = File::open(archive).map_err(|_| PipelineError::FileNotFound(archive.to_path_buf()))?;
    let gz = flate2::read::GzDecoder::new(f);
    let mut tar = tar::Archive::new(gz);

    std::fs::create_dir_all(dest)
        .map_err(|e| PipelineError::ExtractionFailed(format!("创建目录失败: {e}")))?;

    let mut total: u64 = 0;
    let entries = tar
        .entries()
        .map_err(|e| PipelineError::ExtractionFailed(format!("读取压缩包失败: {e}")))?;
    for entry in entries {
        let mut entry =
            entry.map_err(|e| PipelineError::ExtractionFailed(format!("损坏的条目: {e}")))?;
        let kind = entry.header().entry_type();
        if kind.is_symlink() || kind.is_hard_link() {
            return Err(PipelineError::ExtractionFailed(format!(
                "拒绝符号链接: {}",
                entry.path().map(|p| p.display().to_string()).unwrap_or_default()
            )));
        }

        let rel = entry
            .path()
            .map_err(|e| PipelineError::ExtractionFailed(format!("非法路径: {e}")))?
            .into_owned();
        if rel.is_absolute()
            || rel
                .components()
                .any(|c| matches!(c, std::path::Component::ParentDir | std::path::Component::Prefix(_)))
        {
            return Err(PipelineError::ExtractionFailed(format!(
                "非法路径: {}",
                rel.display()
            )));
        }

        let out_path = dest.join(&rel);
        if kind.is_dir() {
            std::fs::create_dir_all(&out_path)
                .map_err(|e| PipelineError::ExtractionFailed(format!("创建目录失败: {e}")))?;
            continue;
        }
        if !kind.is_file() {
            continue;
        }
        if let Some(parent) = out_path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| PipelineError::ExtractionFailed(format!("创建目录失败: {e}")))?;
        }

        total = total.saturating_add(entry.size());
        if total > max_bytes {
            return Err(PipelineError::ExtractionFailed(format!(
                "解压超出大小限制 ({max_bytes} 字节)"
            )));
        }
        let mut out = File::create(&out_path)
            .map_err(|e| PipelineError::ExtractionFailed(format!("写文件失败: {e}")))?;
        let mut limited = (&mut entry).take(max_bytes);
        std::io::copy(&mut limited, &mut out)
            .map_err(|e| PipelineError::ExtractionFailed(format!("写文件失败: {e}")))?;
    }
    Ok(())
}

/// Extract a zip with the usual hostile-archive guards: no path traversal,
/// no absolute entries, no symlinks, bounded total size.
pub fn extract_zip(archive: &Path, dest: &Path, max_bytes: u64) -> Result<()> {
    let f = File::open(archive).map_err(|_| PipelineError::FileNotFound(archive.to_path_buf()))?;
    let mut zip = ZipArchive::new(f)
        .map_err(|e| PipelineError::ExtractionFailed(format!("读取压缩包失败: {e}")))?;

    std::fs::create_dir_all(dest)
        .map_err(|e| PipelineError::ExtractionFailed(format!("创建目录失败: {e}")))?;

    let mut total: u64 = 0;
    for i in 0..zip.len() {
        let mut entry = zip
            .by_index(i)
            .map_err(|e| PipelineError::ExtractionFailed(format!("损坏的条目: {e}")))?;

        let Some(rel) = entry.enclosed_name() else {
            return Err(PipelineError::ExtractionFailed(format!(
                "非法路径: {}",
                entry.name()
            )));
        };
        let rel = rel.to_path_buf();
        if let Some(mode) = entry.unix_mode() {
            if mode & 0o170000 == 0o120000 {
                return Err(PipelineError::ExtractionFailed(format!(
                    "拒绝符号链接: {}",
                    entry.name()
                )));
            }
        }

        let out_path = dest.join(&rel);
        if entry.is_dir() {
            std::fs::create_dir_all(&out_path)
                .map_err(|e| PipelineError::ExtractionFailed(format!("创建目录失败: {e}")))?;
            continue;
        }
        if let Some(parent) = out_path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| PipelineError::ExtractionFailed(format!("创建目录失败: {e}")))?;
        }

        total = total.saturating_add(entry.size());
        if total > max_bytes {
            return Err(PipelineError::ExtractionFailed(format!(
                "解压超出大小限制 ({max_bytes} 字节)"
            )));
        }

        let mut out = File::create(&out_path)
            .map_err(|e| PipelineError::ExtractionFailed(format!("写文件失败: {e}")))?;
        // Bound actual bytes too; entry.size() comes from the header and
        // can lie.
        let mut limited = (&mut entry).take(max_bytes);
        std::io::copy(&mut limited, &mut out)
            .map_err(|e| PipelineError::ExtractionFailed(format!("写文件失败: {e}")))?;
    }
    Ok(())
}

/// MD5 of a file, streamed; feeds non-arXiv paper identities.
pub fn file_md5_hex(path: &Path) -> anyhow::Result<String> {
    use anyhow::Context;
    let mut f = File::open(path).with_context(|| format!("open: {}", path.display()))?;
    let mut hasher = Md5::new();
    let mut buf = [0u8; 64 * 1024];
    loop {
        let n = f.read(&mut buf).context("read")?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(hex::encode(hasher.finalize()))
}

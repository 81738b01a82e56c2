use std::io::Write;
use std::path::{Path, PathBuf};

use anyhow::Context;
use chrono::{SecondsFormat, Utc};
use serde::{Deserialize, Serialize};

use crate::acquire::{file_md5_hex, SourceSpec, SourceType};

/// Phase ladder persisted per paper. Ordered: a record at a given status
/// has produced every artifact its predecessors imply. `Error` sits outside
/// the ladder and can be re-entered from any phase.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TranslationStatus {
    Pending,
    Downloading,
    Extracted,
    OriginalCompiled,
    Translating,
    Translated,
    Compiling,
    Complete,
    Error,
}

impl TranslationStatus {
    /// Rank along the forward ladder; `Error` has none.
    #[must_use]
    pub fn rank(&self) -> Option<u8> {
        match self {
            Self::Pending => Some(0),
            Self::Downloading => Some(1),
            Self::Extracted => Some(2),
            Self::OriginalCompiled => Some(3),
            Self::Translating => Some(4),
            Self::Translated => Some(5),
            Self::Compiling => Some(6),
            Self::Complete => Some(7),
            Self::Error => None,
        }
    }

    /// Monotone advance check used by the store's checkpoint writes.
    #[must_use]
    pub fn may_transition_to(&self, next: TranslationStatus) -> bool {
        match (self.rank(), next.rank()) {
            // Any state may fail; an errored run may resume anywhere.
            (_, None) | (None, _) => true,
            (Some(a), Some(b)) => b >= a,
        }
    }
}

/// Persisted per-paper record. Owned by the store: the orchestrator only
/// ever mutates it through `ResultStore::save`. Unknown JSON fields
/// round-trip untouched.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct PaperRecord {
    pub id: String,
    #[serde(default)]
    pub title: String,
    pub status: TranslationStatus,
    pub original_input: String,
    pub source_type: SourceType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_md5: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub main_tex_rel: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub original_pdf_path: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub translated_pdf_path: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bilingual_pdf_path: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_dir: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_msg: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub translated_at: Option<String>,
    #[serde(default)]
    pub retry_count: u32,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

impl PaperRecord {
    #[must_use]
    pub fn new(id: String, original_input: String, source_type: SourceType) -> Self {
        Self {
            id,
            title: String::new(),
            status: TranslationStatus::Pending,
            original_input,
            source_type,
            source_md5: None,
            main_tex_rel: None,
            original_pdf_path: None,
            translated_pdf_path: None,
            bilingual_pdf_path: None,
            source_dir: None,
            error_msg: None,
            translated_at: None,
            retry_count: 0,
            extra: serde_json::Map::new(),
        }
    }
}

#[derive(Clone, Debug)]
pub struct PaperSummary {
    pub id: String,
    pub title: String,
    pub status: TranslationStatus,
    pub translated_at: Option<String>,
}

/// What duplicate detection found for an incoming source.
#[derive(Clone, Debug)]
pub struct ExistingInfo {
    pub record: PaperRecord,
    pub complete: bool,
    pub continuable: bool,
}

/// Content-addressed per-paper directories under a results root:
/// `<root>/<id>/{info.json, original.pdf, translated.pdf, bilingual.pdf,
/// latex/}`. Record writes are atomic (temp + fsync + rename).
pub struct ResultStore {
    root: PathBuf,
}

impl ResultStore {
    pub fn new(root: PathBuf) -> anyhow::Result<Self> {
        std::fs::create_dir_all(&root)
            .with_context(|| format!("create results dir: {}", root.display()))?;
        Ok(Self { root })
    }

    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    #[must_use]
    pub fn paper_dir(&self, id: &str) -> PathBuf {
        self.root.join(sanitize_id(id))
    }

    #[must_use]
    pub fn latex_dir(&self, id: &str) -> PathBuf {
        self.paper_dir(id).join("latex")
    }

    fn record_path(&self, id: &str) -> PathBuf {
        self.paper_dir(id).join("info.json")
    }

    /// Persist a record. Refuses a backwards status move; everything else
    /// is temp-write, fsync, rename.
    pub fn save(&self, record: &PaperRecord) -> anyhow::Result<()> {
        if let Ok(Some(existing)) = self.try_load(&record.id) {
            if !existing.status.may_transition_to(record.status) {
                anyhow::bail!(
                    "status may not move backwards: {:?} -> {:?} (id={})",
                    existing.status,
                    record.status,
                    record.id
                );
            }
        }

        let dir = self.paper_dir(&record.id);
        std::fs::create_dir_all(&dir)
            .with_context(|| format!("create paper dir: {}", dir.display()))?;

        // serde_json's default map keeps keys sorted, which gives the
        // canonical form the layout promises.
        let value = serde_json::to_value(record).context("serialize record")?;
        let body = serde_json::to_string_pretty(&value).context("render record json")?;

        let mut tmp = tempfile::NamedTempFile::new_in(&dir).context("create temp record")?;
        tmp.write_all(body.as_bytes()).context("write temp record")?;
        tmp.flush().context("flush temp record")?;
        tmp.as_file().sync_all().context("fsync temp record")?;
        tmp.persist(self.record_path(&record.id))
            .map_err(|e| anyhow::anyhow!("persist record: {e}"))?;
        Ok(())
    }

    pub fn load(&self, id: &str) -> anyhow::Result<PaperRecord> {
        self.try_load(id)?
            .ok_or_else(|| anyhow::anyhow!("record not found: {id}"))
    }

    pub fn try_load(&self, id: &str) -> anyhow::Result<Option<PaperRecord>> {
        let path = self.record_path(id);
        if !path.is_file() {
            return Ok(None);
        }
        let text = std::fs::read_to_string(&path)
            .with_context(|| format!("read record: {}", path.display()))?;
        let record: PaperRecord =
            serde_json::from_str(&text).with_context(|| format!("parse record: {}", path.display()))?;
        Ok(Some(record))
    }

    #[must_use]
    pub fn exists(&self, id: &str) -> bool {
        self.record_path(id).is_file()
    }

    pub fn delete(&self, id: &str) -> anyhow::Result<()> {
        let dir = self.paper_dir(id);
        if dir.is_dir() {
            std::fs::remove_dir_all(&dir)
                .with_context(|| format!("delete paper dir: {}", dir.display()))?;
        }
        Ok(())
    }

    pub fn list(&self) -> anyhow::Result<Vec<PaperSummary>> {
        let mut out = Vec::new();
        for entry in std::fs::read_dir(&self.root)
            .with_context(|| format!("read results dir: {}", self.root.display()))?
        {
            let entry = entry.context("dir entry")?;
            if !entry.file_type().map(|t| t.is_dir()).unwrap_or(false) {
                continue;
            }
            let Some(id) = entry.file_name().to_str().map(String::from) else {
                continue;
            };
            let Ok(Some(record)) = self.try_load(&id) else {
                continue;
            };
            out.push(PaperSummary {
                id: record.id,
                title: record.title,
                status: record.status,
                translated_at: record.translated_at,
            });
        }
        out.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(out)
    }

    /// Identity for a spec, when computable without touching the network:
    /// arXiv ids map directly, local files hash to `md5_<first16>`.
    pub fn id_for_spec(&self, spec: &SourceSpec) -> anyhow::Result<Option<String>> {
        match spec {
            SourceSpec::ArxivId(id) => Ok(Some(id.clone())),
            SourceSpec::LocalZipPath(p) | SourceSpec::LocalPdfPath(p) => {
                let md5 = file_md5_hex(p)?;
                Ok(Some(format!("md5_{}", &md5[..16])))
            }
            SourceSpec::Url(_) => Ok(None),
        }
    }

    /// Duplicate detection: is this source already (fully or partly) done?
    pub fn check_existing(&self, spec: &SourceSpec) -> anyhow::Result<Option<ExistingInfo>> {
        let Some(id) = self.id_for_spec(spec)? else {
            return Ok(None);
        };
        let Some(record) = self.try_load(&id)? else {
            return Ok(None);
        };

        let complete = record.status == TranslationStatus::Complete
            && record
                .translated_pdf_path
                .as_deref()
                .map(|p| Path::new(p).is_file())
                .unwrap_or(false);
        let continuable = !complete
            && (record.source_dir.as_deref().map(|p| Path::new(p).is_dir()).unwrap_or(false)
                || record
                    .original_pdf_path
                    .as_deref()
                    .map(|p| Path::new(p).is_file())
                    .unwrap_or(false));
        Ok(Some(ExistingInfo {
            record,
            complete,
            continuable,
        }))
    }
}

/// ISO-8601 UTC timestamp for `translated_at`.
#[must_use]
pub fn now_iso8601() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true)
}

fn sanitize_id(id: &str) -> String {
    id.chars()
        .map(|c| match c {
            '/' | '\\' | ':' | '*' | '?' | '"' | '<' | '>' | '|' => '_',
            c => c,
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(id: &str) -> PaperRecord {
        PaperRecord::new(id.to_string(), id.to_string(), SourceType::Arxiv)
    }

    #[test]
    fn save_load_round_trips_including_unknown_fields() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = ResultStore::new(dir.path().to_path_buf()).expect("store");
        let mut rec = record("2301.00001");
        rec.title = "样例论文".to_string();
        rec.extra.insert(
            "legacy_field".to_string(),
            serde_json::Value::String("kept".to_string()),
        );
        store.save(&rec).expect("save");

        let loaded = store.load("2301.00001").expect("load");
        assert_eq!(loaded, rec);
        assert_eq!(
            loaded.extra.get("legacy_field").and_then(|v| v.as_str()),
            Some("kept")
        );
    }

    #[test]
    fn record_json_has_sorted_keys() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = ResultStore::new(dir.path().to_path_buf()).expect("store");
        store.save(&record("2301.00001")).expect("save");
        let text =
            std::fs::read_to_string(dir.path().join("2301.00001/info.json")).expect("read");
        let id_pos = text.find("\"id\"").expect("id");
        let status_pos = text.find("\"status\"").expect("status");
        assert!(id_pos < status_pos);
    }

    #[test]
    fn status_cannot_move_backwards() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = ResultStore::new(dir.path().to_path_buf()).expect("store");
        let mut rec = record("2301.00001");
        rec.status = TranslationStatus::Translated;
        store.save(&rec).expect("save");

        rec.status = TranslationStatus::Extracted;
        assert!(store.save(&rec).is_err());

        // Forward and error transitions stay legal.
        rec.status = TranslationStatus::Complete;
        store.save(&rec).expect("forward");
        rec.status = TranslationStatus::Error;
        store.save(&rec).expect("error");
        rec.status = TranslationStatus::Translating;
        store.save(&rec).expect("resume after error");
    }

    #[test]
    fn list_is_sorted_by_id() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = ResultStore::new(dir.path().to_path_buf()).expect("store");
        store.save(&record("b")).expect("save");
        store.save(&record("a")).expect("save");
        let ids: Vec<String> = store.list().expect("list").into_iter().map(|s| s.id).collect();
        assert_eq!(ids, vec!["a".to_string(), "b".to_string()]);
    }

    #[test]
    fn delete_removes_the_whole_paper_dir() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = ResultStore::new(dir.path().to_path_buf()).expect("store");
        store.save(&record("x")).expect("save");
        std::fs::create_dir_all(store.latex_dir("x")).expect("latex dir");
        assert!(store.exists("x"));
        store.delete("x").expect("delete");
        assert!(!store.exists("x"));
        assert!(!store.paper_dir("x").exists());
    }

    #[test]
    fn md5_identity_for_local_zip() {
        let dir = tempfile::tempdir().expect("tempdir");
        let zip_path = dir.path().join("p.zip");
        std::fs::write(&zip_path, b"abc").expect("write");
        let store = ResultStore::new(dir.path().join("results")).expect("store");
        let id = store
            .id_for_spec(&SourceSpec::LocalZipPath(zip_path))
            .expect("id")
            .expect("some");
        assert_eq!(id, "md5_900150983cd24fb0");
    }

    #[test]
    fn check_existing_reports_complete_and_continuable() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = ResultStore::new(dir.path().to_path_buf()).expect("store");
        let spec = SourceSpec::ArxivId("2301.00001".to_string());
        assert!(store.check_existing(&spec).expect("check").is_none());

        let pdf = dir.path().join("translated.pdf");
        std::fs::write(&pdf, b"%PDF-1.4").expect("write");
        let mut rec = record("2301.00001");
        rec.status = TranslationStatus::Complete;
        rec.translated_pdf_path = Some(pdf.display().to_string());
        store.save(&rec).expect("save");
        let info = store.check_existing(&spec).expect("check").expect("some");
        assert!(info.complete);
        assert!(!info.continuable);
    }
}

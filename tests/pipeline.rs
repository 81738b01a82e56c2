use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use paper_translator::acquire::{Downloader, SourceSpec};
use paper_translator::compiler::{CompileOutcome, Engine, LatexCompiler};
use paper_translator::config::{AppConfig, Settings};
use paper_translator::error::{ErrorRecord, ErrorSink, PipelineError};
use paper_translator::llm::{LlmClient, LlmReply};
use paper_translator::pipeline::PipelineOrchestrator;
use paper_translator::progress::{Phase, Status, StatusListener};
use paper_translator::store::{PaperRecord, ResultStore, TranslationStatus};
use paper_translator::translate::PromptCatalog;

// ---------------------------------------------------------------------
// Fakes
// ---------------------------------------------------------------------

/// Compiler double: succeeds unless the main file contains a poison
/// marker, and emits a fake PDF with a page count derived from content
/// length.
struct FakeCompiler {
    calls: AtomicUsize,
    panic_on_call: bool,
}

impl FakeCompiler {
    fn new() -> Self {
        Self {
            calls: AtomicUsize::new(0),
            panic_on_call: false,
        }
    }
}

fn fake_pdf(pages: usize) -> Vec<u8> {
    let mut out = b"%PDF-1.4\n".to_vec();
    out.extend_from_slice(
        format!("1 0 obj\n<< /Type /Pages /Count {pages} /Kids [] >>\nendobj\n").as_bytes(),
    );
    out.extend_from_slice(b"%%EOF\n");
    out
}

impl LatexCompiler for FakeCompiler {
    fn compile(
        &self,
        main_path: &Path,
        output_dir: &Path,
        _engine: Engine,
        _timeout: Duration,
    ) -> anyhow::Result<CompileOutcome> {
        assert!(!self.panic_on_call, "compiler must not run in this scenario");
        self.calls.fetch_add(1, Ordering::SeqCst);
        let text = std::fs::read_to_string(main_path)?;
        if text.contains("x_2") && !text.contains("$x_2$") {
            return Ok(CompileOutcome {
                success: false,
                pdf_path: None,
                log: "! Missing $ inserted.\n<inserted text>\nl.3 x_2\n".to_string(),
                error_msg: Some("missing dollar".to_string()),
            });
        }
        let stem = main_path
            .file_stem()
            .and_then(|s| s.to_str())
            .unwrap_or("main");
        let pdf = output_dir.join(format!("{stem}.pdf"));
        std::fs::create_dir_all(output_dir)?;
        std::fs::write(&pdf, fake_pdf(4))?;
        Ok(CompileOutcome {
            success: true,
            pdf_path: Some(pdf),
            log: String::new(),
            error_msg: None,
        })
    }
}

/// Translation double: passes the LaTeX through, prepending a Chinese
/// marker comment, optionally poisoning the output with a translated
/// command so the rule fixer has work to do.
struct FakeLlm {
    calls: AtomicUsize,
    poison: bool,
    panic_on_call: bool,
}

impl FakeLlm {
    fn new(poison: bool) -> Self {
        Self {
            calls: AtomicUsize::new(0),
            poison,
            panic_on_call: false,
        }
    }

    fn panicking() -> Self {
        Self {
            calls: AtomicUsize::new(0),
            poison: false,
            panic_on_call: true,
        }
    }
}

impl LlmClient for FakeLlm {
    fn translate(&self, prompt: &str) -> anyhow::Result<LlmReply> {
        assert!(!self.panic_on_call, "llm must not run in this scenario");
        self.calls.fetch_add(1, Ordering::SeqCst);
        let body = prompt
            .split("LaTeX 片段:\n")
            .nth(1)
            .unwrap_or(prompt)
            .trim_end_matches('\n');
        let mut out = body.to_string();
        if self.poison && out.contains("related work") {
            // A bare subscript outside math mode: only the log-triggered
            // rule level can repair it after the first failing compile.
            out = out.replace("related work", "相关工作 x_2");
        }
        Ok(LlmReply {
            text: out,
            tokens_used: 11,
        })
    }
}

struct FakeDownloader {
    archive: PathBuf,
    panic_on_call: bool,
}

impl Downloader for FakeDownloader {
    fn download_url(&self, _url: &str) -> anyhow::Result<PathBuf> {
        assert!(!self.panic_on_call, "downloader must not run in this scenario");
        Ok(self.archive.clone())
    }

    fn download_by_id(&self, _id: &str) -> anyhow::Result<PathBuf> {
        assert!(!self.panic_on_call, "downloader must not run in this scenario");
        Ok(self.archive.clone())
    }
}

#[derive(Default)]
struct RecordingSink {
    records: Mutex<Vec<ErrorRecord>>,
}

impl ErrorSink for RecordingSink {
    fn record(&self, record: &ErrorRecord) {
        self.records.lock().expect("records").push(record.clone());
    }
}

#[derive(Default)]
struct RecordingListener {
    events: Mutex<Vec<(Phase, u8, String)>>,
}

impl StatusListener for RecordingListener {
    fn on_status(&self, status: &Status) {
        self.events
            .lock()
            .expect("events")
            .push((status.phase, status.progress, status.message.clone()));
    }
}

// ---------------------------------------------------------------------
// Harness
// ---------------------------------------------------------------------

const MAIN_TEX: &str = "\\documentclass{article}\n\
\\title{A Sample Paper}\n\
\\begin{document}\n\
This paper studies the related work in depth.\n\
We present results over three datasets here.\n\
\\end{document}\n";

fn make_zip(path: &Path, entries: &[(&str, &str)]) {
    let f = std::fs::File::create(path).expect("create zip");
    let mut w = zip::ZipWriter::new(f);
    for (name, data) in entries {
        w.start_file(*name, zip::write::SimpleFileOptions::default())
            .expect("start");
        w.write_all(data.as_bytes()).expect("write");
    }
    w.finish().expect("finish");
}

struct Harness {
    _tmp: tempfile::TempDir,
    orchestrator: PipelineOrchestrator,
    listener: Arc<RecordingListener>,
    sink: Arc<RecordingSink>,
    llm: Arc<FakeLlm>,
    compiler: Arc<FakeCompiler>,
    results_dir: PathBuf,
    zip_path: PathBuf,
}

fn harness(llm: FakeLlm, compiler: FakeCompiler) -> Harness {
    let tmp = tempfile::tempdir().expect("tempdir");
    let results_dir = tmp.path().join("results");
    let zip_path = tmp.path().join("paper.zip");
    make_zip(&zip_path, &[("main.tex", MAIN_TEX)]);

    let cfg = AppConfig::default();
    let mut settings = Settings::from_config(&cfg, tmp.path()).expect("settings");
    settings.results_dir = results_dir.clone();
    settings.work_dir = tmp.path().join("work");
    settings.trace_dir = tmp.path().join("trace");
    settings.concurrency = 2;

    let listener = Arc::new(RecordingListener::default());
    let sink = Arc::new(RecordingSink::default());
    let llm = Arc::new(llm);
    let compiler = Arc::new(compiler);
    let store = ResultStore::new(results_dir.clone()).expect("store");
    let downloader = Arc::new(FakeDownloader {
        archive: zip_path.clone(),
        panic_on_call: false,
    });

    let orchestrator = PipelineOrchestrator::new(
        settings,
        store,
        compiler.clone(),
        llm.clone(),
        Some(downloader),
        sink.clone(),
        listener.clone(),
        PromptCatalog::default(),
    )
    .expect("orchestrator");

    Harness {
        _tmp: tmp,
        orchestrator,
        listener,
        sink,
        llm,
        compiler,
        results_dir,
        zip_path,
    }
}

// ---------------------------------------------------------------------
// Scenarios
// ---------------------------------------------------------------------

#[test]
fn fresh_local_zip_happy_path() {
    let h = harness(FakeLlm::new(false), FakeCompiler::new());
    let spec = SourceSpec::LocalZipPath(h.zip_path.clone());
    let result = h.orchestrator.process_source(&spec).expect("run");

    assert_eq!(result.record.status, TranslationStatus::Complete);
    assert!(result.record.id.starts_with("md5_"));
    assert_eq!(result.record.title, "A Sample Paper");
    assert!(result.original_pdf.is_file());
    assert!(result.translated_pdf.is_file());
    assert!(result.record.translated_at.is_some());

    // Translated main carries the prefix, lives beside the original, is
    // BOM-less UTF-8, and gained ctex.
    let paper_dir = h.results_dir.join(&result.record.id);
    let translated_main = paper_dir.join("latex/translated_main.tex");
    assert!(translated_main.is_file());
    let bytes = std::fs::read(&translated_main).expect("read");
    assert!(!bytes.starts_with(&[0xEF, 0xBB, 0xBF]));
    let text = String::from_utf8(bytes).expect("utf8");
    assert!(text.contains("\\usepackage{ctex}"));

    // Status stream: expected phases in order, progress monotone.
    let events = h.listener.events.lock().expect("events").clone();
    let phases: Vec<Phase> = events.iter().map(|(p, _, _)| *p).collect();
    for expected in [
        Phase::Idle,
        Phase::Downloading,
        Phase::Extracting,
        Phase::Compiling,
        Phase::Translating,
        Phase::Validating,
        Phase::Complete,
    ] {
        assert!(phases.contains(&expected), "missing phase {expected:?}");
    }
    let progress: Vec<u8> = events.iter().map(|(_, p, _)| *p).collect();
    let mut sorted = progress.clone();
    sorted.sort_unstable();
    assert_eq!(progress, sorted, "progress went backwards: {progress:?}");
    assert_eq!(*progress.last().expect("events"), 100);

    assert!(h.llm.calls.load(Ordering::SeqCst) > 0);
    assert!(h.compiler.calls.load(Ordering::SeqCst) >= 2);
    assert!(h.sink.records.lock().expect("sink").is_empty());
}

#[test]
fn existing_complete_run_returns_without_work() {
    let h = harness(FakeLlm::new(false), FakeCompiler::new());
    let spec = SourceSpec::LocalZipPath(h.zip_path.clone());
    let first = h.orchestrator.process_source(&spec).expect("first run");

    let llm_calls = h.llm.calls.load(Ordering::SeqCst);
    let compiler_calls = h.compiler.calls.load(Ordering::SeqCst);

    // force=false on a completed record: no download, no translation, no
    // compile; the persisted artifacts come back as-is.
    let again = h.orchestrator.process_source(&spec).expect("second run");
    assert_eq!(again.record.id, first.record.id);
    assert_eq!(again.record.translated_at, first.record.translated_at);
    assert_eq!(h.llm.calls.load(Ordering::SeqCst), llm_calls);
    assert_eq!(h.compiler.calls.load(Ordering::SeqCst), compiler_calls);
}

#[test]
fn force_rerun_deletes_and_rebuilds() {
    let h = harness(FakeLlm::new(false), FakeCompiler::new());
    let spec = SourceSpec::LocalZipPath(h.zip_path.clone());
    let first = h.orchestrator.process_source(&spec).expect("first run");

    // Sentinel file must vanish with the forced delete.
    let paper_dir = h.results_dir.join(&first.record.id);
    let sentinel = paper_dir.join("sentinel.txt");
    std::fs::write(&sentinel, "x").expect("write");

    let llm_calls_before = h.llm.calls.load(Ordering::SeqCst);
    let second = h
        .orchestrator
        .process_source_with_force(&spec, true)
        .expect("forced run");
    assert_eq!(second.record.status, TranslationStatus::Complete);
    assert!(!sentinel.exists());
    assert!(h.llm.calls.load(Ordering::SeqCst) > llm_calls_before);
}

#[test]
fn resume_after_translated_compile_failure_skips_translation() {
    // Seed a store by hand: Error record, original.pdf on disk, source
    // tree with a translated main ready to compile.
    let h = harness(FakeLlm::panicking(), FakeCompiler::new());
    let id = "2301.00001";
    let store = ResultStore::new(h.results_dir.clone()).expect("store");
    let paper_dir = store.paper_dir(id);
    let latex_dir = store.latex_dir(id);
    std::fs::create_dir_all(&latex_dir).expect("mkdir");
    std::fs::write(latex_dir.join("main.tex"), MAIN_TEX).expect("write main");
    std::fs::write(
        latex_dir.join("translated_main.tex"),
        MAIN_TEX.replace("This paper", "本文"),
    )
    .expect("write translated");
    std::fs::write(paper_dir.join("original.pdf"), fake_pdf(4)).expect("write pdf");

    let mut record = PaperRecord::new(
        id.to_string(),
        id.to_string(),
        paper_translator::acquire::SourceType::Arxiv,
    );
    record.status = TranslationStatus::Error;
    record.error_msg = Some("编译失败".to_string());
    record.main_tex_rel = Some("main.tex".to_string());
    record.source_dir = Some(latex_dir.display().to_string());
    record.original_pdf_path = Some(paper_dir.join("original.pdf").display().to_string());
    store.save(&record).expect("seed");

    let result = h.orchestrator.continue_translation(id).expect("resume");
    assert_eq!(result.record.status, TranslationStatus::Complete);
    assert!(result.translated_pdf.is_file());
    // The panicking LLM proves no re-translation happened; the compiler
    // ran only for the translated doc (and the bilingual merge).
    assert!(h.compiler.calls.load(Ordering::SeqCst) >= 1);
}

#[test]
fn rule_fixer_repairs_missing_dollar_without_llm_fix() {
    // The poisoned LLM leaves a bare subscript in the translation; the
    // fake compiler rejects it with a missing-$ log; the rule level wraps
    // it in math mode and the re-compile passes without ever consulting
    // the LLM fixer.
    let h = harness(FakeLlm::new(true), FakeCompiler::new());
    let spec = SourceSpec::LocalZipPath(h.zip_path.clone());
    let result = h.orchestrator.process_source(&spec).expect("run");
    assert_eq!(result.record.status, TranslationStatus::Complete);

    let translated = std::fs::read_to_string(
        h.results_dir
            .join(&result.record.id)
            .join("latex/translated_main.tex"),
    )
    .expect("read");
    assert!(translated.contains("$x_2$"), "got: {translated}");

    // A repair status was surfaced while the fix controller ran.
    let events = h.listener.events.lock().expect("events").clone();
    assert!(events
        .iter()
        .any(|(phase, _, msg)| *phase == Phase::Validating && msg.contains("修复")));
}

#[test]
fn second_concurrent_run_is_rejected() {
    let h = harness(FakeLlm::new(false), FakeCompiler::new());
    let spec = SourceSpec::LocalZipPath(h.zip_path.clone());
    let gate = Arc::new(AtomicBool::new(false));

    std::thread::scope(|scope| {
        let orchestrator = &h.orchestrator;
        let spec_a = spec.clone();
        let gate_a = gate.clone();
        let first = scope.spawn(move || {
            // Cancel after the second call has been observed rejected.
            let token = orchestrator.cancel_token();
            let waiter = std::thread::spawn({
                let gate = gate_a.clone();
                move || {
                    while !gate.load(Ordering::SeqCst) {
                        std::thread::sleep(Duration::from_millis(5));
                    }
                    token.cancel();
                }
            });
            let result = orchestrator.process_source(&spec_a);
            waiter.join().expect("waiter");
            result
        });

        // Give the first run a moment to take the slot, then collide.
        std::thread::sleep(Duration::from_millis(50));
        let second = h.orchestrator.process_source(&spec);
        let second_rejected = matches!(second, Err(PipelineError::AlreadyRunning));
        gate.store(true, Ordering::SeqCst);

        let first_result = first.join().expect("join");
        // Either the first run completed before the collision or it was
        // cancelled after it; the second call must have been rejected
        // while the first held the slot.
        if second_rejected {
            assert!(first_result.is_ok() || matches!(first_result, Err(PipelineError::Cancelled)));
        } else {
            // The first run finished before the second started; that run
            // must have returned the completed result instead.
            assert!(second.is_ok());
        }
    });
}

#[test]
fn cancellation_before_translating_persists_cancelled_error() {
    let h = harness(FakeLlm::panicking(), FakeCompiler::new());
    let id = "2301.00002";
    let store = ResultStore::new(h.results_dir.clone()).expect("store");
    let paper_dir = store.paper_dir(id);
    let latex_dir = store.latex_dir(id);
    std::fs::create_dir_all(&latex_dir).expect("mkdir");
    std::fs::write(latex_dir.join("main.tex"), MAIN_TEX).expect("write");
    std::fs::write(paper_dir.join("original.pdf"), fake_pdf(4)).expect("write pdf");

    let mut record = PaperRecord::new(
        id.to_string(),
        id.to_string(),
        paper_translator::acquire::SourceType::Arxiv,
    );
    record.status = TranslationStatus::OriginalCompiled;
    record.main_tex_rel = Some("main.tex".to_string());
    record.source_dir = Some(latex_dir.display().to_string());
    record.original_pdf_path = Some(paper_dir.join("original.pdf").display().to_string());
    store.save(&record).expect("seed");

    h.orchestrator.cancel_token().cancel();
    let err = h.orchestrator.continue_translation(id).expect_err("cancelled");
    assert!(matches!(err, PipelineError::Cancelled));

    let persisted = store.load(id).expect("load");
    assert_eq!(persisted.status, TranslationStatus::Error);
    assert_eq!(persisted.error_msg.as_deref(), Some("cancelled"));
}

#[test]
fn page_count_mismatch_is_recorded_not_fatal() {
    /// Compiler variant: the translated document gets one page against the
    /// original's four.
    struct ShrinkingCompiler;
    impl LatexCompiler for ShrinkingCompiler {
        fn compile(
            &self,
            main_path: &Path,
            output_dir: &Path,
            _engine: Engine,
            _timeout: Duration,
        ) -> anyhow::Result<CompileOutcome> {
            let stem = main_path
                .file_stem()
                .and_then(|s| s.to_str())
                .unwrap_or("main");
            let pages = if stem.starts_with("translated_") || stem == "bilingual" {
                1
            } else {
                4
            };
            let pdf = output_dir.join(format!("{stem}.pdf"));
            std::fs::create_dir_all(output_dir)?;
            std::fs::write(&pdf, fake_pdf(pages))?;
            Ok(CompileOutcome {
                success: true,
                pdf_path: Some(pdf),
                log: String::new(),
                error_msg: None,
            })
        }
    }

    let tmp = tempfile::tempdir().expect("tempdir");
    let results_dir = tmp.path().join("results");
    let zip_path = tmp.path().join("paper.zip");
    make_zip(&zip_path, &[("main.tex", MAIN_TEX)]);

    let cfg = AppConfig::default();
    let mut settings = Settings::from_config(&cfg, tmp.path()).expect("settings");
    settings.results_dir = results_dir.clone();
    settings.work_dir = tmp.path().join("work");
    settings.trace_dir = tmp.path().join("trace");

    let sink = Arc::new(RecordingSink::default());
    let orchestrator = PipelineOrchestrator::new(
        settings,
        ResultStore::new(results_dir).expect("store"),
        Arc::new(ShrinkingCompiler),
        Arc::new(FakeLlm::new(false)),
        None,
        sink.clone(),
        Arc::new(RecordingListener::default()),
        PromptCatalog::default(),
    )
    .expect("orchestrator");

    let result = orchestrator
        .process_source(&SourceSpec::LocalZipPath(zip_path))
        .expect("run");
    assert_eq!(result.record.status, TranslationStatus::Complete);
    let records = sink.records.lock().expect("records").clone();
    assert!(records
        .iter()
        .any(|r| r.stage == paper_translator::error::ErrorStage::PageCountMismatch));
}

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::acquire::{extract_archive, file_md5_hex, Downloader, SourceInfo, SourceSpec};
use crate::bilingual::generate_bilingual;
use crate::compiler::{CompileOutcome, Engine, LatexCompiler};
use crate::config::Settings;
use crate::error::{
    ErrorRecord, ErrorSink, ErrorStage, PipelineError, Result,
};
use crate::fix::{log_excerpt, AgentBudgets, FixBudgets, HierarchicalFixer};
use crate::llm::LlmClient;
use crate::pdf::count_pages;
use crate::preprocess::preprocess_tree;
use crate::progress::{CancelToken, ConsoleProgress, Phase, Status, StatusEmitter, StatusListener};
use crate::project::{discover, extract_title, locate_main};
use crate::store::{now_iso8601, PaperRecord, ResultStore, TranslationStatus};
use crate::textenc;
use crate::trace::TraceWriter;
use crate::translate::{
    reference_based_post_fix, PostFixOptions, PromptCatalog, TranslatorDriver,
};

/// Final artifacts of a completed run.
#[derive(Clone, Debug)]
pub struct ProcessResult {
    pub record: PaperRecord,
    pub original_pdf: PathBuf,
    pub translated_pdf: PathBuf,
    pub bilingual_pdf: Option<PathBuf>,
}

/// Phased, resumable translation pipeline. One run at a time per instance;
/// all record mutation goes through the result store, all user-visible
/// progress through the status emitter.
pub struct PipelineOrchestrator {
    settings: Settings,
    store: ResultStore,
    compiler: Arc<dyn LatexCompiler>,
    llm: Arc<dyn LlmClient>,
    downloader: Option<Arc<dyn Downloader>>,
    error_sink: Arc<dyn ErrorSink>,
    emitter: StatusEmitter,
    progress: ConsoleProgress,
    prompts: PromptCatalog,
    trace: TraceWriter,
    cancel: CancelToken,
    running: AtomicBool,
}

/// Everything a run carries between phases.
struct RunCtx {
    record: PaperRecord,
    paper_dir: PathBuf,
    source: SourceInfo,
}

impl RunCtx {
    fn translated_main_rel(&self) -> PathBuf {
        translated_main_rel(&self.source.main_tex)
    }
}

fn translated_main_rel(main_rel: &Path) -> PathBuf {
    let base = main_rel
        .file_name()
        .and_then(|s| s.to_str())
        .unwrap_or("main.tex");
    main_rel.with_file_name(format!("translated_{base}"))
}

struct RunningGuard<'a>(&'a AtomicBool);

impl Drop for RunningGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

impl PipelineOrchestrator {
    pub fn new(
        settings: Settings,
        store: ResultStore,
        compiler: Arc<dyn LatexCompiler>,
        llm: Arc<dyn LlmClient>,
        downloader: Option<Arc<dyn Downloader>>,
        error_sink: Arc<dyn ErrorSink>,
        listener: Arc<dyn StatusListener>,
        prompts: PromptCatalog,
    ) -> anyhow::Result<Self> {
        std::fs::create_dir_all(&settings.work_dir)?;
        let trace = TraceWriter::new(settings.trace_dir.clone(), settings.trace_prompts)?;
        Ok(Self {
            settings,
            store,
            compiler,
            llm,
            downloader,
            error_sink,
            emitter: StatusEmitter::new(listener),
            progress: ConsoleProgress::new(true),
            prompts,
            trace,
            cancel: CancelToken::new(),
            running: AtomicBool::new(false),
        })
    }

    /// Token shared with embedders; cancelling it stops the active run at
    /// the next phase boundary or chunk gap.
    #[must_use]
    pub fn cancel_token(&self) -> CancelToken {
        self.cancel.clone()
    }

    #[must_use]
    pub fn store(&self) -> &ResultStore {
        &self.store
    }

    pub fn process_source(&self, spec: &SourceSpec) -> Result<ProcessResult> {
        self.process_source_with_force(spec, false)
    }

    /// Duplicate handling per user intent: an existing complete run is
    /// returned as-is, a continuable one resumes, `force` deletes and
    /// starts over.
    pub fn process_source_with_force(&self, spec: &SourceSpec, force: bool) -> Result<ProcessResult> {
        if let Ok(Some(existing)) = self.store.check_existing(spec) {
            if force {
                self.store
                    .delete(&existing.record.id)
                    .map_err(|e| PipelineError::Internal(format!("{e:#}")))?;
            } else if existing.complete {
                self.progress
                    .info(format!("已存在完成的翻译: {}", existing.record.id));
                return self.result_from_record(existing.record);
            } else if existing.continuable {
                return self.continue_translation(&existing.record.id);
            }
        }

        let _guard = self.acquire_run_slot()?;
        self.emitter.reset();
        self.run_fresh(spec)
    }

    /// Resume a persisted run from the earliest missing artifact.
    pub fn continue_translation(&self, paper_id: &str) -> Result<ProcessResult> {
        let _guard = self.acquire_run_slot()?;
        self.emitter.reset();

        let record = self
            .store
            .load(paper_id)
            .map_err(|_| PipelineError::InvalidInput(format!("没有找到记录: {paper_id}")))?;

        let paper_dir = self.store.paper_dir(paper_id);
        let source_dir = record
            .source_dir
            .clone()
            .map(PathBuf::from)
            .unwrap_or_else(|| self.store.latex_dir(paper_id));

        let main_rel = record.main_tex_rel.clone().map(PathBuf::from);
        let original_pdf = paper_dir.join("original.pdf");

        let source_intact = main_rel
            .as_ref()
            .map(|m| source_dir.join(m).is_file())
            .unwrap_or(false);
        let translated_main_ready = main_rel
            .as_ref()
            .map(|m| source_dir.join(translated_main_rel(m)).is_file())
            .unwrap_or(false);

        if !source_intact {
            // Earliest artifact (the tree itself) is gone: full restart.
            let spec = SourceSpec::parse(&record.original_input)?;
            self.progress
                .info(format!("源目录缺失,重新开始: {paper_id}"));
            self.store
                .delete(paper_id)
                .map_err(|e| PipelineError::Internal(format!("{e:#}")))?;
            return self.run_fresh(&spec);
        }

        let main_rel = main_rel.expect("checked above");
        let all_tex = discover(&source_dir, &main_rel)?;
        let source_type = record.source_type;
        let original_ref = record.original_input.clone();
        let mut ctx = RunCtx {
            record,
            paper_dir,
            source: SourceInfo {
                extract_dir: source_dir,
                main_tex: main_rel,
                all_tex_files: all_tex,
                source_type,
                original_ref,
            },
        };

        if translated_main_ready && original_pdf.is_file() {
            self.progress.info("继续: 编译中文文档".to_string());
            return self.resume_at_translated_compile(&mut ctx).map_err(|e| {
                self.fail(&mut ctx.record, &e);
                e
            });
        }
        if original_pdf.is_file() {
            self.progress.info("继续: 翻译".to_string());
            ctx.record.original_pdf_path = Some(original_pdf.display().to_string());
            return self.resume_at_translating(&mut ctx).map_err(|e| {
                self.fail(&mut ctx.record, &e);
                e
            });
        }

        self.progress.info("继续: 编译原始文档".to_string());
        self.resume_at_original_compile(&mut ctx).map_err(|e| {
            self.fail(&mut ctx.record, &e);
            e
        })
    }

    fn acquire_run_slot(&self) -> Result<RunningGuard<'_>> {
        if self
            .running
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return Err(PipelineError::AlreadyRunning);
        }
        Ok(RunningGuard(&self.running))
    }

    fn check_cancelled(&self) -> Result<()> {
        if self.cancel.is_cancelled() {
            return Err(PipelineError::Cancelled);
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Phases
    // ------------------------------------------------------------------

    fn run_fresh(&self, spec: &SourceSpec) -> Result<ProcessResult> {
        self.emitter
            .emit(Status::new(Phase::Idle, 0, "开始处理"));

        // Download / stage the source archive.
        self.emitter
            .emit(Status::new(Phase::Downloading, 5, "获取源文件"));
        let archive = self.stage_archive(spec)?;
        self.check_cancelled()?;

        let source_md5 = file_md5_hex(&archive).map_err(|e| {
            PipelineError::DownloadFailed(format!("计算校验和失败: {e:#}"))
        })?;
        let id = match spec {
            SourceSpec::ArxivId(id) => id.clone(),
            _ => format!("md5_{}", &source_md5[..16]),
        };
        self.emitter
            .emit(Status::new(Phase::Downloading, 20, "下载完成"));

        // A URL input only reveals its identity after download; an already
        // complete run for that hash short-circuits here, anything else is
        // replaced.
        if let Ok(Some(existing)) = self.store.try_load(&id) {
            if existing.status == TranslationStatus::Complete
                && self.store.paper_dir(&id).join("translated.pdf").is_file()
            {
                return self.result_from_record(existing);
            }
            self.store
                .delete(&id)
                .map_err(|e| PipelineError::Internal(format!("{e:#}")))?;
        }

        let mut record = PaperRecord::new(id.clone(), spec.original_ref(), spec.source_type());
        record.status = TranslationStatus::Downloading;
        record.source_md5 = Some(source_md5);
        self.checkpoint(&mut record, TranslationStatus::Downloading)?;

        // Extract.
        self.emitter
            .emit(Status::new(Phase::Extracting, 22, "解压源文件"));
        let paper_dir = self.store.paper_dir(&id);
        let source_dir = self.store.latex_dir(&id);
        if let Err(e) = extract_archive(&archive, &source_dir, self.settings.max_extract_bytes) {
            self.fail(&mut record, &e);
            return Err(e);
        }
        record.source_dir = Some(source_dir.display().to_string());
        self.checkpoint(&mut record, TranslationStatus::Extracted)?;
        self.check_cancelled()?;

        // Preprocess, then locate the main file and its input graph.
        preprocess_tree(&source_dir, &self.progress);
        let main_rel = match locate_main(&source_dir) {
            Ok(m) => m,
            Err(e) => {
                self.fail(&mut record, &e);
                return Err(e);
            }
        };
        let all_tex = match discover(&source_dir, &main_rel) {
            Ok(files) => files,
            Err(e) => {
                self.fail(&mut record, &e);
                return Err(e);
            }
        };
        record.main_tex_rel = Some(main_rel.display().to_string());
        if let Ok(main_text) = textenc::read_text(&source_dir.join(&main_rel)) {
            if let Some(title) = extract_title(&main_text) {
                record.title = title;
            }
        }
        self.store
            .save(&record)
            .map_err(|e| PipelineError::Internal(format!("{e:#}")))?;
        self.emitter.emit(Status::new(
            Phase::Extracting,
            28,
            format!("主文件: {}", main_rel.display()),
        ));

        let mut ctx = RunCtx {
            record,
            paper_dir,
            source: SourceInfo {
                extract_dir: source_dir,
                main_tex: main_rel,
                all_tex_files: all_tex,
                source_type: spec.source_type(),
                original_ref: spec.original_ref(),
            },
        };
        self.resume_at_original_compile(&mut ctx).map_err(|e| {
            self.fail(&mut ctx.record, &e);
            e
        })
    }

    fn stage_archive(&self, spec: &SourceSpec) -> Result<PathBuf> {
        match spec {
            SourceSpec::ArxivId(id) => self
                .downloader
                .as_deref()
                .ok_or_else(|| PipelineError::DownloadFailed("未配置下载器".to_string()))?
                .download_by_id(id)
                .map_err(|e| PipelineError::DownloadFailed(format!("{e:#}"))),
            SourceSpec::Url(url) => self
                .downloader
                .as_deref()
                .ok_or_else(|| PipelineError::DownloadFailed("未配置下载器".to_string()))?
                .download_url(url)
                .map_err(|e| PipelineError::DownloadFailed(format!("{e:#}"))),
            SourceSpec::LocalZipPath(p) => {
                if !p.is_file() {
                    return Err(PipelineError::FileNotFound(p.clone()));
                }
                Ok(p.clone())
            }
            SourceSpec::LocalPdfPath(_) => Err(PipelineError::InvalidInput(
                "PDF 输入不走 LaTeX 翻译流程".to_string(),
            )),
        }
    }

    fn resume_at_original_compile(&self, ctx: &mut RunCtx) -> Result<ProcessResult> {
        self.check_cancelled()?;
        self.emitter
            .emit(Status::new(Phase::Compiling, 30, "编译原始文档"));

        let main_abs = ctx.source.extract_dir.join(&ctx.source.main_tex);
        let outcome = self.compile(&main_abs, &ctx.paper_dir, self.settings.engine, ctx.source.all_tex_files.len())?;
        if !outcome.success {
            return Err(PipelineError::CompileFailed {
                engine: self.settings.engine.to_string(),
                stage: ErrorStage::OriginalCompile,
                log_excerpt: log_excerpt(&outcome.log, 800),
            });
        }
        let original_pdf = ctx.paper_dir.join("original.pdf");
        self.adopt_pdf(&outcome, &original_pdf)?;
        ctx.record.original_pdf_path = Some(original_pdf.display().to_string());
        self.checkpoint(&mut ctx.record, TranslationStatus::OriginalCompiled)?;

        self.resume_at_translating(ctx)
    }

    fn resume_at_translating(&self, ctx: &mut RunCtx) -> Result<ProcessResult> {
        self.check_cancelled()?;
        self.checkpoint(&mut ctx.record, TranslationStatus::Translating)?;

        let driver = TranslatorDriver::new(
            self.llm.as_ref(),
            &self.prompts,
            self.settings.chunk_byte_budget(),
            self.settings.concurrency,
            &self.trace,
        );

        // Files are sequenced; only chunks within a file run concurrently.
        let total = ctx.source.all_tex_files.len().max(1);
        let mut translated: Vec<(PathBuf, String, String)> = Vec::new();
        for (index, rel) in ctx.source.all_tex_files.iter().enumerate() {
            self.check_cancelled()?;
            let band = 42 + ((index * 16) / total) as u8;
            self.emitter.emit(Status::new(
                Phase::Translating,
                band,
                format!("翻译 {} ({}/{})", rel.display(), index + 1, total),
            ));

            let abs = ctx.source.extract_dir.join(rel);
            let original = textenc::read_text(&abs)
                .map_err(|e| PipelineError::TranslationFailed { cause: format!("{e:#}") })?;
            let tag = rel.display().to_string();
            let outcome = driver.translate_file(&tag, &original, &self.cancel, |done, chunks| {
                self.progress.progress(&tag, done, chunks);
            })?;
            if outcome.suspicious_truncation {
                self.progress
                    .warn(format!("翻译疑似被截断,保留原文片段: {}", rel.display()));
            }
            if outcome.skipped {
                self.progress.info(format!("跳过纯命令/表格文件: {}", rel.display()));
            }
            translated.push((rel.clone(), original, outcome.translated));
        }
        self.emitter
            .emit(Status::new(Phase::Translating, 58, "翻译完成,写回文件"));

        // Post-translate write pass: post-fix every file once, the main
        // file under its translated_ name, the rest in place.
        self.emitter
            .emit(Status::new(Phase::Validating, 60, "后处理译文"));
        let lualatex = self.settings.translated_engine == Engine::Lualatex;
        for (rel, original, body) in &translated {
            let is_main = rel == &ctx.source.main_tex;
            let opts = PostFixOptions {
                ensure_ctex: is_main,
                lualatex_fonts: is_main && lualatex,
            };
            let fixed = reference_based_post_fix(body, original, opts);
            let out_rel = if is_main {
                ctx.translated_main_rel()
            } else {
                rel.clone()
            };
            textenc::write_text(&ctx.source.extract_dir.join(&out_rel), &fixed)
                .map_err(|e| PipelineError::TranslationFailed { cause: format!("{e:#}") })?;
        }
        // One unconditional rule pass over the tree before compiling.
        crate::fix::apply_rules(&ctx.source.extract_dir, &ctx.translated_main_rel(), "")
            .map_err(|e| PipelineError::Internal(format!("{e:#}")))?;
        self.emitter
            .emit(Status::new(Phase::Validating, 70, "后处理完成"));
        self.checkpoint(&mut ctx.record, TranslationStatus::Translated)?;

        self.resume_at_translated_compile(ctx)
    }

    fn resume_at_translated_compile(&self, ctx: &mut RunCtx) -> Result<ProcessResult> {
        self.check_cancelled()?;
        self.checkpoint(&mut ctx.record, TranslationStatus::Compiling)?;
        self.emitter
            .emit(Status::new(Phase::Compiling, 75, "编译中文文档"));

        let engine = self.settings.translated_engine;
        let translated_rel = ctx.translated_main_rel();
        let main_abs = ctx.source.extract_dir.join(&translated_rel);
        if !main_abs.is_file() {
            return Err(PipelineError::FileNotFound(main_abs));
        }

        let mut outcome = self.compile(&main_abs, &ctx.paper_dir, engine, ctx.source.all_tex_files.len())?;
        if !outcome.success {
            outcome = self.repair_translated(ctx, &translated_rel, engine, outcome)?;
        }

        let translated_pdf = ctx.paper_dir.join("translated.pdf");
        self.adopt_pdf(&outcome, &translated_pdf)?;
        ctx.record.translated_pdf_path = Some(translated_pdf.display().to_string());
        self.store
            .save(&ctx.record)
            .map_err(|e| PipelineError::Internal(format!("{e:#}")))?;

        self.finish(ctx)
    }

    fn repair_translated(
        &self,
        ctx: &mut RunCtx,
        translated_rel: &Path,
        engine: Engine,
        first: CompileOutcome,
    ) -> Result<CompileOutcome> {
        let budgets = FixBudgets {
            rule_retry: self.settings.rule_retry,
            llm_retry: self.settings.llm_retry,
            llm_max_bytes: self.settings.chunk_byte_budget(),
            agent: AgentBudgets {
                max_iterations: self.settings.agent_max_iterations,
                max_edits: self.settings.agent_max_edits,
                wall_clock: self.settings.agent_wall_clock,
            },
        };
        let fixer = HierarchicalFixer::new(self.llm.as_ref(), &self.prompts, budgets, &self.trace);

        let main_abs = ctx.source.extract_dir.join(translated_rel);
        let timeout = self.settings.compile_timeout_for(ctx.source.all_tex_files.len());
        let paper_dir = ctx.paper_dir.clone();
        let compiler = self.compiler.clone();
        let compile = move || compiler.compile(&main_abs, &paper_dir, engine, timeout);

        let emitter = &self.emitter;
        let mut level_progress = 78u8;
        let mut on_level = |level: crate::error::FixLevel, round: usize, msg: &str| {
            emitter.emit(Status::new(
                Phase::Validating,
                level_progress.min(98),
                format!("自动修复 ({} 第{round}轮): {msg}", level.as_str()),
            ));
            level_progress = level_progress.saturating_add(4);
        };

        let report = fixer
            .repair(
                &ctx.source.extract_dir,
                translated_rel,
                &first.log,
                &compile,
                &mut on_level,
            )
            .map_err(|e| PipelineError::Internal(format!("{e:#}")))?;

        for attempt in &report.attempts {
            self.progress.info(format!(
                "修复尝试 {}#{}: {}",
                attempt.level.as_str(),
                attempt.iteration,
                attempt.description
            ));
        }
        if !report.success {
            return Err(PipelineError::FixFailed {
                final_level: report.final_level,
                log_excerpt: log_excerpt(&report.final_log, 800),
            });
        }

        // The repair's last compile already produced the PDF in paper_dir.
        let stem = translated_rel
            .file_stem()
            .and_then(|s| s.to_str())
            .unwrap_or("translated_main");
        let pdf = ctx.paper_dir.join(format!("{stem}.pdf"));
        Ok(CompileOutcome {
            success: true,
            pdf_path: pdf.is_file().then_some(pdf),
            log: report.final_log,
            error_msg: None,
        })
    }

    fn finish(&self, ctx: &mut RunCtx) -> Result<ProcessResult> {
        self.check_cancelled()?;
        let original_pdf = ctx.paper_dir.join("original.pdf");
        let translated_pdf = ctx.paper_dir.join("translated.pdf");

        // Page-count sanity: far fewer translated pages is recorded, not
        // fatal.
        match (count_pages(&original_pdf), count_pages(&translated_pdf)) {
            (Ok(orig), Ok(trans)) if trans * 2 < orig => {
                self.progress.warn(format!(
                    "译文页数偏少: {trans}/{orig}"
                ));
                self.record_error(
                    &ctx.record,
                    ErrorStage::PageCountMismatch,
                    &format!("translated {trans} pages vs original {orig}"),
                );
            }
            _ => {}
        }

        // Bilingual output is best-effort.
        let bilingual_pdf = ctx.paper_dir.join("bilingual.pdf");
        let bilingual = match generate_bilingual(
            self.compiler.as_ref(),
            self.settings.translated_engine,
            &original_pdf,
            &translated_pdf,
            &bilingual_pdf,
            self.settings.compile_timeout,
        ) {
            Ok(()) => {
                ctx.record.bilingual_pdf_path = Some(bilingual_pdf.display().to_string());
                Some(bilingual_pdf.clone())
            }
            Err(e) => {
                self.progress.warn(format!("双语 PDF 生成失败: {e:#}"));
                self.record_error(&ctx.record, ErrorStage::PdfGeneration, &format!("{e:#}"));
                None
            }
        };

        ctx.record.translated_at = Some(now_iso8601());
        ctx.record.error_msg = None;
        self.checkpoint(&mut ctx.record, TranslationStatus::Complete)?;
        self.emitter
            .emit(Status::new(Phase::Complete, 100, "翻译完成"));

        Ok(ProcessResult {
            record: ctx.record.clone(),
            original_pdf,
            translated_pdf,
            bilingual_pdf: bilingual,
        })
    }

    // ------------------------------------------------------------------
    // Helpers
    // ------------------------------------------------------------------

    fn compile(
        &self,
        main_abs: &Path,
        out_dir: &Path,
        engine: Engine,
        tex_count: usize,
    ) -> Result<CompileOutcome> {
        let timeout = self.settings.compile_timeout_for(tex_count);
        self.compiler
            .compile(main_abs, out_dir, engine, timeout)
            .map_err(|e| PipelineError::Internal(format!("{e:#}")))
    }

    fn adopt_pdf(&self, outcome: &CompileOutcome, dest: &Path) -> Result<()> {
        let src = outcome
            .pdf_path
            .as_ref()
            .ok_or_else(|| PipelineError::FileNotFound(dest.to_path_buf()))?;
        if src != dest {
            std::fs::copy(src, dest)
                .map_err(|e| PipelineError::Internal(format!("copy pdf: {e}")))?;
        }
        Ok(())
    }

    fn checkpoint(&self, record: &mut PaperRecord, status: TranslationStatus) -> Result<()> {
        record.status = status;
        self.store
            .save(record)
            .map_err(|e| PipelineError::Internal(format!("{e:#}")))
    }

    /// Error path: persist the record with whatever artifacts exist, hand
    /// the error record to the sink, and surface the failure as a status
    /// event.
    fn fail(&self, record: &mut PaperRecord, err: &PipelineError) {
        let message = match err {
            PipelineError::Cancelled => "cancelled".to_string(),
            other => other.to_string(),
        };
        record.status = TranslationStatus::Error;
        record.error_msg = Some(message.clone());
        record.retry_count = record.retry_count.saturating_add(1);
        if let Err(e) = self.store.save(record) {
            self.progress.warn(format!("写入错误记录失败: {e:#}"));
        }
        self.record_error(record, err.stage(), &message);
        self.emitter.emit(Status::error(message.clone(), message));
    }

    fn record_error(&self, record: &PaperRecord, stage: ErrorStage, message: &str) {
        self.error_sink.record(&ErrorRecord {
            id: record.id.clone(),
            title: record.title.clone(),
            input: record.original_input.clone(),
            stage,
            message: message.to_string(),
            timestamp: now_iso8601(),
            retry_count: record.retry_count,
            reported: false,
        });
    }

    fn result_from_record(&self, record: PaperRecord) -> Result<ProcessResult> {
        let paper_dir = self.store.paper_dir(&record.id);
        let original_pdf = paper_dir.join("original.pdf");
        let translated_pdf = paper_dir.join("translated.pdf");
        let bilingual_pdf = paper_dir.join("bilingual.pdf");
        Ok(ProcessResult {
            bilingual_pdf: bilingual_pdf.is_file().then_some(bilingual_pdf),
            record,
            original_pdf,
            translated_pdf,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn translated_main_gets_prefix_in_place() {
        assert_eq!(
            translated_main_rel(Path::new("tex/main.tex")),
            PathBuf::from("tex/translated_main.tex")
        );
        assert_eq!(
            translated_main_rel(Path::new("paper.tex")),
            PathBuf::from("translated_paper.tex")
        );
    }
}

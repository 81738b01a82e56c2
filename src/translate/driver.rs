use once_cell::sync::Lazy;
use regex::Regex;

use crate::error::{PipelineError, Result};
use crate::llm::LlmClient;
use crate::progress::CancelToken;
use crate::trace::TraceWriter;

use super::chunker::{chunk_text, TranslationChunk};
use super::prompts::{render_template, PromptCatalog};

static MACRO_LINE_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r"^\s*\\(?:newcommand|renewcommand|providecommand|def|let|DeclareMathOperator|DeclareRobustCommand|RequirePackage|ProvidesPackage|newenvironment|newtheorem|setlength|newlength)\b",
    )
    .expect("macro line regex")
});
static PROSE_WORD_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"[A-Za-z]{2,}").expect("word regex"));

/// Outcome of translating one file.
#[derive(Clone, Debug)]
pub struct TranslationOutcome {
    pub translated: String,
    pub chunks: Vec<TranslationChunk>,
    pub tokens_used: u64,
    pub skipped: bool,
    pub suspicious_truncation: bool,
}

/// Files that are all macros or all table scaffolding are copied through
/// untouched: there is nothing worth translating and the LLM only breaks
/// them.
#[must_use]
pub fn is_translatable(text: &str) -> bool {
    let mut total = 0usize;
    let mut macro_lines = 0usize;
    let mut prose_lines = 0usize;
    for line in text.lines() {
        let trimmed = line.trim();
        if trimmed.is_empty() {
            continue;
        }
        total += 1;
        if MACRO_LINE_RE.is_match(line) {
            macro_lines += 1;
        }
        if !trimmed.starts_with('\\')
            && !trimmed.starts_with('%')
            && PROSE_WORD_RE.find_iter(trimmed).count() >= 3
        {
            prose_lines += 1;
        }
    }
    if total == 0 {
        return false;
    }
    if macro_lines * 100 > total * 80 {
        return false;
    }
    if text.contains("\\begin{tabular}") && prose_lines < 5 {
        return false;
    }
    true
}

pub struct TranslatorDriver<'a> {
    llm: &'a dyn LlmClient,
    prompts: &'a PromptCatalog,
    chunk_budget: usize,
    concurrency: usize,
    trace: &'a TraceWriter,
}

impl<'a> TranslatorDriver<'a> {
    #[must_use]
    pub fn new(
        llm: &'a dyn LlmClient,
        prompts: &'a PromptCatalog,
        chunk_budget: usize,
        concurrency: usize,
        trace: &'a TraceWriter,
    ) -> Self {
        Self {
            llm,
            prompts,
            chunk_budget: chunk_budget.max(256),
            concurrency: concurrency.clamp(1, 16),
            trace,
        }
    }

    /// Translate one file's content. Chunks go to the model with at most
    /// `concurrency` requests in flight; the reassembly is strictly in
    /// ordinal order no matter which request finishes first.
    pub fn translate_file(
        &self,
        rel_tag: &str,
        text: &str,
        cancel: &CancelToken,
        mut on_chunk_done: impl FnMut(usize, usize),
    ) -> Result<TranslationOutcome> {
        if !is_translatable(text) {
            return Ok(TranslationOutcome {
                translated: text.to_string(),
                chunks: Vec::new(),
                tokens_used: 0,
                skipped: true,
                suspicious_truncation: false,
            });
        }

        let mut chunks = chunk_text(rel_tag, text, self.chunk_budget);
        let total = chunks.len();
        if total == 0 {
            return Ok(TranslationOutcome {
                translated: text.to_string(),
                chunks,
                tokens_used: 0,
                skipped: true,
                suspicious_truncation: false,
            });
        }

        let results = self.run_pool(&chunks, cancel)?;

        let mut tokens_used = 0u64;
        let mut suspicious = false;
        for (idx, outcome) in results.into_iter().enumerate() {
            let (translated, tokens) = outcome?;
            tokens_used += tokens;
            let chunk = &mut chunks[idx];
            // Truncation guard: a reply far shorter than its source keeps
            // the untranslated slice instead.
            let original_lines = chunk.original_slice.lines().count().max(1);
            let translated_lines = translated.lines().count();
            if translated_lines * 2 < original_lines {
                suspicious = true;
                chunk.translated_slice = Some(chunk.original_slice.clone());
            } else {
                chunk.translated_slice = Some(translated);
            }
            chunk.token_cost = tokens;
            on_chunk_done(idx + 1, total);
        }

        let translated: String = chunks
            .iter()
            .map(|c| c.translated_slice.as_deref().unwrap_or(&c.original_slice))
            .collect::<Vec<_>>()
            .join("");

        Ok(TranslationOutcome {
            translated,
            chunks,
            tokens_used,
            skipped: false,
            suspicious_truncation: suspicious,
        })
    }

    /// Bounded pool over the chunk list: a work queue feeds `concurrency`
    /// workers, results come back tagged with their ordinal and land in
    /// indexed slots.
    #[allow(clippy::type_complexity)]
    fn run_pool(
        &self,
        chunks: &[TranslationChunk],
        cancel: &CancelToken,
    ) -> Result<Vec<Result<(String, u64)>>> {
        let total = chunks.len();
        let workers = self.concurrency.min(total);
        let (job_tx, job_rx) = crossbeam_channel::unbounded::<(usize, String)>();
        let (res_tx, res_rx) = crossbeam_channel::unbounded::<(usize, Result<(String, u64)>)>();

        for chunk in chunks {
            let prompt = render_template(
                &self.prompts.translate,
                &[("source", chunk.original_slice.as_str())],
            );
            let _ = self
                .trace
                .write_chunk_text(&chunk.file_rel_path, chunk.ordinal, "prompt", &prompt);
            job_tx
                .send((chunk.ordinal, prompt))
                .map_err(|_| PipelineError::Internal("translation queue closed".to_string()))?;
        }
        drop(job_tx);

        let mut slots: Vec<Option<Result<(String, u64)>>> = (0..total).map(|_| None).collect();
        std::thread::scope(|scope| {
            for _ in 0..workers {
                let job_rx = job_rx.clone();
                let res_tx = res_tx.clone();
                let cancel = cancel.clone();
                let llm = self.llm;
                scope.spawn(move || {
                    while let Ok((ordinal, prompt)) = job_rx.recv() {
                        if cancel.is_cancelled() {
                            let _ = res_tx.send((ordinal, Err(PipelineError::Cancelled)));
                            continue;
                        }
                        let result = llm
                            .translate(&prompt)
                            .map(|reply| (clean_llm_reply(&reply.text), reply.tokens_used))
                            .map_err(|e| PipelineError::TranslationFailed {
                                cause: format!("{e:#}"),
                            });
                        let _ = res_tx.send((ordinal, result));
                    }
                });
            }
            drop(res_tx);

            while let Ok((ordinal, result)) = res_rx.recv() {
                if let Ok((text, _)) = &result {
                    let _ = self.trace.write_chunk_text(
                        &chunks[ordinal].file_rel_path,
                        ordinal,
                        "reply",
                        text,
                    );
                }
                slots[ordinal] = Some(result);
            }
        });

        if cancel.is_cancelled() {
            return Err(PipelineError::Cancelled);
        }
        Ok(slots
            .into_iter()
            .map(|s| s.unwrap_or_else(|| Err(PipelineError::Internal("missing chunk".to_string()))))
            .collect())
    }
}

/// Strip code fences and stray quoting the model wraps around its output.
#[must_use]
pub fn clean_llm_reply(text: &str) -> String {
    let mut s = text.trim_start_matches('\u{FEFF}').to_string();
    let trimmed = s.trim();
    if trimmed.starts_with("```") {
        s = trimmed.to_string();
        if let Some(i) = s.find('\n') {
            s = s[i + 1..].to_string();
        }
        if let Some(end) = s.rfind("```") {
            s = s[..end].to_string();
        }
    }
    s
}

use std::collections::BTreeMap;
use std::path::Path;
use std::time::{Duration, Instant};

use anyhow::Context;
use serde::Deserialize;

use crate::backup::BackupManager;
use crate::compiler::CompileOutcome;
use crate::editor::LineEditor;
use crate::llm::LlmClient;
use crate::textenc;
use crate::trace::TraceWriter;
use crate::translate::{render_template, PromptCatalog};
use crate::validator::{validate, Severity};

use super::latexlog::log_excerpt;

/// Tool call the agent model emits, one JSON object per step.
#[derive(Clone, Debug, Deserialize)]
#[serde(tag = "tool", rename_all = "snake_case")]
enum AgentAction {
    ReadLines { a: usize, b: usize },
    ReplaceLine { n: usize, text: String },
    ReplaceRange { a: usize, b: usize, lines: Vec<String> },
    InsertLine { n: usize, text: String },
    DeleteLine { n: usize },
    DetectEncoding,
    EnsureUtf8,
    Validate,
    Compile,
    CreateBackup,
    RestoreBackup,
    Done,
}

impl AgentAction {
    fn is_mutation(&self) -> bool {
        matches!(
            self,
            Self::ReplaceLine { .. }
                | Self::ReplaceRange { .. }
                | Self::InsertLine { .. }
                | Self::DeleteLine { .. }
        )
    }

    fn name(&self) -> &'static str {
        match self {
            Self::ReadLines { .. } => "read_lines",
            Self::ReplaceLine { .. } => "replace_line",
            Self::ReplaceRange { .. } => "replace_range",
            Self::InsertLine { .. } => "insert_line",
            Self::DeleteLine { .. } => "delete_line",
            Self::DetectEncoding => "detect_encoding",
            Self::EnsureUtf8 => "ensure_utf8",
            Self::Validate => "validate",
            Self::Compile => "compile",
            Self::CreateBackup => "create_backup",
            Self::RestoreBackup => "restore_backup",
            Self::Done => "done",
        }
    }
}

#[derive(Clone, Copy, Debug)]
pub struct AgentBudgets {
    pub max_iterations: usize,
    pub max_edits: usize,
    pub wall_clock: Duration,
}

impl Default for AgentBudgets {
    fn default() -> Self {
        Self {
            max_iterations: 6,
            max_edits: 20,
            wall_clock: Duration::from_secs(600),
        }
    }
}

#[derive(Clone, Debug)]
pub struct AgentOutcome {
    pub success: bool,
    pub iterations: usize,
    pub edits: usize,
    pub last_log: String,
    pub description: String,
}

/// Bounded tool loop: the model drives editor/validator/compiler calls one
/// at a time until the compile passes or a budget runs out. Every mutation
/// is validated; one that introduces new fatal issues is rolled back on the
/// spot.
pub struct AgentFixer<'a> {
    llm: &'a dyn LlmClient,
    prompts: &'a PromptCatalog,
    budgets: AgentBudgets,
    trace: &'a TraceWriter,
}

impl<'a> AgentFixer<'a> {
    #[must_use]
    pub fn new(
        llm: &'a dyn LlmClient,
        prompts: &'a PromptCatalog,
        budgets: AgentBudgets,
        trace: &'a TraceWriter,
    ) -> Self {
        Self {
            llm,
            prompts,
            budgets,
            trace,
        }
    }

    pub fn run(
        &self,
        target: &Path,
        compile: &dyn Fn() -> anyhow::Result<CompileOutcome>,
        initial_log: &str,
    ) -> anyhow::Result<AgentOutcome> {
        let backups = BackupManager::new();
        let mut editor = LineEditor::open(target, &backups)
            .with_context(|| format!("open editor: {}", target.display()))?;

        let file_name = target
            .file_name()
            .and_then(|s| s.to_str())
            .unwrap_or("main.tex")
            .to_string();
        let started = Instant::now();
        let mut history: Vec<String> = Vec::new();
        let mut last_log = initial_log.to_string();
        let mut edits = 0usize;
        let mut iterations = 0usize;
        let mut success = false;

        while iterations < self.budgets.max_iterations {
            if started.elapsed() >= self.budgets.wall_clock {
                history.push("budget: wall clock exhausted".to_string());
                break;
            }
            iterations += 1;

            let errors = log_excerpt(&last_log, 2000);
            let history_tail = render_history(&history, 12);
            let prompt = render_template(
                &self.prompts.agent_step,
                &[
                    ("file", &file_name),
                    ("line_count", &editor.count_lines().to_string()),
                    ("errors", &errors),
                    ("history", &history_tail),
                ],
            );
            let _ = self
                .trace
                .write_named_text(&format!("agent.step_{iterations:02}.prompt.txt"), &prompt);

            let reply = self.llm.chat(&prompt)?;
            let _ = self
                .trace
                .write_named_text(&format!("agent.step_{iterations:02}.reply.txt"), &reply);
            let action = match parse_action(&reply) {
                Ok(action) => action,
                Err(e) => {
                    history.push(format!("invalid tool call: {e}"));
                    continue;
                }
            };

            if matches!(action, AgentAction::Done) {
                history.push("done".to_string());
                break;
            }

            if action.is_mutation() {
                if edits >= self.budgets.max_edits {
                    history.push("budget: edit limit reached".to_string());
                    break;
                }
                edits += 1;
                let note = self.apply_mutation(target, &mut editor, &action)?;
                history.push(note);
                continue;
            }

            match &action {
                AgentAction::ReadLines { a, b } => match editor.read_lines(*a, *b) {
                    Ok(lines) => {
                        let mut shown = String::new();
                        for (off, line) in lines.iter().enumerate() {
                            shown.push_str(&format!("{}: {line}\n", a + off));
                        }
                        history.push(format!("read_lines {a}-{b}:\n{shown}"));
                    }
                    Err(e) => history.push(format!("read_lines {a}-{b} failed: {e}")),
                },
                AgentAction::DetectEncoding => {
                    let enc = textenc::detect(target)
                        .map(|e| e.as_str().to_string())
                        .unwrap_or_else(|e| format!("error: {e:#}"));
                    history.push(format!("detect_encoding: {enc}"));
                }
                AgentAction::EnsureUtf8 => {
                    match textenc::ensure_utf8(target) {
                        Ok(_) => {
                            editor.refresh().context("refresh after ensure_utf8")?;
                            history.push("ensure_utf8: ok".to_string());
                        }
                        Err(e) => history.push(format!("ensure_utf8 failed: {e:#}")),
                    }
                }
                AgentAction::Validate => {
                    let text = textenc::read_text(target)?;
                    let report = validate(&text);
                    if report.valid() {
                        history.push("validate: ok".to_string());
                    } else {
                        let mut out = String::from("validate:\n");
                        for issue in report.fatal_issues().iter().take(10) {
                            out.push_str(&format!(
                                "- line {} {:?}: {}\n",
                                issue.line, issue.kind, issue.message
                            ));
                        }
                        history.push(out);
                    }
                }
                AgentAction::Compile => {
                    let outcome = compile()?;
                    last_log = outcome.log.clone();
                    if outcome.success {
                        history.push("compile: success".to_string());
                        success = true;
                        break;
                    }
                    history.push(format!(
                        "compile failed:\n{}",
                        log_excerpt(&outcome.log, 1200)
                    ));
                }
                AgentAction::CreateBackup => {
                    match backups.create(target) {
                        Ok(entry) => history.push(format!(
                            "create_backup: {}",
                            entry.path.file_name().and_then(|s| s.to_str()).unwrap_or("?")
                        )),
                        Err(e) => history.push(format!("create_backup failed: {e:#}")),
                    }
                }
                AgentAction::RestoreBackup => {
                    match backups.list(target) {
                        Ok(entries) if !entries.is_empty() => {
                            let last = entries.last().expect("non-empty");
                            match backups.restore(last) {
                                Ok(()) => {
                                    editor.refresh().context("refresh after restore")?;
                                    history.push("restore_backup: ok".to_string());
                                }
                                Err(e) => history.push(format!("restore_backup failed: {e:#}")),
                            }
                        }
                        _ => history.push("restore_backup: no backups".to_string()),
                    }
                }
                _ => {}
            }
        }

        // A session that never compiled successfully leaves its edits in
        // place for the caller to judge; the per-edit regression guard has
        // already vetoed anything that made the file worse.
        editor.commit().ok();
        Ok(AgentOutcome {
            success,
            iterations,
            edits,
            last_log,
            description: history.last().cloned().unwrap_or_default(),
        })
    }

    /// Run one mutating tool with the regression guard: snapshot, apply,
    /// re-validate, roll back if new fatal issues appeared.
    fn apply_mutation(
        &self,
        target: &Path,
        editor: &mut LineEditor<'_>,
        action: &AgentAction,
    ) -> anyhow::Result<String> {
        let before_bytes = std::fs::read(target)
            .with_context(|| format!("snapshot: {}", target.display()))?;
        let before_counts = fatal_kind_counts(&String::from_utf8_lossy(&before_bytes));

        let applied = match action {
            AgentAction::ReplaceLine { n, text } => editor.replace_line(*n, text),
            AgentAction::ReplaceRange { a, b, lines } => editor.replace_lines(*a, *b, lines),
            AgentAction::InsertLine { n, text } => editor.insert_line(*n, text),
            AgentAction::DeleteLine { n } => editor.delete_line(*n),
            _ => unreachable!("non-mutation routed here"),
        };
        if let Err(e) = applied {
            return Ok(format!("{} failed: {e}", action.name()));
        }

        let after_text = textenc::read_text(target)?;
        let after_counts = fatal_kind_counts(&after_text);
        let regressed = after_counts
            .iter()
            .any(|(kind, count)| count > before_counts.get(kind).unwrap_or(&0));
        if regressed {
            std::fs::write(target, &before_bytes)
                .with_context(|| format!("rollback: {}", target.display()))?;
            editor.refresh().context("refresh after rollback")?;
            return Ok(format!(
                "{} rolled back: edit introduced new fatal issues",
                action.name()
            ));
        }
        Ok(format!("{}: ok", action.name()))
    }
}

fn fatal_kind_counts(text: &str) -> BTreeMap<String, usize> {
    let mut counts: BTreeMap<String, usize> = BTreeMap::new();
    for issue in validate(text).issues {
        if issue.severity == Severity::Fatal {
            *counts.entry(format!("{:?}", issue.kind)).or_insert(0) += 1;
        }
    }
    counts
}

fn render_history(history: &[String], keep: usize) -> String {
    if history.is_empty() {
        return "(无)".to_string();
    }
    let start = history.len().saturating_sub(keep);
    history[start..].join("\n")
}

/// The model's reply may wrap the JSON in prose; take the first object.
fn parse_action(reply: &str) -> anyhow::Result<AgentAction> {
    let start = reply.find('{').context("no JSON object in reply")?;
    let slice = &reply[start..];
    let mut de = serde_json::Deserializer::from_str(slice);
    let action = AgentAction::deserialize(&mut de).context("parse tool call")?;
    Ok(action)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::LlmReply;
    use std::sync::Mutex;

    struct ScriptedLlm {
        replies: Mutex<Vec<String>>,
    }

    impl ScriptedLlm {
        fn new(replies: Vec<&str>) -> Self {
            Self {
                replies: Mutex::new(replies.into_iter().rev().map(String::from).collect()),
            }
        }
    }

    impl LlmClient for ScriptedLlm {
        fn translate(&self, _prompt: &str) -> anyhow::Result<LlmReply> {
            let text = self
                .replies
                .lock()
                .expect("replies")
                .pop()
                .unwrap_or_else(|| "{\"tool\":\"done\"}".to_string());
            Ok(LlmReply {
                text,
                tokens_used: 1,
            })
        }
    }

    fn write_doc(dir: &Path, content: &str) -> std::path::PathBuf {
        let p = dir.join("main.tex");
        std::fs::write(&p, content).expect("write");
        p
    }

    #[test]
    fn parse_action_accepts_wrapped_json() {
        let action =
            parse_action("sure, here: {\"tool\":\"replace_line\",\"n\":3,\"text\":\"x\"} done")
                .expect("parse");
        assert!(matches!(action, AgentAction::ReplaceLine { n: 3, .. }));
    }

    #[test]
    fn agent_fixes_file_then_compiles() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = write_doc(
            dir.path(),
            "\\documentclass{article}\n\\begin{document}\n\\badcmd{x}\n\\end{document}\n",
        );

        let llm = ScriptedLlm::new(vec![
            "{\"tool\":\"replace_line\",\"n\":3,\"text\":\"x\"}",
            "{\"tool\":\"compile\"}",
        ]);
        let prompts = PromptCatalog::default();
        let trace = TraceWriter::disabled();
        let fixer = AgentFixer::new(&llm, &prompts, AgentBudgets::default(), &trace);

        let compile_fn = {
            let path = path.clone();
            move || -> anyhow::Result<CompileOutcome> {
                let text = std::fs::read_to_string(&path).expect("read");
                let success = !text.contains("\\badcmd");
                Ok(CompileOutcome {
                    success,
                    pdf_path: None,
                    log: if success {
                        String::new()
                    } else {
                        "! Undefined control sequence.\nl.3 \\badcmd\n".to_string()
                    },
                    error_msg: None,
                })
            }
        };

        let outcome = fixer
            .run(&path, &compile_fn, "! Undefined control sequence.\nl.3 \\badcmd\n")
            .expect("run");
        assert!(outcome.success);
        assert_eq!(outcome.edits, 1);
        assert!(std::fs::read_to_string(&path).expect("read").contains("\nx\n"));
    }

    #[test]
    fn regressive_edit_is_rolled_back() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = write_doc(
            dir.path(),
            "\\documentclass{article}\n\\begin{document}\nok\n\\end{document}\n",
        );
        let before = std::fs::read(&path).expect("read");

        // The edit adds an unmatched \end{table}, a new fatal issue.
        let llm = ScriptedLlm::new(vec![
            "{\"tool\":\"insert_line\",\"n\":4,\"text\":\"\\\\end{table}\"}",
            "{\"tool\":\"done\"}",
        ]);
        let prompts = PromptCatalog::default();
        let trace = TraceWriter::disabled();
        let fixer = AgentFixer::new(&llm, &prompts, AgentBudgets::default(), &trace);
        let compile_fn = || -> anyhow::Result<CompileOutcome> {
            Ok(CompileOutcome {
                success: false,
                pdf_path: None,
                log: "! error\n".to_string(),
                error_msg: None,
            })
        };

        let outcome = fixer.run(&path, &compile_fn, "! error\n").expect("run");
        assert!(!outcome.success);
        assert_eq!(std::fs::read(&path).expect("read"), before);
    }

    #[test]
    fn iteration_budget_bounds_the_loop() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = write_doc(
            dir.path(),
            "\\documentclass{article}\n\\begin{document}\nx\n\\end{document}\n",
        );

        // Endless validate loop; the budget must cut it off.
        let llm = ScriptedLlm::new(vec![
            "{\"tool\":\"validate\"}",
            "{\"tool\":\"validate\"}",
            "{\"tool\":\"validate\"}",
            "{\"tool\":\"validate\"}",
            "{\"tool\":\"validate\"}",
            "{\"tool\":\"validate\"}",
            "{\"tool\":\"validate\"}",
        ]);
        let prompts = PromptCatalog::default();
        let trace = TraceWriter::disabled();
        let budgets = AgentBudgets {
            max_iterations: 3,
            ..AgentBudgets::default()
        };
        let fixer = AgentFixer::new(&llm, &prompts, budgets, &trace);
        let compile_fn = || -> anyhow::Result<CompileOutcome> {
            Ok(CompileOutcome {
                success: false,
                pdf_path: None,
                log: String::new(),
                error_msg: None,
            })
        };

        let outcome = fixer.run(&path, &compile_fn, "").expect("run");
        assert!(!outcome.success);
        assert_eq!(outcome.iterations, 3);
    }
}

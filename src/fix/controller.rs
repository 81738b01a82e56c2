use std::collections::BTreeSet;
use std::path::Path;

use crate::compiler::CompileOutcome;
use crate::error::FixLevel;
use crate::llm::LlmClient;
use crate::trace::TraceWriter;
use crate::translate::PromptCatalog;

use super::agent::{AgentBudgets, AgentFixer};
use super::latexlog::{error_kind_set, sha256_hex};
use super::llm_fix::LlmFixer;
use super::rules::apply_rules;

/// One repair round, kept in memory for diagnostics.
#[derive(Clone, Debug)]
pub struct FixAttempt {
    pub level: FixLevel,
    pub iteration: usize,
    pub description: String,
    pub log_hash: String,
}

#[derive(Clone, Debug)]
pub struct FixReport {
    pub success: bool,
    pub final_level: FixLevel,
    pub attempts: Vec<FixAttempt>,
    pub final_log: String,
}

#[derive(Clone, Copy, Debug)]
pub struct FixBudgets {
    pub rule_retry: usize,
    pub llm_retry: usize,
    pub llm_max_bytes: usize,
    pub agent: AgentBudgets,
}

/// Escalating repair: deterministic rules, then LLM rewrites, then the
/// tool-using agent. Each level keeps trying while the error-kind set is
/// still shrinking; the first passing compile wins.
pub struct HierarchicalFixer<'a> {
    llm: &'a dyn LlmClient,
    prompts: &'a PromptCatalog,
    budgets: FixBudgets,
    trace: &'a TraceWriter,
}

impl<'a> HierarchicalFixer<'a> {
    #[must_use]
    pub fn new(
        llm: &'a dyn LlmClient,
        prompts: &'a PromptCatalog,
        budgets: FixBudgets,
        trace: &'a TraceWriter,
    ) -> Self {
        Self {
            llm,
            prompts,
            budgets,
            trace,
        }
    }

    pub fn repair(
        &self,
        source_dir: &Path,
        main_rel: &Path,
        initial_log: &str,
        compile: &dyn Fn() -> anyhow::Result<CompileOutcome>,
        on_level: &mut dyn FnMut(FixLevel, usize, &str),
    ) -> anyhow::Result<FixReport> {
        let mut attempts: Vec<FixAttempt> = Vec::new();
        let mut log = initial_log.to_string();
        let main_abs = source_dir.join(main_rel);

        // Level 1: rules.
        let mut kinds = error_kind_set(&log);
        for round in 1..=self.budgets.rule_retry {
            on_level(FixLevel::Rule, round, "规则修复");
            let applied = apply_rules(source_dir, main_rel, &log)?;
            let outcome = compile()?;
            attempts.push(FixAttempt {
                level: FixLevel::Rule,
                iteration: round,
                description: if applied {
                    "applied rule repairs".to_string()
                } else {
                    "no rule matched".to_string()
                },
                log_hash: sha256_hex(&outcome.log),
            });
            if outcome.success {
                return Ok(FixReport {
                    success: true,
                    final_level: FixLevel::Rule,
                    attempts,
                    final_log: outcome.log,
                });
            }
            let new_kinds = error_kind_set(&outcome.log);
            let shrunk = shrank(&kinds, &new_kinds);
            log = outcome.log;
            kinds = new_kinds;
            if !applied || !shrunk {
                break;
            }
        }

        // Level 2: LLM rewrites of the failing file.
        let llm_fixer = LlmFixer::new(self.llm, self.prompts, self.budgets.llm_max_bytes, self.trace);
        for round in 1..=self.budgets.llm_retry {
            on_level(FixLevel::Llm, round, "模型修复");
            let applied = llm_fixer.fix_file(&main_abs, &log)?;
            let outcome = compile()?;
            attempts.push(FixAttempt {
                level: FixLevel::Llm,
                iteration: round,
                description: if applied {
                    "applied llm rewrite".to_string()
                } else {
                    "llm produced no usable fix".to_string()
                },
                log_hash: sha256_hex(&outcome.log),
            });
            if outcome.success {
                return Ok(FixReport {
                    success: true,
                    final_level: FixLevel::Llm,
                    attempts,
                    final_log: outcome.log,
                });
            }
            let new_kinds = error_kind_set(&outcome.log);
            let shrunk = shrank(&kinds, &new_kinds);
            log = outcome.log;
            kinds = new_kinds;
            if !applied || !shrunk {
                break;
            }
        }

        // Level 3: agent session; it compiles internally.
        on_level(FixLevel::Agent, 1, "代理修复");
        let agent = AgentFixer::new(self.llm, self.prompts, self.budgets.agent, self.trace);
        let outcome = agent.run(&main_abs, compile, &log)?;
        attempts.push(FixAttempt {
            level: FixLevel::Agent,
            iteration: 1,
            description: format!(
                "agent: {} iterations, {} edits",
                outcome.iterations, outcome.edits
            ),
            log_hash: sha256_hex(&outcome.last_log),
        });

        Ok(FixReport {
            success: outcome.success,
            final_level: FixLevel::Agent,
            attempts,
            final_log: outcome.last_log,
        })
    }
}

/// Progress means strictly fewer error kinds, or losing at least one old
/// kind without gaining new ones.
fn shrank(before: &BTreeSet<String>, after: &BTreeSet<String>) -> bool {
    if after.is_empty() {
        return true;
    }
    after.len() < before.len() || (after.is_subset(before) && after != before)
}

mod agent;
mod controller;
mod latexlog;
mod llm_fix;
mod rules;

pub use agent::{AgentBudgets, AgentFixer, AgentOutcome};
pub use controller::{FixAttempt, FixBudgets, FixReport, HierarchicalFixer};
pub use latexlog::{error_kind_set, extract_log_issues, log_excerpt, sha256_hex, LogErrorKind, LogIssue};
pub use llm_fix::LlmFixer;
pub use rules::{apply_rules, apply_rules_to_text};

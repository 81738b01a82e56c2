use std::collections::BTreeSet;

use once_cell::sync::Lazy;
use regex::Regex;
use sha2::{Digest, Sha256};

static LINE_MARKER_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"^l\.(\d+)").expect("l. regex"));
static PACKAGE_ERROR_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^! Package (\w+) Error").expect("package error regex"));
static CONTROL_SEQ_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(\\[^\s\\{}]+)\s*$").expect("control seq regex"));

/// Error classes recognized in an engine log. The string form feeds the
/// shrink test in the escalation loop.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum LogErrorKind {
    UndefinedControlSequence,
    MissingDollar,
    MissingOpenBrace,
    MissingCloseBrace,
    ExtraCloseBrace,
    RunawayArgument,
    PackageError(String),
    LatexError,
    Other,
}

impl LogErrorKind {
    #[must_use]
    pub fn as_key(&self) -> String {
        match self {
            Self::UndefinedControlSequence => "undefined_control_sequence".to_string(),
            Self::MissingDollar => "missing_dollar".to_string(),
            Self::MissingOpenBrace => "missing_open_brace".to_string(),
            Self::MissingCloseBrace => "missing_close_brace".to_string(),
            Self::ExtraCloseBrace => "extra_close_brace".to_string(),
            Self::RunawayArgument => "runaway_argument".to_string(),
            Self::PackageError(name) => format!("package_error:{name}"),
            Self::LatexError => "latex_error".to_string(),
            Self::Other => "other".to_string(),
        }
    }
}

/// One extracted error with the source line the engine attributed it to.
#[derive(Clone, Debug)]
pub struct LogIssue {
    pub kind: LogErrorKind,
    pub line: Option<usize>,
    pub message: String,
    /// Offending control sequence for undefined-command errors.
    pub detail: Option<String>,
}

/// Scan a compile log for error records. Each `!`-prefixed line opens an
/// issue; a following `l.<n>` marker pins it to a source line.
#[must_use]
pub fn extract_log_issues(log: &str) -> Vec<LogIssue> {
    let mut issues: Vec<LogIssue> = Vec::new();
    let mut pending: Option<usize> = None;

    for line in log.lines() {
        if let Some(cap) = LINE_MARKER_RE.captures(line) {
            if let Some(idx) = pending.take() {
                let n: usize = cap[1].parse().unwrap_or(0);
                if n > 0 {
                    issues[idx].line = Some(n);
                }
                if issues[idx].kind == LogErrorKind::UndefinedControlSequence {
                    issues[idx].detail = CONTROL_SEQ_RE
                        .captures(line)
                        .map(|c| c[1].to_string());
                }
            }
            continue;
        }
        if line.starts_with("Runaway argument") {
            issues.push(LogIssue {
                kind: LogErrorKind::RunawayArgument,
                line: None,
                message: line.to_string(),
                detail: None,
            });
            pending = Some(issues.len() - 1);
            continue;
        }
        if !line.starts_with('!') {
            continue;
        }

        let kind = if line.contains("Undefined control sequence") {
            LogErrorKind::UndefinedControlSequence
        } else if line.contains("Missing $ inserted") {
            LogErrorKind::MissingDollar
        } else if line.contains("Missing { inserted") {
            LogErrorKind::MissingOpenBrace
        } else if line.contains("Missing } inserted") {
            LogErrorKind::MissingCloseBrace
        } else if line.contains("Extra }") {
            LogErrorKind::ExtraCloseBrace
        } else if let Some(cap) = PACKAGE_ERROR_RE.captures(line) {
            LogErrorKind::PackageError(cap[1].to_string())
        } else if line.contains("LaTeX Error") {
            LogErrorKind::LatexError
        } else {
            LogErrorKind::Other
        };
        issues.push(LogIssue {
            kind,
            line: None,
            message: line.trim_start_matches('!').trim().to_string(),
            detail: None,
        });
        pending = Some(issues.len() - 1);
    }
    issues
}

/// Distinct error classes in a log; escalation stops a level when this set
/// stops shrinking.
#[must_use]
pub fn error_kind_set(log: &str) -> BTreeSet<String> {
    extract_log_issues(log)
        .into_iter()
        .map(|i| i.kind.as_key())
        .collect()
}

/// Short human excerpt: the first error lines, capped.
#[must_use]
pub fn log_excerpt(log: &str, max_chars: usize) -> String {
    let mut out = String::new();
    for line in log.lines() {
        if line.starts_with('!') || line.starts_with("l.") || line.starts_with("Runaway") {
            if out.len() + line.len() + 1 > max_chars {
                break;
            }
            out.push_str(line);
            out.push('\n');
        }
    }
    if out.is_empty() {
        out = log.chars().take(max_chars).collect();
    }
    out.trim_end().to_string()
}

#[must_use]
pub fn sha256_hex(text: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(text.as_bytes());
    hex::encode(hasher.finalize())
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = "\
This is XeTeX
! Undefined control sequence.
l.42 \\引用
              {smith2020}
! Missing $ inserted.
<inserted text>
l.77 x_
! Package ctex Error: something about fonts.
! LaTeX Error: Environment foo undefined.
Runaway argument?
{...}
l.90
";

    #[test]
    fn extracts_kinds_and_lines() {
        let issues = extract_log_issues(SAMPLE);
        assert_eq!(issues.len(), 5);
        assert_eq!(issues[0].kind, LogErrorKind::UndefinedControlSequence);
        assert_eq!(issues[0].line, Some(42));
        assert_eq!(issues[0].detail.as_deref(), Some("\\引用"));
        assert_eq!(issues[1].kind, LogErrorKind::MissingDollar);
        assert_eq!(issues[1].line, Some(77));
        assert_eq!(
            issues[2].kind,
            LogErrorKind::PackageError("ctex".to_string())
        );
        assert_eq!(issues[3].kind, LogErrorKind::LatexError);
        assert_eq!(issues[4].kind, LogErrorKind::RunawayArgument);
        assert_eq!(issues[4].line, Some(90));
    }

    #[test]
    fn kind_set_is_deduplicated() {
        let log = "! Extra }\nl.1\n! Extra }\nl.2\n";
        let set = error_kind_set(log);
        assert_eq!(set.len(), 1);
        assert!(set.contains("extra_close_brace"));
    }

    #[test]
    fn excerpt_keeps_error_lines() {
        let excerpt = log_excerpt(SAMPLE, 200);
        assert!(excerpt.contains("Undefined control sequence"));
        assert!(!excerpt.contains("This is XeTeX"));
    }

    #[test]
    fn hash_is_stable() {
        assert_eq!(sha256_hex("a"), sha256_hex("a"));
        assert_ne!(sha256_hex("a"), sha256_hex("b"));
    }
}

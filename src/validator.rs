use once_cell::sync::Lazy;
use regex::Regex;

static BEGIN_ENV_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\\begin\{([A-Za-z@]+\*?)\}").expect("begin env regex"));
static END_ENV_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\\end\{([A-Za-z@]+\*?)\}").expect("end env regex"));
static USEPACKAGE_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"\\usepackage(?:\[([^\]]*)\])?\{([^}]*)\}").expect("usepackage regex")
});
static COMMAND_WITH_ARG_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\\[A-Za-z]+(?:\[[^\]]*\])?\{").expect("command regex"));
static ASCII_WORD_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"[A-Za-z]{2,}").expect("word regex"));

/// Indicator vocabulary for comment-prose detection: words that strongly
/// suggest a line belongs to a human-written preamble comment.
const PROSE_INDICATORS: &[&str] = &[
    "recommended",
    "optional",
    "preprint",
    "above.",
    "following:",
    "uncomment",
    "journal",
    "submission",
];

/// Environments whose body is taken literally; nothing inside them counts
/// toward brace or environment balance.
const VERBATIM_ENVS: &[&str] = &["verbatim", "verbatim*", "lstlisting", "Verbatim"];

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum IssueKind {
    UnbalancedBrace,
    UnclosedEnv(String),
    DuplicateBibliographyInPreamble,
    SplitCommentInPreamble,
    MergedCommentInPreamble,
    ForbiddenPackage(String),
    MicrotypeXeTeXIncompat,
    EncodingBom,
    NonUtf8,
}

impl IssueKind {
    fn order(&self) -> u8 {
        match self {
            Self::NonUtf8 => 0,
            Self::EncodingBom => 1,
            Self::UnbalancedBrace => 2,
            Self::UnclosedEnv(_) => 3,
            Self::DuplicateBibliographyInPreamble => 4,
            Self::SplitCommentInPreamble => 5,
            Self::MergedCommentInPreamble => 6,
            Self::ForbiddenPackage(_) => 7,
            Self::MicrotypeXeTeXIncompat => 8,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Severity {
    Fatal,
    Warning,
}

#[derive(Clone, Debug)]
pub struct ValidationIssue {
    pub kind: IssueKind,
    pub line: usize,
    pub column: Option<usize>,
    pub message: String,
    pub severity: Severity,
}

#[derive(Clone, Debug, Default)]
pub struct ValidationReport {
    pub issues: Vec<ValidationIssue>,
}

impl ValidationReport {
    #[must_use]
    pub fn valid(&self) -> bool {
        !self
            .issues
            .iter()
            .any(|i| i.severity == Severity::Fatal)
    }

    #[must_use]
    pub fn fatal_issues(&self) -> Vec<&ValidationIssue> {
        self.issues
            .iter()
            .filter(|i| i.severity == Severity::Fatal)
            .collect()
    }
}

/// Static checks over a full `.tex` source. Pure: the same input always
/// yields the same report, issues sorted by line then kind.
#[must_use]
pub fn validate(text: &str) -> ValidationReport {
    let mut issues = Vec::new();

    if text.starts_with('\u{FEFF}') {
        issues.push(ValidationIssue {
            kind: IssueKind::EncodingBom,
            line: 1,
            column: Some(1),
            message: "文件以 BOM 开头".to_string(),
            severity: Severity::Warning,
        });
    }

    let lines: Vec<&str> = text.lines().collect();
    let doc_begin_line = lines
        .iter()
        .position(|l| strip_comment(l).contains("\\begin{document}"))
        .map(|i| i + 1);

    check_braces_and_envs(&lines, &mut issues);
    check_preamble(&lines, doc_begin_line, &mut issues);
    check_packages(&lines, doc_begin_line, &mut issues);

    issues.sort_by(|a, b| a.line.cmp(&b.line).then(a.kind.order().cmp(&b.kind.order())));
    ValidationReport { issues }
}

/// Byte-level entry point; reports `NonUtf8` instead of panicking on bad
/// input.
#[must_use]
pub fn validate_bytes(bytes: &[u8]) -> ValidationReport {
    match std::str::from_utf8(bytes) {
        Ok(text) => validate(text),
        Err(e) => {
            let line = bytes[..e.valid_up_to()]
                .iter()
                .filter(|b| **b == b'\n')
                .count()
                + 1;
            ValidationReport {
                issues: vec![ValidationIssue {
                    kind: IssueKind::NonUtf8,
                    line,
                    column: None,
                    message: format!("非 UTF-8 字节 (offset {})", e.valid_up_to()),
                    severity: Severity::Fatal,
                }],
            }
        }
    }
}

/// Cheap caller path: the first fatal issue, if any.
#[must_use]
pub fn quick_check(text: &str) -> Option<ValidationIssue> {
    validate(text)
        .issues
        .into_iter()
        .find(|i| i.severity == Severity::Fatal)
}

struct EnvFrame {
    name: String,
    line: usize,
}

fn check_braces_and_envs(lines: &[&str], issues: &mut Vec<ValidationIssue>) {
    let mut open_braces: Vec<(usize, usize)> = Vec::new();
    let mut excess_close: Option<(usize, usize)> = None;
    let mut env_stack: Vec<EnvFrame> = Vec::new();
    let mut stray_ends: Vec<(String, usize)> = Vec::new();
    let mut verbatim_until: Option<String> = None;

    for (idx, raw) in lines.iter().enumerate() {
        let line_no = idx + 1;

        if let Some(env) = verbatim_until.clone() {
            if raw.contains(&format!("\\end{{{env}}}")) {
                verbatim_until = None;
            }
            continue;
        }

        let code = strip_comment(raw);

        for cap in BEGIN_ENV_RE.captures_iter(&code) {
            let name = cap[1].to_string();
            if VERBATIM_ENVS.contains(&name.as_str()) {
                // A same-line \end closes the span immediately; the line's
                // content is literal either way.
                if !code[cap.get(0).expect("match").end()..]
                    .contains(&format!("\\end{{{name}}}"))
                {
                    verbatim_until = Some(name);
                }
                break;
            }
            env_stack.push(EnvFrame { name, line: line_no });
        }
        if verbatim_until.is_some() {
            continue;
        }
        if VERBATIM_ENVS
            .iter()
            .any(|env| code.contains(&format!("\\begin{{{env}}}")))
        {
            // Single-line verbatim span: skip brace/env scanning for the line.
            continue;
        }
        for cap in END_ENV_RE.captures_iter(&code) {
            let name = cap[1].to_string();
            match env_stack.iter().rposition(|f| f.name == name) {
                Some(pos) => {
                    // Everything nested above the matching begin is unclosed.
                    for frame in env_stack.drain(pos + 1..) {
                        issues.push(unclosed_env_issue(frame.name, frame.line));
                    }
                    env_stack.pop();
                }
                None => stray_ends.push((name, line_no)),
            }
        }

        scan_braces(&code, line_no, &mut open_braces, &mut excess_close);
    }

    if let Some((line, col)) = excess_close {
        issues.push(ValidationIssue {
            kind: IssueKind::UnbalancedBrace,
            line,
            column: Some(col),
            message: "多余的 '}'".to_string(),
            severity: Severity::Fatal,
        });
    } else if let Some((line, col)) = open_braces.first().copied() {
        issues.push(ValidationIssue {
            kind: IssueKind::UnbalancedBrace,
            line,
            column: Some(col),
            message: format!("未闭合的 '{{' ({} 处)", open_braces.len()),
            severity: Severity::Fatal,
        });
    }

    for frame in env_stack {
        issues.push(unclosed_env_issue(frame.name, frame.line));
    }
    for (name, line) in stray_ends {
        issues.push(ValidationIssue {
            kind: IssueKind::UnclosedEnv(name.clone()),
            line,
            column: None,
            message: format!("\\end{{{name}}} 没有对应的 \\begin"),
            severity: Severity::Fatal,
        });
    }
}

fn unclosed_env_issue(name: String, line: usize) -> ValidationIssue {
    ValidationIssue {
        message: format!("环境 {name} 未闭合"),
        kind: IssueKind::UnclosedEnv(name),
        line,
        column: None,
        severity: Severity::Fatal,
    }
}

fn scan_braces(
    code: &str,
    line_no: usize,
    open: &mut Vec<(usize, usize)>,
    excess_close: &mut Option<(usize, usize)>,
) {
    let bytes = code.as_bytes();
    let mut i = 0usize;
    let mut col = 1usize;
    while i < bytes.len() {
        let b = bytes[i];
        match b {
            b'\\' => {
                // \verb<delim>...<delim> is literal.
                if code[i..].starts_with("\\verb") {
                    let rest = &code[i + 5..];
                    let rest = rest.strip_prefix('*').unwrap_or(rest);
                    if let Some(delim) = rest.chars().next() {
                        if !delim.is_ascii_alphabetic() && delim != '{' {
                            let start = i + (code.len() - rest.len() - i) + delim.len_utf8();
                            if let Some(end) = code[start..].find(delim) {
                                let skipped = start + end + delim.len_utf8() - i;
                                i += skipped;
                                col += skipped;
                                continue;
                            }
                            // Unterminated \verb: rest of line is literal.
                            return;
                        }
                    }
                }
                // Escaped next char (covers \{ \} \%).
                i += 2;
                col += 2;
                continue;
            }
            b'{' => open.push((line_no, col)),
            b'}' => {
                if open.pop().is_none() && excess_close.is_none() {
                    *excess_close = Some((line_no, col));
                }
            }
            _ => {}
        }
        i += 1;
        col += 1;
    }
}

/// Code content of a line: everything before the first unescaped `%`,
/// with inline `\verb` spans left intact for the caller's scanners.
#[must_use]
pub fn strip_comment(line: &str) -> String {
    let bytes = line.as_bytes();
    let mut i = 0usize;
    while i < bytes.len() {
        match bytes[i] {
            b'\\' => {
                i += 2;
            }
            b'%' => return line[..i].to_string(),
            _ => i += 1,
        }
    }
    line.to_string()
}

fn check_preamble(lines: &[&str], doc_begin_line: Option<usize>, issues: &mut Vec<ValidationIssue>) {
    let preamble_end = doc_begin_line.unwrap_or(lines.len() + 1);

    for (idx, raw) in lines.iter().enumerate() {
        let line_no = idx + 1;
        if line_no >= preamble_end {
            break;
        }

        if strip_comment(raw).contains("\\begin{thebibliography}") {
            issues.push(ValidationIssue {
                kind: IssueKind::DuplicateBibliographyInPreamble,
                line: line_no,
                column: None,
                message: "导言区出现 thebibliography 环境".to_string(),
                severity: Severity::Warning,
            });
        }

        // A bare "%" line followed by a prose line is a comment the
        // translation split in half.
        let trimmed = raw.trim_end();
        if trimmed == "%" || trimmed == "% " {
            if let Some(next) = lines.get(idx + 1) {
                let next_trim = next.trim();
                if !next_trim.is_empty()
                    && !next_trim.starts_with('\\')
                    && !next_trim.starts_with('%')
                    && looks_like_prose(next_trim)
                {
                    issues.push(ValidationIssue {
                        kind: IssueKind::SplitCommentInPreamble,
                        line: line_no,
                        column: None,
                        message: "导言区注释被拆成两行".to_string(),
                        severity: Severity::Warning,
                    });
                }
            }
        }

        // A comment line with prose and a trailing \command{...} probably
        // swallowed a real command.
        if let Some(comment) = comment_text(raw) {
            if let Some(cmd) = COMMAND_WITH_ARG_RE.find(comment) {
                let before = &comment[..cmd.start()];
                if looks_like_prose(before) {
                    issues.push(ValidationIssue {
                        kind: IssueKind::MergedCommentInPreamble,
                        line: line_no,
                        column: None,
                        message: "导言区注释吞并了后续命令".to_string(),
                        severity: Severity::Warning,
                    });
                }
            }
        }
    }
}

fn check_packages(lines: &[&str], doc_begin_line: Option<usize>, issues: &mut Vec<ValidationIssue>) {
    let preamble_end = doc_begin_line.unwrap_or(lines.len() + 1);
    let mut uses_ctex = false;
    let mut cjkutf8_line = None;
    let mut plain_microtype_line = None;

    for (idx, raw) in lines.iter().enumerate() {
        let line_no = idx + 1;
        if line_no >= preamble_end {
            break;
        }
        let code = strip_comment(raw);
        for cap in USEPACKAGE_RE.captures_iter(&code) {
            let opts = cap.get(1).map(|m| m.as_str()).unwrap_or("");
            for pkg in cap[2].split(',') {
                let pkg = pkg.trim();
                match pkg {
                    "ctex" | "xeCJK" => uses_ctex = true,
                    "CJKutf8" => cjkutf8_line = Some(line_no),
                    "microtype" if opts.trim().is_empty() => {
                        plain_microtype_line = Some(line_no);
                    }
                    _ => {}
                }
            }
        }
    }

    if uses_ctex {
        if let Some(line) = cjkutf8_line {
            issues.push(ValidationIssue {
                kind: IssueKind::ForbiddenPackage("CJKutf8".to_string()),
                line,
                column: None,
                message: "CJKutf8 与 ctex 冲突".to_string(),
                severity: Severity::Warning,
            });
        }
        if let Some(line) = plain_microtype_line {
            issues.push(ValidationIssue {
                kind: IssueKind::MicrotypeXeTeXIncompat,
                line,
                column: None,
                message: "XeLaTeX 下 microtype 需要关闭 protrusion/expansion".to_string(),
                severity: Severity::Warning,
            });
        }
    }
}

/// Comment payload of a line (text after the first unescaped `%`), if any.
#[must_use]
pub fn comment_text(line: &str) -> Option<&str> {
    let bytes = line.as_bytes();
    let mut i = 0usize;
    while i < bytes.len() {
        match bytes[i] {
            b'\\' => i += 2,
            b'%' => return Some(&line[i + 1..]),
            _ => i += 1,
        }
    }
    None
}

/// Prose heuristic shared with the repair passes: at least three
/// ASCII-letter words, or a known indicator word.
#[must_use]
pub fn looks_like_prose(text: &str) -> bool {
    let lower = text.to_ascii_lowercase();
    if PROSE_INDICATORS.iter().any(|w| lower.contains(w)) {
        return true;
    }
    ASCII_WORD_RE.find_iter(text).count() >= 3
}

#[cfg(test)]
mod tests {
    use super::*;

    const OK_DOC: &str = r"\documentclass{article}
\usepackage{amsmath}
\begin{document}
Hello $x^2$ and \{literal\}.
\begin{itemize}
\item one
\end{itemize}
\end{document}
";

    #[test]
    fn clean_document_validates() {
        let report = validate(OK_DOC);
        assert!(report.valid(), "issues: {:?}", report.issues);
        assert!(report.issues.is_empty());
    }

    #[test]
    fn unbalanced_open_brace_is_fatal() {
        let report = validate("\\documentclass{article}\n\\begin{document}\n\\textbf{oops\n\\end{document}\n");
        assert!(!report.valid());
        let issue = &report.fatal_issues()[0];
        assert_eq!(issue.kind, IssueKind::UnbalancedBrace);
        assert_eq!(issue.line, 3);
    }

    #[test]
    fn escaped_and_verbatim_braces_are_skipped() {
        let doc = "\\documentclass{article}\n\\begin{document}\n\\{ \\} \\verb|{{{| done\n\\begin{verbatim}\n{ { {\n\\end{verbatim}\n\\end{document}\n";
        let report = validate(doc);
        assert!(report.valid(), "issues: {:?}", report.issues);
    }

    #[test]
    fn comment_braces_are_skipped() {
        let report = validate("\\documentclass{article}\n% unmatched {\n\\begin{document}\nx\n\\end{document}\n");
        assert!(report.valid());
    }

    #[test]
    fn unclosed_env_reports_begin_line() {
        let doc = "\\documentclass{article}\n\\begin{document}\n\\begin{itemize}\n\\item x\n\\end{document}\n";
        let report = validate(doc);
        let unclosed = report
            .issues
            .iter()
            .find(|i| matches!(i.kind, IssueKind::UnclosedEnv(ref n) if n == "itemize"))
            .expect("unclosed itemize");
        assert_eq!(unclosed.line, 3);
    }

    #[test]
    fn starred_env_is_distinct() {
        let doc = "\\documentclass{article}\n\\begin{document}\n\\begin{align*}\nx\n\\end{align}\n\\end{document}\n";
        let report = validate(doc);
        assert!(!report.valid());
        assert!(report
            .issues
            .iter()
            .any(|i| matches!(i.kind, IssueKind::UnclosedEnv(ref n) if n == "align*")));
    }

    #[test]
    fn bibliography_in_preamble_flagged() {
        let doc = "\\documentclass{article}\n\\begin{thebibliography}{9}\n\\end{thebibliography}\n\\begin{document}\nx\n\\end{document}\n";
        let report = validate(doc);
        assert!(report
            .issues
            .iter()
            .any(|i| i.kind == IssueKind::DuplicateBibliographyInPreamble && i.line == 2));
    }

    #[test]
    fn split_comment_detected() {
        let doc = "\\documentclass{article}\n%\nthe following packages are recommended\n\\begin{document}\nx\n\\end{document}\n";
        let report = validate(doc);
        assert!(report
            .issues
            .iter()
            .any(|i| i.kind == IssueKind::SplitCommentInPreamble && i.line == 2));
    }

    #[test]
    fn merged_comment_detected() {
        let doc = "\\documentclass{article}\n% use the options listed above. \\usepackage{graphicx}\n\\begin{document}\nx\n\\end{document}\n";
        let report = validate(doc);
        assert!(report
            .issues
            .iter()
            .any(|i| i.kind == IssueKind::MergedCommentInPreamble && i.line == 2));
    }

    #[test]
    fn cjkutf8_with_ctex_flagged() {
        let doc = "\\documentclass{article}\n\\usepackage{ctex}\n\\usepackage{CJKutf8}\n\\usepackage{microtype}\n\\begin{document}\nx\n\\end{document}\n";
        let report = validate(doc);
        assert!(report
            .issues
            .iter()
            .any(|i| i.kind == IssueKind::ForbiddenPackage("CJKutf8".to_string())));
        assert!(report
            .issues
            .iter()
            .any(|i| i.kind == IssueKind::MicrotypeXeTeXIncompat));
    }

    #[test]
    fn microtype_with_options_is_fine() {
        let doc = "\\documentclass{article}\n\\usepackage{ctex}\n\\usepackage[protrusion=false,expansion=false]{microtype}\n\\begin{document}\nx\n\\end{document}\n";
        let report = validate(doc);
        assert!(!report
            .issues
            .iter()
            .any(|i| i.kind == IssueKind::MicrotypeXeTeXIncompat));
    }

    #[test]
    fn bom_flagged_and_non_utf8_fatal() {
        let report = validate("\u{FEFF}\\documentclass{article}\n\\begin{document}\nx\n\\end{document}\n");
        assert!(report.issues.iter().any(|i| i.kind == IssueKind::EncodingBom));

        let report = validate_bytes(&[b'a', 0xFF, b'b']);
        assert!(!report.valid());
        assert_eq!(report.issues[0].kind, IssueKind::NonUtf8);
    }

    #[test]
    fn quick_check_returns_first_fatal() {
        let doc = "\\documentclass{article}\n\\begin{document}\n\\begin{itemize}\n\\end{document}\n";
        let issue = quick_check(doc).expect("fatal");
        assert!(matches!(issue.kind, IssueKind::UnclosedEnv(_)));
        assert!(quick_check(OK_DOC).is_none());
    }

    #[test]
    fn issues_sorted_by_line_then_kind() {
        let doc = "\\documentclass{article}\n\\begin{thebibliography}{9}\n\\end{thebibliography}\n\\textbf{oops\n\\begin{document}\nx\n\\end{document}\n";
        let report = validate(doc);
        let lines: Vec<usize> = report.issues.iter().map(|i| i.line).collect();
        let mut sorted = lines.clone();
        sorted.sort_unstable();
        assert_eq!(lines, sorted);
    }
}

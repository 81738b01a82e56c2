use std::path::Path;

use once_cell::sync::Lazy;
use regex::Regex;

use crate::project::list_tex_files;
use crate::textenc;
use crate::validator::{strip_comment, validate, IssueKind};

use super::latexlog::{extract_log_issues, LogErrorKind};

/// Command names the model sometimes translates into Chinese, with their
/// canonical forms.
const TRANSLATED_COMMANDS: &[(&str, &str)] = &[
    ("引用", "cite"),
    ("引文", "cite"),
    ("参考", "ref"),
    ("标签", "label"),
    ("章节", "section"),
    ("小节", "subsection"),
    ("子小节", "subsubsection"),
    ("段落", "paragraph"),
    ("标题", "title"),
    ("作者", "author"),
    ("摘要", "abstract"),
    ("项目", "item"),
    ("强调", "emph"),
    ("粗体", "textbf"),
    ("斜体", "textit"),
    ("脚注", "footnote"),
    ("图注", "caption"),
];

static CJK_COMMAND_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\\([\p{Han}]+)").expect("cjk command regex"));
static CJK_COMMAND_WITH_ARG_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\\[\p{Han}]+\{([^{}]*)\}").expect("cjk arg regex"));
static END_ITEM_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(\\end\{(?:itemize|enumerate|description)\})(\\item\b)").expect("end item regex")
});
static ITEM_AFTER_END_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(\\item\b[^\n]*?)(\\end\{(?:itemize|enumerate|description)\})")
        .expect("item end regex")
});
static END_BEGIN_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(\\end\{[A-Za-z@]+\*?\})(\\begin\{[A-Za-z@]+\*?\})").expect("end begin regex")
});
static END_SECTION_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(\\end\{[A-Za-z@]+\*?\})(\\(?:sub)*section\b)").expect("end section regex")
});
static BARE_SCRIPT_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"([A-Za-z0-9]+(?:_\{[^{}]*\}|\^\{[^{}]*\}|_[A-Za-z0-9]|\^[A-Za-z0-9])+)")
        .expect("bare script regex")
});
static END_TABLE_UNCLOSED_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"\\end\{(table\*?|tabular)(?:$|([^}*]))").expect("end table regex")
});
static TABULAR_SPEC_OPEN_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\\begin\{tabular\}\{[^}\n]*$").expect("tabular open regex"));

/// Deterministic repair pass over the project, driven by the compile log.
/// Returns whether anything changed on disk. The rule set is confluent:
/// a second application over its own output is a no-op.
pub fn apply_rules(source_dir: &Path, main_rel: &Path, log: &str) -> anyhow::Result<bool> {
    let issues = extract_log_issues(log);
    let has_missing_dollar = issues
        .iter()
        .any(|i| i.kind == LogErrorKind::MissingDollar);

    let mut changed_any = false;
    for rel in list_tex_files(source_dir) {
        let abs = source_dir.join(&rel);
        let Ok(text) = textenc::read_text(&abs) else {
            continue;
        };
        let is_root = rel == main_rel || text.contains("\\end{document}");
        let fixed = apply_rules_to_text(&text, has_missing_dollar, is_root);
        if fixed != text {
            textenc::write_text(&abs, &fixed)?;
            changed_any = true;
        }
    }
    Ok(changed_any)
}

/// The full per-file rule sequence. Public for the tests that assert
/// confluence.
#[must_use]
pub fn apply_rules_to_text(text: &str, fix_missing_dollar: bool, is_root: bool) -> String {
    let mut out = fix_translated_commands(text);
    out = strip_unknown_cjk_commands(&out);
    out = split_concatenated_structure(&out);
    out = close_unclosed_table_ends(&out);
    out = collapse_broken_tabular_openers(&out);
    if fix_missing_dollar {
        out = wrap_bare_scripts(&out);
    }
    if is_root {
        out = balance_braces(&out);
        out = close_unterminated_environments(&out);
    }
    out
}

/// `\引用{...}` and friends back to their English commands.
fn fix_translated_commands(text: &str) -> String {
    CJK_COMMAND_RE
        .replace_all(text, |caps: &regex::Captures<'_>| {
            let name = &caps[1];
            for (zh, en) in TRANSLATED_COMMANDS {
                if name == *zh {
                    return format!("\\{en}");
                }
            }
            caps[0].to_string()
        })
        .into_owned()
}

/// Any CJK-named command left after the mapping is a hallucination: drop
/// the command, keep its braced argument's contents.
fn strip_unknown_cjk_commands(text: &str) -> String {
    let with_args = CJK_COMMAND_WITH_ARG_RE.replace_all(text, "$1");
    CJK_COMMAND_RE.replace_all(&with_args, "").into_owned()
}

/// Structure tokens the model glued together go back onto their own lines.
fn split_concatenated_structure(text: &str) -> String {
    let mut out = END_ITEM_RE.replace_all(text, "$1\n$2").into_owned();
    out = ITEM_AFTER_END_RE.replace_all(&out, "$1\n$2").into_owned();
    out = END_BEGIN_RE.replace_all(&out, "$1\n$2").into_owned();
    out = END_SECTION_RE.replace_all(&out, "$1\n\n$2").into_owned();
    out
}

/// `\end{table` and `\end{tabular` with the closing brace eaten.
fn close_unclosed_table_ends(text: &str) -> String {
    let mut out = Vec::new();
    for line in text.lines() {
        out.push(
            END_TABLE_UNCLOSED_RE
                .replace_all(line, |caps: &regex::Captures<'_>| {
                    let env = &caps[1];
                    match caps.get(2) {
                        Some(next) => format!("\\end{{{env}}}{}", next.as_str()),
                        None => format!("\\end{{{env}}}"),
                    }
                })
                .into_owned(),
        );
    }
    join_like(text, out)
}

/// `\begin{tabular}{l|c` with the spec continuing on the next line is
/// collapsed into one line so the spec closes where it opened.
fn collapse_broken_tabular_openers(text: &str) -> String {
    let lines: Vec<&str> = text.lines().collect();
    let mut out: Vec<String> = Vec::new();
    let mut i = 0usize;
    while i < lines.len() {
        let line = lines[i];
        if TABULAR_SPEC_OPEN_RE.is_match(&strip_comment(line)) {
            let mut merged = line.trim_end().to_string();
            let mut j = i + 1;
            while j < lines.len() && !merged_spec_closed(&merged) && j - i <= 3 {
                merged.push(' ');
                merged.push_str(lines[j].trim());
                j += 1;
            }
            if merged_spec_closed(&merged) {
                out.push(merged);
                i = j;
                continue;
            }
        }
        out.push(line.to_string());
        i += 1;
    }
    join_like(text, out)
}

fn merged_spec_closed(line: &str) -> bool {
    let Some(pos) = line.find("\\begin{tabular}{") else {
        return true;
    };
    let rest = &line[pos + "\\begin{tabular}{".len()..];
    let mut depth: i64 = 1;
    for ch in rest.chars() {
        match ch {
            '{' => depth += 1,
            '}' => {
                depth -= 1;
                if depth == 0 {
                    return true;
                }
            }
            _ => {}
        }
    }
    false
}

/// Bare sub/superscripts outside math get wrapped in `$…$`. Only applied
/// when the log actually complained about a missing `$`.
fn wrap_bare_scripts(text: &str) -> String {
    let mut out: Vec<String> = Vec::new();
    let mut in_math_env = false;
    for line in text.lines() {
        let code = strip_comment(line);
        if code.contains("\\begin{equation")
            || code.contains("\\begin{align")
            || code.contains("\\begin{eqnarray")
            || code.contains("\\begin{gather")
            || code.contains("\\begin{multline")
        {
            in_math_env = true;
        }
        if !in_math_env && !line.contains('$') && !line.trim_start().starts_with('%') {
            out.push(BARE_SCRIPT_RE.replace_all(line, "$$$1$$").into_owned());
        } else {
            out.push(line.to_string());
        }
        if code.contains("\\end{equation")
            || code.contains("\\end{align")
            || code.contains("\\end{eqnarray")
            || code.contains("\\end{gather")
            || code.contains("\\end{multline")
        {
            in_math_env = false;
        }
    }
    join_like(text, out)
}

/// Net brace imbalance repair: missing `}` lands just before
/// `\end{document}`, an excess `}` loses its rightmost unescaped
/// occurrence.
fn balance_braces(text: &str) -> String {
    let balance = brace_balance(text);
    if balance == 0 {
        return text.to_string();
    }
    if balance > 0 {
        let closers = "}".repeat(balance as usize);
        if let Some(pos) = text.rfind("\\end{document}") {
            let mut out = String::with_capacity(text.len() + balance as usize + 1);
            out.push_str(&text[..pos]);
            out.push_str(&closers);
            out.push('\n');
            out.push_str(&text[pos..]);
            return out;
        }
        let mut out = text.to_string();
        out.push_str(&closers);
        return out;
    }

    // Drop rightmost unescaped '}' once per excess.
    let mut out = text.to_string();
    for _ in 0..(-balance) {
        if let Some(pos) = rightmost_unescaped_close(&out) {
            out.remove(pos);
        } else {
            break;
        }
    }
    out
}

fn brace_balance(text: &str) -> i64 {
    let mut balance = 0i64;
    let mut in_verbatim = false;
    for line in text.lines() {
        if in_verbatim {
            if line.contains("\\end{verbatim}") {
                in_verbatim = false;
            }
            continue;
        }
        if line.contains("\\begin{verbatim}") {
            in_verbatim = true;
            continue;
        }
        let code = strip_comment(line);
        let bytes = code.as_bytes();
        let mut i = 0usize;
        while i < bytes.len() {
            match bytes[i] {
                b'\\' => i += 1,
                b'{' => balance += 1,
                b'}' => balance -= 1,
                _ => {}
            }
            i += 1;
        }
    }
    balance
}

fn rightmost_unescaped_close(text: &str) -> Option<usize> {
    let bytes = text.as_bytes();
    let mut candidate = None;
    let mut i = 0usize;
    while i < bytes.len() {
        match bytes[i] {
            b'\\' => i += 1,
            b'}' => candidate = Some(i),
            _ => {}
        }
        i += 1;
    }
    candidate
}

/// Close every environment the validator still sees open, innermost first,
/// just before `\end{document}`.
fn close_unterminated_environments(text: &str) -> String {
    let report = validate(text);
    let mut open: Vec<(usize, String)> = report
        .issues
        .iter()
        .filter_map(|i| match &i.kind {
            IssueKind::UnclosedEnv(name) if !i.message.contains("\\end") => {
                Some((i.line, name.clone()))
            }
            _ => None,
        })
        .collect();
    if open.is_empty() {
        return text.to_string();
    }
    // Innermost (deepest begin) closes first.
    open.sort_by(|a, b| b.0.cmp(&a.0));
    let mut closers = String::new();
    for (_, name) in &open {
        if name == "document" {
            continue;
        }
        closers.push_str(&format!("\\end{{{name}}}\n"));
    }
    if closers.is_empty() {
        return text.to_string();
    }

    if let Some(pos) = text.rfind("\\end{document}") {
        let mut out = String::with_capacity(text.len() + closers.len());
        out.push_str(&text[..pos]);
        out.push_str(&closers);
        out.push_str(&text[pos..]);
        out
    } else {
        let mut out = text.to_string();
        if !out.ends_with('\n') {
            out.push('\n');
        }
        out.push_str(&closers);
        out
    }
}

fn join_like(reference: &str, lines: Vec<String>) -> String {
    let mut out = lines.join("\n");
    if reference.ends_with('\n') && !out.is_empty() {
        out.push('\n');
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn translated_commands_are_restored() {
        let text = "见 \\引用{smith2020} 和 \\参考{fig:one}。\\章节{方法}\n";
        let fixed = fix_translated_commands(text);
        assert_eq!(fixed, "见 \\cite{smith2020} 和 \\ref{fig:one}。\\section{方法}\n");
    }

    #[test]
    fn unknown_cjk_commands_keep_their_argument() {
        let text = "结果 \\加粗{显著} 以及 \\换行 其余\n";
        let fixed = strip_unknown_cjk_commands(text);
        assert_eq!(fixed, "结果 显著 以及  其余\n");
    }

    #[test]
    fn concatenated_structure_splits() {
        assert_eq!(
            split_concatenated_structure("\\end{itemize}\\item next"),
            "\\end{itemize}\n\\item next"
        );
        assert_eq!(
            split_concatenated_structure("\\end{abstract}\\begin{figure}"),
            "\\end{abstract}\n\\begin{figure}"
        );
        assert_eq!(
            split_concatenated_structure("\\end{figure}\\section{A}"),
            "\\end{figure}\n\n\\section{A}"
        );
    }

    #[test]
    fn unclosed_table_end_gets_brace() {
        assert_eq!(close_unclosed_table_ends("\\end{tabular\n"), "\\end{tabular}\n");
        assert_eq!(
            close_unclosed_table_ends("\\end{table \\caption{x}\n"),
            "\\end{table} \\caption{x}\n"
        );
        assert_eq!(
            close_unclosed_table_ends("\\end{tabular}\n"),
            "\\end{tabular}\n"
        );
        assert_eq!(close_unclosed_table_ends("\\end{table*}\n"), "\\end{table*}\n");
    }

    #[test]
    fn broken_tabular_opener_is_collapsed() {
        let text = "\\begin{tabular}{l|\nc|r}\nrow \\\\\n\\end{tabular}\n";
        let fixed = collapse_broken_tabular_openers(text);
        assert!(fixed.starts_with("\\begin{tabular}{l| c|r}"));
        assert!(fixed.contains("row"));
    }

    #[test]
    fn bare_scripts_get_math_mode() {
        let text = "the value x_2 grows\n";
        let fixed = wrap_bare_scripts(text);
        assert_eq!(fixed, "the value $x_2$ grows\n");

        let math_line = "already $x_2$ here\n";
        assert_eq!(wrap_bare_scripts(math_line), math_line);

        let env = "\\begin{equation}\nx_2\n\\end{equation}\n";
        assert_eq!(wrap_bare_scripts(env), env);
    }

    #[test]
    fn missing_brace_inserted_before_end_document() {
        let text = "\\begin{document}\n\\textbf{bold\n\\end{document}\n";
        let fixed = balance_braces(text);
        assert!(fixed.contains("}\n\\end{document}"));
        assert_eq!(brace_balance(&fixed), 0);
    }

    #[test]
    fn excess_brace_drops_rightmost() {
        let text = "a } b\n";
        let fixed = balance_braces(text);
        assert_eq!(fixed, "a  b\n");
        let escaped = "a \\} b\n";
        assert_eq!(balance_braces(escaped), escaped);
    }

    #[test]
    fn unterminated_environment_closed_before_end_document() {
        let text = "\\documentclass{article}\n\\begin{document}\n\\begin{itemize}\n\\item x\n\\end{document}\n";
        let fixed = close_unterminated_environments(text);
        assert!(fixed.contains("\\end{itemize}\n\\end{document}"));
    }

    #[test]
    fn rule_set_is_confluent() {
        let text = "\\documentclass{article}\n\\begin{document}\n\\章节{引言}\n\\end{itemize}\\item leftover\nvalue x_2 rises\n\\begin{itemize}\n\\item a\n\\textbf{bold\n\\end{document}\n";
        let once = apply_rules_to_text(text, true, true);
        let twice = apply_rules_to_text(&once, true, true);
        assert_eq!(once, twice);
    }

    #[test]
    fn apply_rules_touches_files_on_disk() {
        let dir = tempfile::tempdir().expect("tempdir");
        let main = dir.path().join("main.tex");
        std::fs::write(
            &main,
            "\\documentclass{article}\n\\begin{document}\n\\引用{x}\n\\end{document}\n",
        )
        .expect("write");
        let changed = apply_rules(
            dir.path(),
            Path::new("main.tex"),
            "! Undefined control sequence.\nl.3 \\引用\n",
        )
        .expect("apply");
        assert!(changed);
        let text = std::fs::read_to_string(&main).expect("read");
        assert!(text.contains("\\cite{x}"));
        let changed_again = apply_rules(dir.path(), Path::new("main.tex"), "").expect("apply");
        assert!(!changed_again);
    }
}

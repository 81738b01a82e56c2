use std::collections::HashSet;

use once_cell::sync::Lazy;
use regex::Regex;

use crate::validator::{comment_text, looks_like_prose, strip_comment};

static COMMENTED_ENV_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^(\s*)%\s*(\\(?:begin|end)\{[A-Za-z@]+\*?\}.*)$").expect("commented env regex")
});
static ENV_LINE_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\\(?:begin|end)\{[A-Za-z@]+\*?\}").expect("env line regex"));
static CJKUTF8_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^\s*\\usepackage(\[[^\]]*\])?\{CJKutf8\}").expect("cjkutf8 regex"));
static CJK_ENV_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^\s*\\(?:begin|end)\{CJK\*?\}").expect("cjk env regex"));
static MICROTYPE_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\\usepackage\{microtype\}").expect("microtype regex"));
static DOCUMENTCLASS_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^\s*\\documentclass\b").expect("documentclass regex"));
static TABULAR_OPEN_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\\begin\{tabular\}\{").expect("tabular regex"));
static TRAILING_COMMAND_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\\[A-Za-z]+(?:\[[^\]]*\])?\{[^}]*\}[^%]*$").expect("trailing cmd"));

/// Preamble lines added for LuaLaTeX Chinese output when the document does
/// not already configure CJK fonts.
const LUALATEX_FONT_LINES: &[&str] = &[
    "\\usepackage{fontspec}",
    "\\usepackage{luatexja-fontspec}",
    "\\setmainjfont{Noto Serif CJK SC}",
];

#[derive(Clone, Copy, Debug, Default)]
pub struct PostFixOptions {
    /// Insert `\usepackage{ctex}` after `\documentclass` (main file only).
    pub ensure_ctex: bool,
    /// Add LuaLaTeX font preamble lines when targeting that engine.
    pub lualatex_fonts: bool,
}

/// Reference-based repair of a freshly translated file. The pass order is
/// load-bearing and must not be rearranged:
/// re-uncomment -> package quick fixes -> tabular column spec ->
/// split comments -> merged comments -> Chinese font support.
/// The whole pass is a retraction: applying it to its own output is a
/// no-op.
#[must_use]
pub fn reference_based_post_fix(translated: &str, original: &str, opts: PostFixOptions) -> String {
    let step1 = re_uncomment_environments(translated, original);
    let step2 = package_quick_fixes(&step1);
    let step3 = fix_incomplete_tabular_specs(&step2);
    let step4 = fix_split_comment_lines_in_preamble(&step3);
    let step5 = fix_merged_comment_lines_in_preamble(&step4, original);
    add_chinese_font_support(&step5, opts)
}

/// The LLM occasionally comments out `\begin`/`\end` lines. Restore any the
/// original had live.
fn re_uncomment_environments(translated: &str, original: &str) -> String {
    let original_envs: HashSet<String> = original
        .lines()
        .flat_map(|line| {
            let code = strip_comment(line);
            ENV_LINE_RE
                .find_iter(&code)
                .map(|m| m.as_str().to_string())
                .collect::<Vec<_>>()
        })
        .collect();

    let mut out = Vec::new();
    for line in translated.lines() {
        if let Some(cap) = COMMENTED_ENV_RE.captures(line) {
            let payload = cap[2].to_string();
            let env_token = ENV_LINE_RE
                .find(&payload)
                .map(|m| m.as_str().to_string())
                .unwrap_or_default();
            if original_envs.contains(&env_token) {
                out.push(format!("{}{}", &cap[1], payload));
                continue;
            }
        }
        out.push(line.to_string());
    }
    join_preserving_tail(out, translated)
}

/// CJKutf8 and CJK* conflict with ctex; plain microtype breaks under
/// XeLaTeX. Duplicate bibliography blocks the LLM inlines into the preamble
/// are dropped outright.
fn package_quick_fixes(text: &str) -> String {
    let doc_begin = text
        .lines()
        .position(|l| strip_comment(l).contains("\\begin{document}"));

    let mut out: Vec<String> = Vec::new();
    let mut skipping_bib = false;
    for (idx, line) in text.lines().enumerate() {
        let in_preamble = doc_begin.map(|d| idx < d).unwrap_or(true);

        if in_preamble && skipping_bib {
            if strip_comment(line).contains("\\end{thebibliography}") {
                skipping_bib = false;
            }
            continue;
        }
        if in_preamble && strip_comment(line).contains("\\begin{thebibliography}") {
            skipping_bib = !strip_comment(line).contains("\\end{thebibliography}");
            continue;
        }

        if CJKUTF8_RE.is_match(line) || CJK_ENV_RE.is_match(line) {
            out.push(format!("% {line}"));
            continue;
        }
        out.push(
            MICROTYPE_RE
                .replace_all(line, "\\usepackage[protrusion=false,expansion=false]{microtype}")
                .into_owned(),
        );
    }
    join_preserving_tail(out, text)
}

/// `\begin{tabular}{lcr` missing its closing brace: insert `}` before the
/// first token that cannot belong to a column spec.
fn fix_incomplete_tabular_specs(text: &str) -> String {
    let mut out = Vec::new();
    for line in text.lines() {
        out.push(fix_tabular_line(line));
    }
    join_preserving_tail(out, text)
}

fn fix_tabular_line(line: &str) -> String {
    let Some(m) = TABULAR_OPEN_RE.find(line) else {
        return line.to_string();
    };
    let spec_start = m.end();
    let rest = &line[spec_start..];

    let mut depth: i64 = 1;
    for (off, ch) in rest.char_indices() {
        match ch {
            '{' => depth += 1,
            '}' => {
                depth -= 1;
                if depth == 0 {
                    return line.to_string();
                }
            }
            _ => {}
        }
        // At spec level, anything outside the column alphabet ends the spec.
        if depth == 1 && !is_column_spec_char(ch) {
            let mut fixed = String::with_capacity(line.len() + 1);
            fixed.push_str(&line[..spec_start + off]);
            fixed.push('}');
            fixed.push_str(&line[spec_start + off..]);
            return fixed;
        }
    }
    // Spec ran to end of line unterminated.
    let mut fixed = line.to_string();
    fixed.push('}');
    fixed
}

fn is_column_spec_char(ch: char) -> bool {
    ch.is_ascii_alphanumeric()
        || matches!(ch, '|' | '@' | '!' | '*' | '<' | '>' | '{' | '}' | '.' | ',' | ' ' | '\t')
}

/// Merge a bare `%` line back onto the prose line the translation pushed
/// below it.
fn fix_split_comment_lines_in_preamble(text: &str) -> String {
    let doc_begin = text
        .lines()
        .position(|l| strip_comment(l).contains("\\begin{document}"));
    let lines: Vec<&str> = text.lines().collect();
    let mut out: Vec<String> = Vec::new();
    let mut i = 0usize;
    while i < lines.len() {
        let in_preamble = doc_begin.map(|d| i < d).unwrap_or(true);
        let trimmed = lines[i].trim_end();
        if in_preamble && (trimmed == "%" || trimmed == "% ") {
            if let Some(next) = lines.get(i + 1) {
                let next_trim = next.trim();
                if !next_trim.is_empty()
                    && !next_trim.starts_with('\\')
                    && !next_trim.starts_with('%')
                    && looks_like_prose(next_trim)
                {
                    out.push(format!("% {next_trim}"));
                    i += 2;
                    continue;
                }
            }
        }
        out.push(lines[i].to_string());
        i += 1;
    }
    join_preserving_tail(out, text)
}

/// Split a comment line that swallowed a command the original had live:
/// `% some prose \usepackage{x}` becomes the comment plus the command on
/// its own line.
fn fix_merged_comment_lines_in_preamble(text: &str, original: &str) -> String {
    let doc_begin = text
        .lines()
        .position(|l| strip_comment(l).contains("\\begin{document}"));
    let original_commands: HashSet<String> = original
        .lines()
        .map(|l| strip_comment(l).trim().to_string())
        .filter(|l| l.starts_with('\\'))
        .collect();

    let mut out: Vec<String> = Vec::new();
    for (idx, line) in text.lines().enumerate() {
        let in_preamble = doc_begin.map(|d| idx < d).unwrap_or(true);
        if in_preamble {
            if let Some(comment) = comment_text(line) {
                if let Some(cmd_pos) = TRAILING_COMMAND_RE.find(comment) {
                    let prose = &comment[..cmd_pos.start()];
                    let command = comment[cmd_pos.start()..].trim();
                    if looks_like_prose(prose) && original_commands.contains(command) {
                        let indent: String =
                            line.chars().take_while(|c| c.is_whitespace()).collect();
                        out.push(format!("{indent}%{}", prose.trim_end()));
                        out.push(format!("{indent}{command}"));
                        continue;
                    }
                }
            }
        }
        out.push(line.to_string());
    }
    join_preserving_tail(out, text)
}

/// `ctex` after the first live `\documentclass`, plus LuaLaTeX font lines
/// when requested. Inserting twice is prevented by the presence checks.
fn add_chinese_font_support(text: &str, opts: PostFixOptions) -> String {
    if !opts.ensure_ctex {
        return text.to_string();
    }
    let has_ctex = text
        .lines()
        .any(|l| {
            let code = strip_comment(l);
            code.contains("\\usepackage{ctex}") || code.contains("]{ctex}")
        });
    let has_fontspec = text
        .lines()
        .any(|l| strip_comment(l).contains("\\usepackage{fontspec}"));

    let mut out: Vec<String> = Vec::new();
    let mut inserted = false;
    for line in text.lines() {
        out.push(line.to_string());
        if !inserted && DOCUMENTCLASS_RE.is_match(line) {
            if !has_ctex {
                out.push("\\usepackage{ctex}".to_string());
            }
            if opts.lualatex_fonts && !has_fontspec {
                for font_line in LUALATEX_FONT_LINES {
                    out.push((*font_line).to_string());
                }
            }
            inserted = true;
        }
    }
    join_preserving_tail(out, text)
}

fn join_preserving_tail(lines: Vec<String>, reference: &str) -> String {
    let mut out = lines.join("\n");
    if reference.ends_with('\n') && !out.is_empty() {
        out.push('\n');
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    const OPTS: PostFixOptions = PostFixOptions {
        ensure_ctex: true,
        lualatex_fonts: false,
    };

    #[test]
    fn re_uncomments_environments_present_in_original() {
        let original = "\\begin{itemize}\n\\item x\n\\end{itemize}\n";
        let translated = "% \\begin{itemize}\n\\item 某项\n\\end{itemize}\n";
        let fixed = reference_based_post_fix(translated, original, PostFixOptions::default());
        assert!(fixed.starts_with("\\begin{itemize}"));
    }

    #[test]
    fn keeps_comments_the_original_also_had() {
        let original = "% \\begin{itemize}\ntext\n";
        let translated = "% \\begin{itemize}\n文本\n";
        let fixed = reference_based_post_fix(translated, original, PostFixOptions::default());
        assert!(fixed.starts_with("% \\begin{itemize}"));
    }

    #[test]
    fn comments_out_cjkutf8_and_cjk_envs() {
        let original = "\\documentclass{article}\n\\usepackage{CJKutf8}\n\\begin{document}\n\\begin{CJK*}\nx\n\\end{CJK*}\n\\end{document}\n";
        let fixed = reference_based_post_fix(original, original, OPTS);
        assert!(fixed.contains("% \\usepackage{CJKutf8}"));
        assert!(fixed.contains("% \\begin{CJK*}"));
        assert!(fixed.contains("% \\end{CJK*}"));
    }

    #[test]
    fn microtype_gets_safe_options() {
        let original = "\\documentclass{article}\n\\usepackage{microtype}\n\\begin{document}\nx\n\\end{document}\n";
        let fixed = reference_based_post_fix(original, original, OPTS);
        assert!(fixed.contains("\\usepackage[protrusion=false,expansion=false]{microtype}"));
    }

    #[test]
    fn preamble_bibliography_is_dropped() {
        let translated = "\\documentclass{article}\n\\begin{thebibliography}{9}\n\\bibitem{a} A.\n\\end{thebibliography}\n\\begin{document}\nx\n\\end{document}\n";
        let fixed = reference_based_post_fix(translated, translated, OPTS);
        assert!(!fixed.contains("thebibliography"));
        assert!(fixed.contains("\\begin{document}"));
    }

    #[test]
    fn incomplete_tabular_spec_is_closed() {
        assert_eq!(
            fix_tabular_line("\\begin{tabular}{lcr"),
            "\\begin{tabular}{lcr}"
        );
        assert_eq!(
            fix_tabular_line("\\begin{tabular}{l|c \\hline"),
            "\\begin{tabular}{l|c }\\hline"
        );
        assert_eq!(
            fix_tabular_line("\\begin{tabular}{p{2cm}r}"),
            "\\begin{tabular}{p{2cm}r}"
        );
    }

    #[test]
    fn split_comment_is_rejoined() {
        let translated = "\\documentclass{article}\n%\nthe following packages are recommended\n\\begin{document}\nx\n\\end{document}\n";
        let fixed = reference_based_post_fix(translated, translated, PostFixOptions::default());
        assert!(fixed.contains("% the following packages are recommended"));
        assert!(!fixed.contains("\n%\n"));
    }

    #[test]
    fn merged_comment_is_split_when_original_had_command_live() {
        let original = "\\documentclass{article}\n% load graphics support below.\n\\usepackage{graphicx}\n\\begin{document}\nx\n\\end{document}\n";
        let translated = "\\documentclass{article}\n% load graphics support below. \\usepackage{graphicx}\n\\begin{document}\nx\n\\end{document}\n";
        let fixed = reference_based_post_fix(translated, original, PostFixOptions::default());
        assert!(fixed.contains("% load graphics support below."));
        assert!(fixed.contains("\n\\usepackage{graphicx}\n"));
    }

    #[test]
    fn ctex_inserted_after_documentclass_once() {
        let original = "\\documentclass{article}\n\\begin{document}\nx\n\\end{document}\n";
        let once = reference_based_post_fix(original, original, OPTS);
        assert!(once.contains("\\documentclass{article}\n\\usepackage{ctex}"));
        let twice = reference_based_post_fix(&once, original, OPTS);
        assert_eq!(once, twice);
    }

    #[test]
    fn post_fix_is_a_retraction() {
        let original = "\\documentclass{article}\n\\usepackage{microtype}\n\\begin{document}\n%\nsome recommended packages are listed\n\\begin{tabular}{lc\nx\n\\end{tabular}\n\\end{document}\n";
        let once = reference_based_post_fix(original, original, OPTS);
        let twice = reference_based_post_fix(&once, original, OPTS);
        assert_eq!(once, twice);
    }

    #[test]
    fn lualatex_fonts_added_when_requested() {
        let original = "\\documentclass{article}\n\\begin{document}\nx\n\\end{document}\n";
        let opts = PostFixOptions {
            ensure_ctex: true,
            lualatex_fonts: true,
        };
        let fixed = reference_based_post_fix(original, original, opts);
        assert!(fixed.contains("\\usepackage{fontspec}"));
        let again = reference_based_post_fix(&fixed, original, opts);
        assert_eq!(fixed, again);
    }
}

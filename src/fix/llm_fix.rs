use std::collections::BTreeSet;
use std::path::Path;

use once_cell::sync::Lazy;
use regex::Regex;

use crate::llm::LlmClient;
use crate::textenc;
use crate::trace::TraceWriter;
use crate::translate::{clean_llm_reply, render_template, PromptCatalog};

use super::latexlog::extract_log_issues;

static SECTION_FENCE_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^=== SECTION: lines (\d+)-(\d+) ===\s*$").expect("fence regex"));

/// Whole-file or windowed repair through the model. Small files go up in
/// one piece; large files send only windows around the reported error
/// lines, fenced so the reply can be merged back by exact line range.
pub struct LlmFixer<'a> {
    llm: &'a dyn LlmClient,
    prompts: &'a PromptCatalog,
    max_bytes: usize,
    trace: &'a TraceWriter,
}

impl<'a> LlmFixer<'a> {
    #[must_use]
    pub fn new(
        llm: &'a dyn LlmClient,
        prompts: &'a PromptCatalog,
        max_bytes: usize,
        trace: &'a TraceWriter,
    ) -> Self {
        Self {
            llm,
            prompts,
            max_bytes: max_bytes.max(1024),
            trace,
        }
    }

    /// Returns whether the file changed on disk.
    pub fn fix_file(&self, path: &Path, log: &str) -> anyhow::Result<bool> {
        let text = textenc::read_text(path)?;
        let errors = error_summary(log);

        let fixed = if text.len() <= self.max_bytes {
            self.fix_whole(&text, &errors)?
        } else {
            self.fix_sections(&text, log, &errors)?
        };

        let Some(fixed) = fixed else {
            return Ok(false);
        };
        if fixed == text {
            return Ok(false);
        }
        textenc::write_text(path, &fixed)?;
        Ok(true)
    }

    fn fix_whole(&self, text: &str, errors: &str) -> anyhow::Result<Option<String>> {
        let prompt = render_template(
            &self.prompts.fix_whole,
            &[("errors", errors), ("source", text)],
        );
        let _ = self.trace.write_named_text("llm_fix.whole.prompt.txt", &prompt);
        let reply = clean_llm_reply(&self.llm.chat(&prompt)?);
        let _ = self.trace.write_named_text("llm_fix.whole.reply.txt", &reply);

        // A reply that lost most of the document is worse than the error.
        let original_lines = text.lines().count().max(1);
        if reply.trim().is_empty() || reply.lines().count() * 2 < original_lines {
            return Ok(None);
        }
        Ok(Some(ensure_trailing_newline(reply, text)))
    }

    fn fix_sections(&self, text: &str, log: &str, errors: &str) -> anyhow::Result<Option<String>> {
        let lines: Vec<&str> = text.lines().collect();
        let windows = error_windows(log, lines.len(), self.max_bytes);
        if windows.is_empty() {
            return Ok(None);
        }

        let mut sections = String::new();
        for (a, b) in &windows {
            sections.push_str(&format!("=== SECTION: lines {a}-{b} ===\n"));
            for line in &lines[a - 1..=b - 1] {
                sections.push_str(line);
                sections.push('\n');
            }
        }

        let prompt = render_template(
            &self.prompts.fix_section,
            &[("errors", errors), ("sections", &sections)],
        );
        let _ = self
            .trace
            .write_named_text("llm_fix.sections.prompt.txt", &prompt);
        let reply = clean_llm_reply(&self.llm.chat(&prompt)?);
        let _ = self
            .trace
            .write_named_text("llm_fix.sections.reply.txt", &reply);

        let expected: BTreeSet<(usize, usize)> = windows.iter().copied().collect();
        let replacements = parse_sections(&reply, &expected, lines.len());
        if replacements.is_empty() {
            return Ok(None);
        }

        // Splice back bottom-up so earlier ranges keep their numbering.
        let mut new_lines: Vec<String> = lines.iter().map(|l| (*l).to_string()).collect();
        let mut ordered: Vec<((usize, usize), Vec<String>)> = replacements.into_iter().collect();
        ordered.sort_by(|x, y| y.0 .0.cmp(&x.0 .0));
        for ((a, b), body) in ordered {
            new_lines.splice(a - 1..=b - 1, body);
        }
        Ok(Some(ensure_trailing_newline(new_lines.join("\n"), text)))
    }
}

/// Human-oriented error digest passed into the prompts.
fn error_summary(log: &str) -> String {
    let issues = extract_log_issues(log);
    if issues.is_empty() {
        return "(无法从日志提取错误)".to_string();
    }
    let mut out = String::new();
    for issue in issues.iter().take(20) {
        match issue.line {
            Some(n) => out.push_str(&format!("- 第 {n} 行: {}\n", issue.message)),
            None => out.push_str(&format!("- {}\n", issue.message)),
        }
    }
    out.trim_end().to_string()
}

/// Windows of `context` lines around each error line, merged when they
/// overlap. `context_lines_per_error = clamp(max_bytes / (errors * 100),
/// 10, 50)`.
fn error_windows(log: &str, line_count: usize, max_bytes: usize) -> Vec<(usize, usize)> {
    let issues = extract_log_issues(log);
    let error_lines: Vec<usize> = issues
        .iter()
        .filter_map(|i| i.line)
        .filter(|n| *n >= 1 && *n <= line_count)
        .collect();
    if error_lines.is_empty() {
        return Vec::new();
    }
    let context = (max_bytes / (error_lines.len() * 100)).clamp(10, 50);

    let mut windows: Vec<(usize, usize)> = Vec::new();
    for line in error_lines {
        let a = line.saturating_sub(context).max(1);
        let b = (line + context).min(line_count);
        match windows.last_mut() {
            Some((_, last_b)) if a <= *last_b + 1 => *last_b = (*last_b).max(b),
            _ => windows.push((a, b)),
        }
    }
    windows
}

/// Parse the reply's fenced sections. A section whose range was never
/// requested, is inverted, or exceeds the file is dropped.
fn parse_sections(
    reply: &str,
    expected: &BTreeSet<(usize, usize)>,
    line_count: usize,
) -> Vec<((usize, usize), Vec<String>)> {
    let mut out: Vec<((usize, usize), Vec<String>)> = Vec::new();
    let mut current: Option<((usize, usize), Vec<String>)> = None;

    for line in reply.lines() {
        if let Some(cap) = SECTION_FENCE_RE.captures(line) {
            if let Some(done) = current.take() {
                out.push(done);
            }
            let a: usize = cap[1].parse().unwrap_or(0);
            let b: usize = cap[2].parse().unwrap_or(0);
            let valid = a >= 1 && b >= a && b <= line_count && expected.contains(&(a, b));
            current = valid.then_some(((a, b), Vec::new()));
            continue;
        }
        if let Some((_, body)) = current.as_mut() {
            body.push(line.to_string());
        }
    }
    if let Some(done) = current.take() {
        out.push(done);
    }

    // Trailing blank lines in a section body are fence artifacts.
    for (_, body) in &mut out {
        while body.last().map(|l| l.trim().is_empty()).unwrap_or(false) {
            body.pop();
        }
    }
    out.retain(|(_, body)| !body.is_empty());
    out
}

fn ensure_trailing_newline(mut text: String, reference: &str) -> String {
    if reference.ends_with('\n') && !text.ends_with('\n') {
        text.push('\n');
    }
    text
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
                .unwrap_or_default();
            Ok(LlmReply {
                text,
                tokens_used: 1,
            })
        }
    }

    #[test]
    fn whole_file_fix_replaces_content() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("main.tex");
        std::fs::write(&path, "broken line one\nbroken line two\n").expect("write");

        let llm = ScriptedLlm::new(vec!["fixed line one\nfixed line two"]);
        let prompts = PromptCatalog::default();
        let trace = TraceWriter::disabled();
        let fixer = LlmFixer::new(&llm, &prompts, 10_000, &trace);
        let changed = fixer
            .fix_file(&path, "! LaTeX Error: broken.\nl.1 broken line one\n")
            .expect("fix");
        assert!(changed);
        assert_eq!(
            std::fs::read_to_string(&path).expect("read"),
            "fixed line one\nfixed line two\n"
        );
    }

    #[test]
    fn truncated_whole_file_reply_is_rejected() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("main.tex");
        let original = "l1\nl2\nl3\nl4\nl5\nl6\n";
        std::fs::write(&path, original).expect("write");

        let llm = ScriptedLlm::new(vec!["just one line"]);
        let prompts = PromptCatalog::default();
        let trace = TraceWriter::disabled();
        let fixer = LlmFixer::new(&llm, &prompts, 10_000, &trace);
        let changed = fixer.fix_file(&path, "! LaTeX Error: x\n").expect("fix");
        assert!(!changed);
        assert_eq!(std::fs::read_to_string(&path).expect("read"), original);
    }

    #[test]
    fn windows_merge_and_clamp() {
        let log = "! LaTeX Error: a\nl.100\n! LaTeX Error: b\nl.110\n";
        let windows = error_windows(log, 1000, 4000);
        // context = clamp(4000/200, 10, 50) = 20 -> [80,120] and [90,130] merge.
        assert_eq!(windows, vec![(80, 130)]);
    }

    #[test]
    fn sectioned_fix_merges_by_exact_range() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("main.tex");
        let mut body = String::new();
        for i in 1..=200 {
            body.push_str(&format!("line number {i} with some padding text\n"));
        }
        std::fs::write(&path, &body).expect("write");

        let log = "! LaTeX Error: bad.\nl.100\n";
        // max_bytes small so the file takes the sectioned path; context =
        // clamp(2000/100, 10, 50) = 20 -> window (80,120).
        let mut reply = String::from("=== SECTION: lines 80-120 ===\n");
        for i in 80..=120 {
            reply.push_str(&format!("fixed line {i}\n"));
        }
        // An uninvited section must be ignored.
        reply.push_str("=== SECTION: lines 1-5 ===\nmalicious\n");

        let llm = ScriptedLlm::new(vec![&reply]);
        let prompts = PromptCatalog::default();
        let trace = TraceWriter::disabled();
        let fixer = LlmFixer::new(&llm, &prompts, 2000, &trace);
        let changed = fixer.fix_file(&path, log).expect("fix");
        assert!(changed);

        let text = std::fs::read_to_string(&path).expect("read");
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines.len(), 200);
        assert_eq!(lines[78], "line number 79 with some padding text");
        assert_eq!(lines[79], "fixed line 80");
        assert_eq!(lines[119], "fixed line 120");
        assert_eq!(lines[120], "line number 121 with some padding text");
        assert_eq!(lines[0], "line number 1 with some padding text");
    }

    #[test]
    fn invalid_ranges_are_dropped() {
        let expected: BTreeSet<(usize, usize)> = [(10, 20)].into_iter().collect();
        let reply = "=== SECTION: lines 20-10 ===\nx\n=== SECTION: lines 10-20 ===\nok\n";
        let parsed = parse_sections(reply, &expected, 100);
        assert_eq!(parsed.len(), 1);
        assert_eq!(parsed[0].0, (10, 20));
        assert_eq!(parsed[0].1, vec!["ok".to_string()]);
    }
}

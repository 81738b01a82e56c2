use std::path::Path;

use crate::progress::ConsoleProgress;
use crate::project::list_tex_files;
use crate::textenc;

/// One-shot normalization pass over every `.tex` in the tree before the
/// original compile: UTF-8 conversion plus known-safe scrubs. Best-effort;
/// a file that resists normalization is logged and left alone.
pub fn preprocess_tree(extract_dir: &Path, progress: &ConsoleProgress) {
    for rel in list_tex_files(extract_dir) {
        let abs = extract_dir.join(&rel);
        if let Err(e) = preprocess_file(&abs) {
            progress.warn(format!("预处理跳过 {}: {e:#}", rel.display()));
        }
    }
}

fn preprocess_file(path: &Path) -> anyhow::Result<()> {
    textenc::ensure_utf8(path)?;
    let text = textenc::read_text(path)?;
    let scrubbed = scrub(&text);
    if scrubbed != text {
        textenc::write_text(path, &scrubbed)?;
    }
    Ok(())
}

/// Known-safe text repairs: CR-only line endings become LF, stray mid-line
/// carriage returns disappear.
#[must_use]
pub fn scrub(text: &str) -> String {
    if !text.contains('\r') {
        return text.to_string();
    }
    let mut out = String::with_capacity(text.len());
    let mut chars = text.chars().peekable();
    while let Some(ch) = chars.next() {
        if ch == '\r' {
            match chars.peek() {
                // CRLF is a convention, not damage; leave it for the
                // line editor's newline handling.
                Some('\n') => {
                    out.push('\r');
                }
                // CR-only newline (classic Mac) or stray ^M mid-line.
                Some(_) => out.push('\n'),
                None => out.push('\n'),
            }
        } else {
            out.push(ch);
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cr_only_becomes_lf() {
        assert_eq!(scrub("a\rb\rc"), "a\nb\nc");
        assert_eq!(scrub("a\r"), "a\n");
    }

    #[test]
    fn crlf_is_preserved() {
        assert_eq!(scrub("a\r\nb\r\n"), "a\r\nb\r\n");
    }

    #[test]
    fn clean_text_is_untouched() {
        assert_eq!(scrub("a\nb\n"), "a\nb\n");
    }

    #[test]
    fn preprocess_converts_gbk_file() {
        let dir = tempfile::tempdir().expect("tempdir");
        let p = dir.path().join("a.tex");
        std::fs::write(&p, [0xD6, 0xD0, b'\r', b'x']).expect("write");
        preprocess_file(&p).expect("preprocess");
        assert_eq!(std::fs::read_to_string(&p).expect("read"), "中\nx");
    }
}

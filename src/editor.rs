use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use anyhow::Context;
use regex::Regex;

use crate::backup::{BackupEntry, BackupManager};
use crate::textenc::{self, DetectedEncoding};

#[derive(Debug, thiserror::Error)]
pub enum EditorError {
    #[error("line range {a}..={b} out of range (file has {count} lines)")]
    OutOfRange { a: usize, b: usize, count: usize },

    #[error("file is not UTF-8: {}", .0.display())]
    EncodingNotUtf8(PathBuf),

    #[error("file is locked by another edit session: {}", .0.display())]
    Locked(PathBuf),

    #[error(transparent)]
    Io(#[from] anyhow::Error),
}

pub type EditResult<T> = std::result::Result<T, EditorError>;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Newline {
    Lf,
    CrLf,
}

impl Newline {
    fn as_str(&self) -> &'static str {
        match self {
            Self::Lf => "\n",
            Self::CrLf => "\r\n",
        }
    }
}

/// Line-addressed editing session over one UTF-8 file. Line numbers are
/// 1-based and ranges are inclusive. The first mutation snapshots the file
/// through the backup manager; every mutation is flushed atomically and the
/// original newline convention is preserved.
pub struct LineEditor<'a> {
    path: PathBuf,
    lock_path: PathBuf,
    lines: Vec<String>,
    newline: Newline,
    trailing_newline: bool,
    backups: &'a BackupManager,
    session_backup: Option<BackupEntry>,
    mutations: usize,
}

impl<'a> LineEditor<'a> {
    pub fn open(path: &Path, backups: &'a BackupManager) -> EditResult<Self> {
        let detected = textenc::detect(path).map_err(EditorError::Io)?;
        if detected != DetectedEncoding::Utf8 {
            return Err(EditorError::EncodingNotUtf8(path.to_path_buf()));
        }

        let lock_path = lock_path_for(path);
        match fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&lock_path)
        {
            Ok(mut f) => {
                let _ = writeln!(f, "{}", std::process::id());
            }
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
                return Err(EditorError::Locked(path.to_path_buf()));
            }
            Err(e) => {
                return Err(EditorError::Io(
                    anyhow::Error::from(e).context(format!("lock: {}", lock_path.display())),
                ));
            }
        }

        let text = match fs::read_to_string(path) {
            Ok(t) => t,
            Err(e) => {
                let _ = fs::remove_file(&lock_path);
                return Err(EditorError::Io(
                    anyhow::Error::from(e).context(format!("read: {}", path.display())),
                ));
            }
        };
        let newline = if text.contains("\r\n") {
            Newline::CrLf
        } else {
            Newline::Lf
        };
        let trailing_newline = text.ends_with('\n') || text.is_empty();
        let lines: Vec<String> = text
            .split('\n')
            .map(|l| l.strip_suffix('\r').unwrap_or(l).to_string())
            .collect();
        // split() leaves one empty trailing element when the file ends in \n.
        let mut lines = lines;
        if trailing_newline && !text.is_empty() {
            lines.pop();
        }

        Ok(Self {
            path: path.to_path_buf(),
            lock_path,
            lines,
            newline,
            trailing_newline,
            backups,
            session_backup: None,
            mutations: 0,
        })
    }

    #[must_use]
    pub fn count_lines(&self) -> usize {
        self.lines.len()
    }

    #[must_use]
    pub fn mutation_count(&self) -> usize {
        self.mutations
    }

    pub fn read_lines(&self, a: usize, b: usize) -> EditResult<Vec<String>> {
        self.check_range(a, b)?;
        Ok(self.lines[a - 1..=b - 1].to_vec())
    }

    pub fn replace_line(&mut self, n: usize, text: &str) -> EditResult<()> {
        self.replace_lines(n, n, &[text.to_string()])
    }

    pub fn replace_lines(&mut self, a: usize, b: usize, lines: &[String]) -> EditResult<()> {
        self.check_range(a, b)?;
        self.before_mutation()?;
        let replacement = split_incoming(lines);
        self.lines.splice(a - 1..=b - 1, replacement);
        self.flush()
    }

    /// Insert before line `n`; `n == count_lines() + 1` appends.
    pub fn insert_line(&mut self, n: usize, text: &str) -> EditResult<()> {
        if n == 0 || n > self.lines.len() + 1 {
            return Err(EditorError::OutOfRange {
                a: n,
                b: n,
                count: self.lines.len(),
            });
        }
        self.before_mutation()?;
        let incoming = split_incoming(&[text.to_string()]);
        self.lines.splice(n - 1..n - 1, incoming);
        self.flush()
    }

    pub fn delete_line(&mut self, n: usize) -> EditResult<()> {
        self.check_range(n, n)?;
        self.before_mutation()?;
        self.lines.remove(n - 1);
        self.flush()
    }

    /// 1-based numbers of lines matching `pattern`.
    pub fn search(&self, pattern: &Regex) -> Vec<usize> {
        self.lines
            .iter()
            .enumerate()
            .filter(|(_, line)| pattern.is_match(line))
            .map(|(i, _)| i + 1)
            .collect()
    }

    /// Roll back everything since the session's first mutation. The file on
    /// disk becomes byte-identical to its pre-session state.
    pub fn rollback(&mut self) -> EditResult<()> {
        if let Some(entry) = self.session_backup.take() {
            self.backups.restore(&entry).map_err(EditorError::Io)?;
            let _ = self.backups.remove(&entry);
            self.refresh()?;
        }
        Ok(())
    }

    /// Accept the session's edits and drop the snapshot.
    pub fn commit(&mut self) -> EditResult<()> {
        if let Some(entry) = self.session_backup.take() {
            let _ = self.backups.remove(&entry);
        }
        Ok(())
    }

    /// Re-read the file after an out-of-band change (restore, external fix).
    pub fn refresh(&mut self) -> EditResult<()> {
        let text = fs::read_to_string(&self.path)
            .with_context(|| format!("read: {}", self.path.display()))
            .map_err(EditorError::Io)?;
        self.trailing_newline = text.ends_with('\n') || text.is_empty();
        let mut lines: Vec<String> = text
            .split('\n')
            .map(|l| l.strip_suffix('\r').unwrap_or(l).to_string())
            .collect();
        if self.trailing_newline && !text.is_empty() {
            lines.pop();
        }
        self.lines = lines;
        Ok(())
    }

    fn check_range(&self, a: usize, b: usize) -> EditResult<()> {
        if a == 0 || b < a || b > self.lines.len() {
            return Err(EditorError::OutOfRange {
                a,
                b,
                count: self.lines.len(),
            });
        }
        Ok(())
    }

    fn before_mutation(&mut self) -> EditResult<()> {
        if self.session_backup.is_none() {
            let entry = self.backups.create(&self.path).map_err(EditorError::Io)?;
            self.session_backup = Some(entry);
        }
        self.mutations += 1;
        Ok(())
    }

    fn flush(&self) -> EditResult<()> {
        let nl = self.newline.as_str();
        let mut out = self.lines.join(nl);
        if self.trailing_newline && !self.lines.is_empty() {
            out.push_str(nl);
        }
        textenc::write_text(&self.path, &out).map_err(EditorError::Io)
    }
}

impl Drop for LineEditor<'_> {
    fn drop(&mut self) {
        let _ = fs::remove_file(&self.lock_path);
    }
}

fn lock_path_for(path: &Path) -> PathBuf {
    let name = path
        .file_name()
        .and_then(|s| s.to_str())
        .unwrap_or("file");
    path.with_file_name(format!(".{name}.editlock"))
}

/// Incoming text may itself contain newlines; normalize to logical lines.
fn split_incoming(lines: &[String]) -> Vec<String> {
    let mut out = Vec::with_capacity(lines.len());
    for line in lines {
        for part in line.split('\n') {
            out.push(part.strip_suffix('\r').unwrap_or(part).to_string());
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn setup(content: &str) -> (tempfile::TempDir, PathBuf, BackupManager) {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("main.tex");
        fs::write(&path, content).expect("write");
        (dir, path, BackupManager::new())
    }

    #[test]
    fn read_and_replace_are_one_based_inclusive() {
        let (_d, path, backups) = setup("alpha\nbeta\ngamma\n");
        let mut ed = LineEditor::open(&path, &backups).expect("open");
        assert_eq!(ed.count_lines(), 3);
        assert_eq!(ed.read_lines(2, 3).expect("read"), vec!["beta", "gamma"]);
        ed.replace_line(2, "BETA").expect("replace");
        assert_eq!(fs::read_to_string(&path).expect("read"), "alpha\nBETA\ngamma\n");
    }

    #[test]
    fn out_of_range_is_rejected() {
        let (_d, path, backups) = setup("one\n");
        let mut ed = LineEditor::open(&path, &backups).expect("open");
        assert!(matches!(
            ed.read_lines(1, 2),
            Err(EditorError::OutOfRange { .. })
        ));
        assert!(matches!(
            ed.delete_line(0),
            Err(EditorError::OutOfRange { .. })
        ));
    }

    #[test]
    fn crlf_convention_is_preserved() {
        let (_d, path, backups) = setup("a\r\nb\r\n");
        let mut ed = LineEditor::open(&path, &backups).expect("open");
        ed.insert_line(2, "mid").expect("insert");
        assert_eq!(
            fs::read_to_string(&path).expect("read"),
            "a\r\nmid\r\nb\r\n"
        );
    }

    #[test]
    fn first_mutation_snapshots_and_rollback_restores_bytes() {
        let (_d, path, backups) = setup("a\nb\nc\n");
        let before = fs::read(&path).expect("read");
        let mut ed = LineEditor::open(&path, &backups).expect("open");
        ed.delete_line(1).expect("delete");
        ed.replace_line(1, "zzz").expect("replace");
        ed.rollback().expect("rollback");
        assert_eq!(fs::read(&path).expect("read"), before);
        assert_eq!(ed.count_lines(), 3);
    }

    #[test]
    fn second_open_is_locked() {
        let (_d, path, backups) = setup("a\n");
        let _ed = LineEditor::open(&path, &backups).expect("open");
        assert!(matches!(
            LineEditor::open(&path, &backups),
            Err(EditorError::Locked(_))
        ));
    }

    #[test]
    fn lock_released_on_drop() {
        let (_d, path, backups) = setup("a\n");
        {
            let _ed = LineEditor::open(&path, &backups).expect("open");
        }
        let _ed2 = LineEditor::open(&path, &backups).expect("reopen");
    }

    #[test]
    fn non_utf8_is_rejected() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("g.tex");
        fs::write(&path, [0xD6, 0xD0]).expect("write");
        let backups = BackupManager::new();
        assert!(matches!(
            LineEditor::open(&path, &backups),
            Err(EditorError::EncodingNotUtf8(_))
        ));
    }

    #[test]
    fn search_returns_line_numbers() {
        let (_d, path, backups) = setup("x\n\\section{A}\ny\n\\section{B}\n");
        let ed = LineEditor::open(&path, &backups).expect("open");
        let re = Regex::new(r"\\section").expect("regex");
        assert_eq!(ed.search(&re), vec![2, 4]);
    }
}

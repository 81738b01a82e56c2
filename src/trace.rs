use std::path::{Path, PathBuf};

use anyhow::Context;

/// Writes per-run prompt/response/log snapshots for offline debugging.
/// Disabled instances swallow writes.
pub struct TraceWriter {
    dir: PathBuf,
    enabled: bool,
}

impl TraceWriter {
    pub fn new(dir: PathBuf, enabled: bool) -> anyhow::Result<Self> {
        if enabled {
            std::fs::create_dir_all(&dir)
                .with_context(|| format!("create trace dir: {}", dir.display()))?;
        }
        Ok(Self { dir, enabled })
    }

    #[must_use]
    pub fn disabled() -> Self {
        Self {
            dir: PathBuf::new(),
            enabled: false,
        }
    }

    #[must_use]
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn write_named_text(&self, name: &str, text: &str) -> anyhow::Result<()> {
        if !self.enabled {
            return Ok(());
        }
        let path = self.dir.join(sanitize_filename(name));
        std::fs::write(&path, text).with_context(|| format!("write trace: {}", path.display()))?;
        Ok(())
    }

    pub fn write_chunk_text(
        &self,
        file_tag: &str,
        ordinal: usize,
        kind: &str,
        text: &str,
    ) -> anyhow::Result<()> {
        if !self.enabled {
            return Ok(());
        }
        let name = format!("{file_tag}.chunk_{ordinal:04}.{kind}.txt");
        self.write_named_text(&name, text)
    }
}

fn sanitize_filename(name: &str) -> String {
    let mut out = String::with_capacity(name.len());
    for ch in name.chars() {
        match ch {
            '/' | '\\' | ':' | '*' | '?' | '"' | '<' | '>' | '|' => out.push('_'),
            _ => out.push(ch),
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn disabled_writer_is_silent() {
        let w = TraceWriter::disabled();
        w.write_named_text("x.txt", "y").expect("noop");
    }

    #[test]
    fn chunk_names_are_sanitized() {
        let dir = tempfile::tempdir().expect("tempdir");
        let w = TraceWriter::new(dir.path().to_path_buf(), true).expect("writer");
        w.write_chunk_text("sec/intro.tex", 3, "prompt", "hello")
            .expect("write");
        assert!(dir.path().join("sec_intro.tex.chunk_0003.prompt.txt").is_file());
    }
}

use std::fs;
use std::fs::File;
use std::io::{BufReader, BufWriter, Read, Write};
use std::path::Path;

use anyhow::Context;
use encoding_rs::{Decoder, GBK, UTF_16BE, UTF_16LE, UTF_8};

use crate::error::{EncodingErrorKind, PipelineError};

/// Encodings the pipeline recognizes on disk. Everything is normalized to
/// BOM-less UTF-8 before any higher layer touches the content.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DetectedEncoding {
    Utf8,
    Utf8Bom,
    Utf16Le,
    Utf16Be,
    Gbk,
}

impl DetectedEncoding {
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Utf8 => "utf-8",
            Self::Utf8Bom => "utf-8-bom",
            Self::Utf16Le => "utf-16-le",
            Self::Utf16Be => "utf-16-be",
            Self::Gbk => "gbk",
        }
    }

    #[must_use]
    pub fn is_clean_utf8(&self) -> bool {
        matches!(self, Self::Utf8)
    }
}

const UTF8_BOM: [u8; 3] = [0xEF, 0xBB, 0xBF];
const STREAM_THRESHOLD: u64 = 1024 * 1024;
const STREAM_BUF: usize = 64 * 1024;

/// Sniff the encoding of a file. UTF-16 is only recognized by BOM; a file
/// that fails UTF-8 validation falls back to the GBK heuristic.
pub fn detect(path: &Path) -> anyhow::Result<DetectedEncoding> {
    let mut f = File::open(path).with_context(|| format!("open: {}", path.display()))?;
    let mut head = [0u8; 4];
    let n = f.read(&mut head).context("read head")?;

    if n >= 2 {
        if head[0] == 0xFF && head[1] == 0xFE {
            return Ok(DetectedEncoding::Utf16Le);
        }
        if head[0] == 0xFE && head[1] == 0xFF {
            return Ok(DetectedEncoding::Utf16Be);
        }
    }
    if n >= 3 && head[..3] == UTF8_BOM {
        return Ok(DetectedEncoding::Utf8Bom);
    }

    if valid_utf8_file(path)? {
        Ok(DetectedEncoding::Utf8)
    } else {
        Ok(DetectedEncoding::Gbk)
    }
}

fn valid_utf8_file(path: &Path) -> anyhow::Result<bool> {
    let len = fs::metadata(path)
        .with_context(|| format!("stat: {}", path.display()))?
        .len();
    if len > STREAM_THRESHOLD {
        let f = File::open(path).with_context(|| format!("open: {}", path.display()))?;
        let mut reader = BufReader::new(f);
        let mut decoder = UTF_8.new_decoder_without_bom_handling();
        return Ok(stream_is_clean(&mut reader, &mut decoder)?);
    }
    let bytes = fs::read(path).with_context(|| format!("read: {}", path.display()))?;
    Ok(std::str::from_utf8(&bytes).is_ok())
}

fn stream_is_clean(reader: &mut impl Read, decoder: &mut Decoder) -> anyhow::Result<bool> {
    let mut inbuf = vec![0u8; STREAM_BUF];
    let mut outbuf = vec![0u8; STREAM_BUF * 2];
    loop {
        let n = reader.read(&mut inbuf).context("read chunk")?;
        let last = n == 0;
        let mut consumed = 0usize;
        loop {
            let (result, read, _written, had_errors) =
                decoder.decode_to_utf8(&inbuf[consumed..n], &mut outbuf, last);
            if had_errors {
                return Ok(false);
            }
            consumed += read;
            match result {
                encoding_rs::CoderResult::InputEmpty => break,
                encoding_rs::CoderResult::OutputFull => continue,
            }
        }
        if last {
            return Ok(true);
        }
    }
}

/// Convert a file to BOM-less UTF-8 in place, preserving permissions.
/// Idempotent: a clean UTF-8 file is left byte-identical.
pub fn ensure_utf8(path: &Path) -> anyhow::Result<DetectedEncoding> {
    let detected = detect(path)?;
    if detected.is_clean_utf8() {
        return Ok(detected);
    }

    let len = fs::metadata(path)
        .with_context(|| format!("stat: {}", path.display()))?
        .len();
    if len > STREAM_THRESHOLD {
        convert_streaming(path, detected)?;
    } else {
        let bytes = fs::read(path).with_context(|| format!("read: {}", path.display()))?;
        let text = decode_bytes(&bytes, detected)?;
        write_preserving_permissions(path, text.as_bytes())?;
    }
    Ok(detected)
}

fn decode_bytes(bytes: &[u8], detected: DetectedEncoding) -> anyhow::Result<String> {
    let (text, had_errors) = match detected {
        DetectedEncoding::Utf8 => (String::from_utf8_lossy(bytes).into_owned(), false),
        DetectedEncoding::Utf8Bom => {
            let body = bytes.strip_prefix(&UTF8_BOM[..]).unwrap_or(bytes);
            match std::str::from_utf8(body) {
                Ok(s) => (s.to_string(), false),
                Err(_) => (String::new(), true),
            }
        }
        DetectedEncoding::Utf16Le => {
            let (cow, _, bad) = UTF_16LE.decode(bytes);
            (strip_leading_bom_char(&cow), bad)
        }
        DetectedEncoding::Utf16Be => {
            let (cow, _, bad) = UTF_16BE.decode(bytes);
            (strip_leading_bom_char(&cow), bad)
        }
        DetectedEncoding::Gbk => {
            let (cow, _, bad) = GBK.decode(bytes);
            (cow.into_owned(), bad)
        }
    };
    if had_errors {
        return Err(PipelineError::EncodingError {
            kind: EncodingErrorKind::UnconvertibleBytes,
        }
        .into());
    }
    Ok(text)
}

fn strip_leading_bom_char(text: &str) -> String {
    text.strip_prefix('\u{FEFF}').unwrap_or(text).to_string()
}

fn convert_streaming(path: &Path, detected: DetectedEncoding) -> anyhow::Result<()> {
    let encoding = match detected {
        DetectedEncoding::Utf8 => return Ok(()),
        DetectedEncoding::Utf8Bom => UTF_8,
        DetectedEncoding::Utf16Le => UTF_16LE,
        DetectedEncoding::Utf16Be => UTF_16BE,
        DetectedEncoding::Gbk => GBK,
    };
    let src = File::open(path).with_context(|| format!("open: {}", path.display()))?;
    let mut reader = BufReader::new(src);

    let dir = path.parent().unwrap_or_else(|| Path::new("."));
    let tmp = tempfile::NamedTempFile::new_in(dir).context("create temp file")?;
    {
        let mut writer = BufWriter::new(tmp.as_file());
        // BOM-aware decoder eats the leading BOM for the UTF families.
        let mut decoder = encoding.new_decoder();
        let mut inbuf = vec![0u8; STREAM_BUF];
        let mut outbuf = vec![0u8; STREAM_BUF * 2];
        loop {
            let n = reader.read(&mut inbuf).context("read chunk")?;
            let last = n == 0;
            let mut consumed = 0usize;
            loop {
                let (result, read, written, had_errors) =
                    decoder.decode_to_utf8(&inbuf[consumed..n], &mut outbuf, last);
                if had_errors {
                    return Err(PipelineError::EncodingError {
                        kind: EncodingErrorKind::UnconvertibleBytes,
                    }
                    .into());
                }
                writer.write_all(&outbuf[..written]).context("write chunk")?;
                consumed += read;
                match result {
                    encoding_rs::CoderResult::InputEmpty => break,
                    encoding_rs::CoderResult::OutputFull => continue,
                }
            }
            if last {
                break;
            }
        }
        writer.flush().context("flush temp")?;
    }

    let perms = fs::metadata(path)
        .with_context(|| format!("stat: {}", path.display()))?
        .permissions();
    tmp.persist(path)
        .map_err(|e| anyhow::anyhow!("persist temp: {e}"))?;
    fs::set_permissions(path, perms).context("restore permissions")?;
    Ok(())
}

fn write_preserving_permissions(path: &Path, bytes: &[u8]) -> anyhow::Result<()> {
    let perms = fs::metadata(path).ok().map(|m| m.permissions());
    let dir = path.parent().unwrap_or_else(|| Path::new("."));
    let mut tmp = tempfile::NamedTempFile::new_in(dir).context("create temp file")?;
    tmp.write_all(bytes).context("write temp")?;
    tmp.flush().context("flush temp")?;
    tmp.persist(path)
        .map_err(|e| anyhow::anyhow!("persist temp: {e}"))?;
    if let Some(perms) = perms {
        fs::set_permissions(path, perms).context("restore permissions")?;
    }
    Ok(())
}

/// Read a file as UTF-8, converting on the fly if needed. The file on disk
/// is not modified.
pub fn read_text(path: &Path) -> anyhow::Result<String> {
    let detected = detect(path)?;
    let bytes = fs::read(path).with_context(|| format!("read: {}", path.display()))?;
    decode_bytes(&bytes, detected)
}

/// Write UTF-8 text. Never emits a BOM; write is atomic (temp + rename).
pub fn write_text(path: &Path, text: &str) -> anyhow::Result<()> {
    write_preserving_permissions(path, text.as_bytes())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn write_raw(dir: &Path, name: &str, bytes: &[u8]) -> std::path::PathBuf {
        let p = dir.join(name);
        fs::write(&p, bytes).expect("write raw");
        p
    }

    #[test]
    fn detects_bom_variants() {
        let dir = tempfile::tempdir().expect("tempdir");
        let utf8 = write_raw(dir.path(), "a.tex", "hello".as_bytes());
        let bom = write_raw(dir.path(), "b.tex", &[0xEF, 0xBB, 0xBF, b'h', b'i']);
        let le = write_raw(dir.path(), "c.tex", &[0xFF, 0xFE, b'h', 0, b'i', 0]);
        let be = write_raw(dir.path(), "d.tex", &[0xFE, 0xFF, 0, b'h', 0, b'i']);
        assert_eq!(detect(&utf8).expect("detect"), DetectedEncoding::Utf8);
        assert_eq!(detect(&bom).expect("detect"), DetectedEncoding::Utf8Bom);
        assert_eq!(detect(&le).expect("detect"), DetectedEncoding::Utf16Le);
        assert_eq!(detect(&be).expect("detect"), DetectedEncoding::Utf16Be);
    }

    #[test]
    fn non_utf8_falls_back_to_gbk() {
        let dir = tempfile::tempdir().expect("tempdir");
        // "中文" in GBK.
        let p = write_raw(dir.path(), "g.tex", &[0xD6, 0xD0, 0xCE, 0xC4]);
        assert_eq!(detect(&p).expect("detect"), DetectedEncoding::Gbk);
        ensure_utf8(&p).expect("ensure");
        assert_eq!(fs::read_to_string(&p).expect("read"), "中文");
    }

    #[test]
    fn ensure_utf8_strips_bom_and_is_idempotent() {
        let dir = tempfile::tempdir().expect("tempdir");
        let p = write_raw(dir.path(), "b.tex", &[0xEF, 0xBB, 0xBF, b'x', b'y']);
        ensure_utf8(&p).expect("first");
        let once = fs::read(&p).expect("read");
        assert_eq!(once, b"xy");
        ensure_utf8(&p).expect("second");
        let twice = fs::read(&p).expect("read");
        assert_eq!(once, twice);
    }

    #[test]
    fn utf16_le_round_trips_content() {
        let dir = tempfile::tempdir().expect("tempdir");
        let mut bytes = vec![0xFF, 0xFE];
        for unit in "ok\n".encode_utf16() {
            bytes.extend_from_slice(&unit.to_le_bytes());
        }
        let p = write_raw(dir.path(), "u.tex", &bytes);
        ensure_utf8(&p).expect("ensure");
        assert_eq!(fs::read_to_string(&p).expect("read"), "ok\n");
        assert_eq!(detect(&p).expect("detect"), DetectedEncoding::Utf8);
    }

    #[test]
    fn write_text_never_emits_bom() {
        let dir = tempfile::tempdir().expect("tempdir");
        let p = dir.path().join("w.tex");
        write_text(&p, "数学 $x$").expect("write");
        let bytes = fs::read(&p).expect("read");
        assert!(!bytes.starts_with(&UTF8_BOM));
        assert_eq!(detect(&p).expect("detect"), DetectedEncoding::Utf8);
    }
}

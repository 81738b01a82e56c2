use std::path::Path;

use anyhow::Context;

/// Count pages in a PDF by scanning for page objects. Prefers the page
/// tree's `/Count` when a well-formed root is present; falls back to
/// counting `/Type /Page` objects.
pub fn count_pages(path: &Path) -> anyhow::Result<usize> {
    let bytes = std::fs::read(path).with_context(|| format!("read pdf: {}", path.display()))?;
    if !bytes.starts_with(b"%PDF") {
        anyhow::bail!("not a pdf: {}", path.display());
    }
    if let Some(n) = root_count(&bytes) {
        return Ok(n);
    }
    Ok(count_page_objects(&bytes))
}

fn root_count(bytes: &[u8]) -> Option<usize> {
    // The catalog's page tree node looks like `/Type /Pages ... /Count N`.
    let mut best: Option<usize> = None;
    let mut i = 0usize;
    while let Some(off) = find(bytes, b"/Type", i) {
        let tail = &bytes[off + 5..];
        let tail_trim = skip_ws(tail);
        if tail_trim.starts_with(b"/Pages") {
            let window_end = (off + 512).min(bytes.len());
            if let Some(coff) = find(&bytes[off..window_end], b"/Count", 0) {
                let num = parse_number(&bytes[off + coff + 6..]);
                if let Some(n) = num {
                    best = Some(best.map_or(n, |b: usize| b.max(n)));
                }
            }
        }
        i = off + 5;
    }
    best.filter(|n| *n > 0)
}

fn count_page_objects(bytes: &[u8]) -> usize {
    let mut count = 0usize;
    let mut i = 0usize;
    while let Some(off) = find(bytes, b"/Type", i) {
        let tail = skip_ws(&bytes[off + 5..]);
        if tail.starts_with(b"/Page") {
            // Exclude `/Pages` tree nodes.
            let after = &tail[5..];
            let boundary = after.first().map_or(true, |b| !b.is_ascii_alphabetic());
            if boundary {
                count += 1;
            }
        }
        i = off + 5;
    }
    count
}

fn find(haystack: &[u8], needle: &[u8], from: usize) -> Option<usize> {
    if from >= haystack.len() {
        return None;
    }
    haystack[from..]
        .windows(needle.len())
        .position(|w| w == needle)
        .map(|p| p + from)
}

fn skip_ws(bytes: &[u8]) -> &[u8] {
    let mut i = 0usize;
    while i < bytes.len() && (bytes[i] == b' ' || bytes[i] == b'\r' || bytes[i] == b'\n') {
        i += 1;
    }
    &bytes[i..]
}

fn parse_number(bytes: &[u8]) -> Option<usize> {
    let bytes = skip_ws(bytes);
    let digits: Vec<u8> = bytes
        .iter()
        .take_while(|b| b.is_ascii_digit())
        .copied()
        .collect();
    if digits.is_empty() {
        return None;
    }
    std::str::from_utf8(&digits).ok()?.parse().ok()
}

use once_cell::sync::Lazy;
use regex::Regex;

static BEGIN_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\\begin\{([A-Za-z@]+\*?)\}").expect("begin regex"));
static END_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\\end\{([A-Za-z@]+\*?)\}").expect("end regex"));

/// Environments a chunk boundary must never cut through.
const PROTECTED_ENVS: &[&str] = &[
    "equation",
    "equation*",
    "align",
    "align*",
    "alignat",
    "alignat*",
    "eqnarray",
    "eqnarray*",
    "gather",
    "gather*",
    "multline",
    "multline*",
    "figure",
    "figure*",
    "table",
    "table*",
    "tabular",
    "algorithm",
    "algorithmic",
    "verbatim",
    "verbatim*",
    "lstlisting",
    "thebibliography",
];

/// One slice of a file queued for translation. Slices partition the file:
/// concatenating `original_slice` in ordinal order reproduces it exactly.
#[derive(Clone, Debug)]
pub struct TranslationChunk {
    pub file_rel_path: String,
    pub ordinal: usize,
    pub original_slice: String,
    pub translated_slice: Option<String>,
    pub token_cost: u64,
}

/// Split `text` into chunks of at most `max_bytes` without cutting math
/// blocks, protected environments, comment runs, or unbalanced-brace
/// regions. Greedy maximal packing: a chunk takes blocks until the next one
/// would overflow. A single block larger than the budget becomes its own
/// oversized chunk.
#[must_use]
pub fn chunk_text(file_rel_path: &str, text: &str, max_bytes: usize) -> Vec<TranslationChunk> {
    let blocks = split_blocks(text);
    let mut chunks: Vec<TranslationChunk> = Vec::new();
    let mut current = String::new();

    let mut flush = |buf: &mut String, chunks: &mut Vec<TranslationChunk>| {
        if buf.is_empty() {
            return;
        }
        chunks.push(TranslationChunk {
            file_rel_path: file_rel_path.to_string(),
            ordinal: chunks.len(),
            original_slice: std::mem::take(buf),
            translated_slice: None,
            token_cost: 0,
        });
    };

    for block in blocks {
        if !current.is_empty() && current.len() + block.len() > max_bytes {
            flush(&mut current, &mut chunks);
        }
        current.push_str(&block);
        if current.len() >= max_bytes {
            flush(&mut current, &mut chunks);
        }
    }
    flush(&mut current, &mut chunks);
    chunks
}

/// Atomic blocks in file order. Invariant: blocks concatenate back to the
/// input byte-for-byte.
fn split_blocks(text: &str) -> Vec<String> {
    let mut lines: Vec<&str> = Vec::new();
    let mut rest = text;
    while !rest.is_empty() {
        match rest.find('\n') {
            Some(pos) => {
                lines.push(&rest[..=pos]);
                rest = &rest[pos + 1..];
            }
            None => {
                lines.push(rest);
                rest = "";
            }
        }
    }

    let mut blocks: Vec<String> = Vec::new();
    let mut current = String::new();
    let mut env_stack: Vec<String> = Vec::new();
    let mut brace_depth: i64 = 0;
    let mut math_open = false;
    let mut display_math_open = false;
    let mut in_comment_run = false;

    for line in lines {
        let trimmed = line.trim_start();
        let is_comment = trimmed.starts_with('%');

        // A comment run is atomic; close it when a non-comment line shows up.
        if in_comment_run && !is_comment {
            if env_stack.is_empty() && brace_depth <= 0 && !math_open && !display_math_open {
                blocks.push(std::mem::take(&mut current));
            }
            in_comment_run = false;
        }
        if is_comment && !in_comment_run {
            if !current.is_empty()
                && env_stack.is_empty()
                && brace_depth <= 0
                && !math_open
                && !display_math_open
            {
                blocks.push(std::mem::take(&mut current));
            }
            in_comment_run = true;
        }

        current.push_str(line);

        if !is_comment {
            scan_line_state(
                line,
                &mut env_stack,
                &mut brace_depth,
                &mut math_open,
                &mut display_math_open,
            );
        }

        let breakable = env_stack.is_empty()
            && brace_depth <= 0
            && !math_open
            && !display_math_open
            && !in_comment_run;
        let blank = line.trim().is_empty();
        if breakable && blank {
            blocks.push(std::mem::take(&mut current));
        }
    }
    if !current.is_empty() {
        blocks.push(current);
    }
    blocks
}

fn scan_line_state(
    line: &str,
    env_stack: &mut Vec<String>,
    brace_depth: &mut i64,
    math_open: &mut bool,
    display_math_open: &mut bool,
) {
    let code = crate::validator::strip_comment(line);

    let in_verbatim = env_stack
        .last()
        .map(|env| matches!(env.as_str(), "verbatim" | "verbatim*" | "lstlisting"))
        .unwrap_or(false);
    if in_verbatim {
        if let Some(top) = env_stack.last().cloned() {
            if code.contains(&format!("\\end{{{top}}}")) {
                env_stack.pop();
            }
        }
        return;
    }

    for cap in BEGIN_RE.captures_iter(&code) {
        let name = &cap[1];
        if PROTECTED_ENVS.contains(&name) {
            env_stack.push(name.to_string());
        }
    }
    for cap in END_RE.captures_iter(&code) {
        let name = &cap[1];
        if PROTECTED_ENVS.contains(&name) {
            if let Some(pos) = env_stack.iter().rposition(|e| e == name) {
                env_stack.truncate(pos);
            }
        }
    }

    // Inline math parity and brace depth, skipping escapes.
    let bytes = code.as_bytes();
    let mut i = 0usize;
    while i < bytes.len() {
        match bytes[i] {
            b'\\' => {
                if i + 1 < bytes.len() {
                    match bytes[i + 1] {
                        b'[' => *display_math_open = true,
                        b']' => *display_math_open = false,
                        _ => {}
                    }
                }
                i += 2;
                continue;
            }
            b'$' => {
                // `$$` toggles display math, `$` toggles inline math.
                if i + 1 < bytes.len() && bytes[i + 1] == b'$' {
                    *display_math_open = !*display_math_open;
                    i += 2;
                    continue;
                }
                *math_open = !*math_open;
            }
            b'{' => *brace_depth += 1,
            b'}' => *brace_depth -= 1,
            _ => {}
        }
        i += 1;
    }
}

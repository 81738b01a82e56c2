use std::collections::HashSet;
use std::path::{Path, PathBuf};

use once_cell::sync::Lazy;
use regex::Regex;
use walkdir::WalkDir;

use crate::backup::is_backup_file;
use crate::error::{PipelineError, Result};
use crate::textenc;
use crate::validator::strip_comment;

static INPUT_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\\(?:input|include)\{([^}]+)\}").expect("input regex"));
static DOCUMENTCLASS_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\\documentclass\b").expect("documentclass regex"));
static TITLE_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\\title\s*(?:\[[^\]]*\])?\{").expect("title regex"));
static TEX_MARKUP_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"\\[A-Za-z]+\s*(\{[^{}]*\})?|[{}~]|\\\\").expect("tex markup regex")
});

/// Names that win ties between several `\documentclass` candidates.
const MAIN_NAME_HINTS: &[&str] = &["main", "paper", "ms", "manuscript"];

/// All `.tex` files under the tree, relative paths in stable order.
/// Snapshot files are excluded so the compiler never sees them.
pub fn list_tex_files(extract_dir: &Path) -> Vec<PathBuf> {
    let mut out = Vec::new();
    for entry in WalkDir::new(extract_dir)
        .sort_by_file_name()
        .into_iter()
        .filter_map(|e| e.ok())
    {
        if !entry.file_type().is_file() {
            continue;
        }
        let path = entry.path();
        if is_backup_file(path) {
            continue;
        }
        if path
            .extension()
            .and_then(|s| s.to_str())
            .map(|ext| ext.eq_ignore_ascii_case("tex"))
            .unwrap_or(false)
        {
            if let Ok(rel) = path.strip_prefix(extract_dir) {
                out.push(rel.to_path_buf());
            }
        }
    }
    out
}

/// Pick the main `.tex`: a `\documentclass` file no other file `\input`s,
/// ties broken by conventional names and then by size.
pub fn locate_main(extract_dir: &Path) -> Result<PathBuf> {
    let tex_files = list_tex_files(extract_dir);
    if tex_files.is_empty() {
        return Err(PipelineError::FileNotFound(extract_dir.join("*.tex")));
    }

    let mut candidates: Vec<PathBuf> = Vec::new();
    let mut inputs_of: HashSet<PathBuf> = HashSet::new();

    for rel in &tex_files {
        let abs = extract_dir.join(rel);
        let Ok(text) = textenc::read_text(&abs) else {
            continue;
        };
        let mut has_class = false;
        for line in text.lines() {
            let code = strip_comment(line);
            if DOCUMENTCLASS_RE.is_match(&code) {
                has_class = true;
            }
            for cap in INPUT_RE.captures_iter(&code) {
                if let Some(target) = resolve_input_target(extract_dir, rel, &cap[1]) {
                    inputs_of.insert(target);
                }
            }
        }
        if has_class {
            candidates.push(rel.clone());
        }
    }

    // A file some other file pulls in cannot be the root.
    let mut roots: Vec<PathBuf> = candidates
        .iter()
        .filter(|c| !inputs_of.contains(*c))
        .cloned()
        .collect();
    if roots.is_empty() {
        roots = candidates;
    }

    match roots.len() {
        0 => Err(PipelineError::FileNotFound(
            extract_dir.join("main.tex"),
        )),
        1 => Ok(roots.remove(0)),
        _ => {
            roots.sort_by_key(|rel| {
                let stem = rel
                    .file_stem()
                    .and_then(|s| s.to_str())
                    .unwrap_or_default()
                    .to_ascii_lowercase();
                let hinted = MAIN_NAME_HINTS.contains(&stem.as_str());
                let size = std::fs::metadata(extract_dir.join(rel))
                    .map(|m| m.len())
                    .unwrap_or(0);
                // Hinted names first, then larger files.
                (if hinted { 0u8 } else { 1u8 }, u64::MAX - size)
            });
            Ok(roots.remove(0))
        }
    }
}

/// Depth-first walk of the `\input`/`\include` graph from `main_rel`.
/// Returns relative paths, main first, each file once, never leaving
/// `extract_dir`.
pub fn discover(extract_dir: &Path, main_rel: &Path) -> Result<Vec<PathBuf>> {
    let main_abs = extract_dir.join(main_rel);
    if !main_abs.is_file() {
        return Err(PipelineError::FileNotFound(main_abs));
    }

    let mut visited: HashSet<PathBuf> = HashSet::new();
    let mut ordered: Vec<PathBuf> = Vec::new();
    let mut stack: Vec<PathBuf> = vec![main_rel.to_path_buf()];

    while let Some(rel) = stack.pop() {
        if !visited.insert(rel.clone()) {
            continue;
        }
        ordered.push(rel.clone());

        let abs = extract_dir.join(&rel);
        let Ok(text) = textenc::read_text(&abs) else {
            continue;
        };
        // Push in reverse so the DFS visits in source order.
        let mut targets = Vec::new();
        for line in text.lines() {
            let code = strip_comment(line);
            for cap in INPUT_RE.captures_iter(&code) {
                if let Some(target) = resolve_input_target(extract_dir, &rel, &cap[1]) {
                    targets.push(target);
                }
            }
        }
        for target in targets.into_iter().rev() {
            if !visited.contains(&target) {
                stack.push(target);
            }
        }
    }

    Ok(ordered)
}

/// Resolve an `\input{…}` argument against the including file's directory,
/// then against the project root. Targets escaping the root are dropped.
fn resolve_input_target(extract_dir: &Path, from_rel: &Path, raw: &str) -> Option<PathBuf> {
    let raw = raw.trim();
    if raw.is_empty() {
        return None;
    }
    let mut name = PathBuf::from(raw);
    if name.extension().is_none() {
        name.set_extension("tex");
    }

    let from_dir = from_rel.parent().unwrap_or_else(|| Path::new(""));
    let candidates = [from_dir.join(&name), name.clone()];
    for cand in candidates {
        let normalized = normalize_within(&cand)?;
        if extract_dir.join(&normalized).is_file() {
            return Some(normalized);
        }
    }
    None
}

/// Paper title from the main file's `\title{…}`, flattened to plain text.
/// Multi-line titles are followed until the braces balance.
#[must_use]
pub fn extract_title(main_text: &str) -> Option<String> {
    let code: String = main_text
        .lines()
        .map(strip_comment)
        .collect::<Vec<_>>()
        .join("\n");
    let m = TITLE_RE.find(&code)?;
    let rest = &code[m.end()..];

    let mut depth: i64 = 1;
    let mut body = String::new();
    for ch in rest.chars() {
        match ch {
            '{' => {
                depth += 1;
                body.push(ch);
            }
            '}' => {
                depth -= 1;
                if depth == 0 {
                    break;
                }
                body.push(ch);
            }
            _ => body.push(ch),
        }
    }
    if depth != 0 {
        return None;
    }

    // Flatten markup: \thanks{...} footnotes drop entirely, other commands
    // keep their argument text.
    let body = body.replace("\\\\", " ");
    let mut flat = body;
    for _ in 0..4 {
        let next = TEX_MARKUP_RE
            .replace_all(&flat, |caps: &regex::Captures<'_>| {
                let whole = caps.get(0).map(|m| m.as_str()).unwrap_or("");
                if whole.starts_with("\\thanks") || whole.starts_with("\\footnote") {
                    return String::new();
                }
                match caps.get(1) {
                    Some(arg) => arg
                        .as_str()
                        .trim_matches(|c| c == '{' || c == '}')
                        .to_string(),
                    None if whole == "~" => " ".to_string(),
                    None => String::new(),
                }
            })
            .into_owned();
        if next == flat {
            break;
        }
        flat = next;
    }
    let title = flat.split_whitespace().collect::<Vec<_>>().join(" ");
    (!title.is_empty()).then_some(title)
}

/// Lexically normalize a relative path, refusing to climb out of the root.
fn normalize_within(path: &Path) -> Option<PathBuf> {
    let mut out = PathBuf::new();
    for comp in path.components() {
        match comp {
            std::path::Component::Normal(c) => out.push(c),
            std::path::Component::CurDir => {}
            std::path::Component::ParentDir => {
                if !out.pop() {
                    return None;
                }
            }
            _ => return None,
        }
    }
    Some(out)
}

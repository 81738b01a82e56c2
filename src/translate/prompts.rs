use std::path::Path;

use anyhow::Context;

use crate::config::PromptsSection;

pub const DEFAULT_TRANSLATE: &str = r#"你是一名学术论文翻译专家。把下面的 LaTeX 片段从英文翻译成中文。

要求:
- 保持所有 LaTeX 命令、环境、数学公式、标签 (\label/\ref/\cite) 原样不动。
- 只翻译正文文字、图表标题和脚注;注释行保持为注释行。
- 不要增删行,不要合并段落,不要输出任何解释。
- 直接输出翻译后的 LaTeX,不要使用代码块包裹。

LaTeX 片段:
{source}
"#;

pub const DEFAULT_FIX_WHOLE: &str = r#"下面的 LaTeX 文件编译失败。请修复错误并输出完整的修复后文件。

要求:
- 只做让文件通过编译所需的最小改动。
- 保持中文译文内容不变。
- 直接输出完整文件内容,不要解释,不要使用代码块包裹。

编译错误:
{errors}

文件内容:
{source}
"#;

pub const DEFAULT_FIX_SECTION: &str = r#"下面是一个编译失败的 LaTeX 文件的若干片段,每段用
=== SECTION: lines A-B ===
标记行号范围。请修复各片段中的错误。

要求:
- 输出时必须原样保留每个 === SECTION: lines A-B === 标记行。
- 每个片段输出修复后的同一行号范围的内容。
- 保持中文译文内容不变,不要解释。

编译错误:
{errors}

片段:
{sections}
"#;

pub const DEFAULT_AGENT_STEP: &str = r#"你是一个修复 LaTeX 编译错误的工具代理。每一步选择一个工具调用,以 JSON 输出。

可用工具:
- {"tool":"read_lines","a":<int>,"b":<int>}
- {"tool":"replace_line","n":<int>,"text":"..."}
- {"tool":"replace_range","a":<int>,"b":<int>,"lines":["...",...]}
- {"tool":"insert_line","n":<int>,"text":"..."}
- {"tool":"delete_line","n":<int>}
- {"tool":"validate"}
- {"tool":"compile"}

规则:
- 一次只输出一个 JSON 对象,不要输出其他内容。
- 修改之后先 validate,再 compile。
- 编译已经成功时输出 {"tool":"done"}。

文件: {file}
共 {line_count} 行。

最近的编译错误:
{errors}

历史操作:
{history}
"#;

/// Substitute `{name}` placeholders. Unknown placeholders stay verbatim so
/// prompts can contain literal braces.
#[must_use]
pub fn render_template(template: &str, pairs: &[(&str, &str)]) -> String {
    let mut out = template.to_string();
    for (key, value) in pairs {
        out = out.replace(&format!("{{{key}}}"), value);
    }
    out
}

/// Resolved prompt set, defaults overridable per file from the config.
#[derive(Clone, Debug)]
pub struct PromptCatalog {
    pub translate: String,
    pub fix_whole: String,
    pub fix_section: String,
    pub agent_step: String,
}

impl Default for PromptCatalog {
    fn default() -> Self {
        Self {
            translate: DEFAULT_TRANSLATE.to_string(),
            fix_whole: DEFAULT_FIX_WHOLE.to_string(),
            fix_section: DEFAULT_FIX_SECTION.to_string(),
            agent_step: DEFAULT_AGENT_STEP.to_string(),
        }
    }
}

impl PromptCatalog {
    /// Load overrides relative to the config file's directory.
    pub fn load(config_dir: &Path, overrides: &PromptsSection) -> anyhow::Result<Self> {
        let mut catalog = Self::default();
        if let Some(p) = overrides.translate.as_deref() {
            catalog.translate = read_prompt(config_dir, p)?;
        }
        if let Some(p) = overrides.fix_whole.as_deref() {
            catalog.fix_whole = read_prompt(config_dir, p)?;
        }
        if let Some(p) = overrides.fix_section.as_deref() {
            catalog.fix_section = read_prompt(config_dir, p)?;
        }
        if let Some(p) = overrides.agent_step.as_deref() {
            catalog.agent_step = read_prompt(config_dir, p)?;
        }
        Ok(catalog)
    }
}

fn read_prompt(config_dir: &Path, rel: &str) -> anyhow::Result<String> {
    let path = if Path::new(rel).is_absolute() {
        Path::new(rel).to_path_buf()
    } else {
        config_dir.join(rel)
    };
    std::fs::read_to_string(&path).with_context(|| format!("read prompt: {}", path.display()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn render_replaces_known_placeholders_only() {
        let out = render_template("a {x} b {y} c {unknown}", &[("x", "1"), ("y", "2")]);
        assert_eq!(out, "a 1 b 2 c {unknown}");
    }

    #[test]
    fn catalog_loads_overrides() {
        let dir = tempfile::tempdir().expect("tempdir");
        std::fs::write(dir.path().join("t.txt"), "custom {source}").expect("write");
        let overrides = PromptsSection {
            translate: Some("t.txt".to_string()),
            ..Default::default()
        };
        let catalog = PromptCatalog::load(dir.path(), &overrides).expect("load");
        assert_eq!(catalog.translate, "custom {source}");
        assert_eq!(catalog.fix_whole, DEFAULT_FIX_WHOLE);
    }
}

use std::path::Path;
use std::time::Duration;

use anyhow::Context;

use crate::compiler::{Engine, LatexCompiler};
use crate::pdf::count_pages;

/// Render a side-by-side PDF: page k of the original next to page k of the
/// translation, via a generated `pdfpages` document compiled through the
/// normal compiler seam. Extra pages of the longer document trail at the
/// end.
pub fn generate_bilingual(
    compiler: &dyn LatexCompiler,
    engine: Engine,
    original_pdf: &Path,
    translated_pdf: &Path,
    output_pdf: &Path,
    timeout: Duration,
) -> anyhow::Result<()> {
    let original_pages = count_pages(original_pdf)?;
    let translated_pages = count_pages(translated_pdf)?;
    if original_pages == 0 || translated_pages == 0 {
        anyhow::bail!("empty pdf input for bilingual merge");
    }

    let work = tempfile::tempdir().context("create bilingual work dir")?;
    // pdfpages resolves relative names against the work dir; copy both
    // inputs in so the generated document stays path-free.
    std::fs::copy(original_pdf, work.path().join("original.pdf"))
        .context("stage original pdf")?;
    std::fs::copy(translated_pdf, work.path().join("translated.pdf"))
        .context("stage translated pdf")?;

    let doc = bilingual_document(original_pages, translated_pages);
    let main = work.path().join("bilingual.tex");
    std::fs::write(&main, doc).context("write bilingual document")?;

    let outcome = compiler
        .compile(&main, work.path(), engine, timeout)
        .context("compile bilingual document")?;
    if !outcome.success {
        anyhow::bail!(
            "双语 PDF 编译失败: {}",
            outcome.error_msg.unwrap_or_else(|| "unknown".to_string())
        );
    }
    let produced = outcome
        .pdf_path
        .ok_or_else(|| anyhow::anyhow!("bilingual compile produced no pdf"))?;
    std::fs::copy(&produced, output_pdf)
        .with_context(|| format!("copy bilingual pdf: {}", output_pdf.display()))?;
    Ok(())
}

/// The `pdfpages` merge list: alternating original/translated pages, 2-up
/// landscape.
fn bilingual_document(original_pages: usize, translated_pages: usize) -> String {
    let paired = original_pages.min(translated_pages);
    let mut merge_items: Vec<String> = Vec::new();
    for page in 1..=paired {
        merge_items.push(format!("original.pdf,{page}"));
        merge_items.push(format!("translated.pdf,{page}"));
    }
    for page in paired + 1..=original_pages {
        merge_items.push(format!("original.pdf,{page}"));
    }
    for page in paired + 1..=translated_pages {
        merge_items.push(format!("translated.pdf,{page}"));
    }

    format!(
        "\\documentclass{{article}}\n\
         \\usepackage{{pdfpages}}\n\
         \\begin{{document}}\n\
         \\includepdfmerge[nup=1x2,landscape]{{{}}}\n\
         \\end{{document}}\n",
        merge_items.join(",")
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn merge_list_alternates_pages() {
        let doc = bilingual_document(2, 3);
        assert!(doc.contains(
            "original.pdf,1,translated.pdf,1,original.pdf,2,translated.pdf,2,translated.pdf,3"
        ));
        assert!(doc.contains("nup=1x2"));
    }

    #[test]
    fn equal_length_documents_pair_fully() {
        let doc = bilingual_document(1, 1);
        assert!(doc.contains("{original.pdf,1,translated.pdf,1}"));
    }
}

mod chunker;
mod driver;
mod postfix;
mod prompts;

pub use chunker::{chunk_text, TranslationChunk};
pub use driver::{clean_llm_reply, is_translatable, TranslationOutcome, TranslatorDriver};
pub use postfix::{reference_based_post_fix, PostFixOptions};
pub use prompts::{render_template, PromptCatalog};

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::{Parser, Subcommand};

use paper_translator::acquire::SourceSpec;
use paper_translator::compiler::TexLiveCompiler;
use paper_translator::config::{
    find_default_config, init_default_config, load_config, AppConfig, Settings,
};
use paper_translator::error::JsonlErrorSink;
use paper_translator::llm::CommandLlmClient;
use paper_translator::pipeline::PipelineOrchestrator;
use paper_translator::progress::ConsoleProgress;
use paper_translator::project::{discover, locate_main};
use paper_translator::store::ResultStore;
use paper_translator::textenc;
use paper_translator::translate::PromptCatalog;
use paper_translator::validator::validate;

#[derive(Parser, Debug)]
#[command(name = "paper-translator")]
#[command(about = "Translate English LaTeX papers to Chinese and compile both to PDF", long_about = None)]
struct Args {
    /// Config file path (default: search for paper-translator.toml upwards)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Translate a paper by arXiv id, URL, or local .zip
    Translate {
        /// arXiv id (e.g. 2301.00001), URL, or path to a .zip source bundle
        input: String,

        /// Delete any existing result and start over
        #[arg(long)]
        force: bool,
    },

    /// Resume an interrupted or failed run
    Continue {
        /// Paper id (arXiv id or md5_<hash>)
        paper_id: String,
    },

    /// List persisted papers and their status
    List,

    /// Delete a persisted paper and all of its artifacts
    Delete {
        paper_id: String,
    },

    /// Statically validate a .tex file
    Validate {
        file: PathBuf,
    },

    /// Locate the main .tex of an extracted source tree
    LocateMain {
        dir: PathBuf,
    },

    /// Write the default config file, then exit
    InitConfig {
        /// Directory to write the config to (default: current directory)
        #[arg(long, value_name = "DIR")]
        dir: Option<PathBuf>,

        /// Overwrite an existing config file
        #[arg(long)]
        force: bool,
    },
}

fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    let progress = ConsoleProgress::new(true);

    if let Command::InitConfig { dir, force } = &args.command {
        let dir = dir
            .clone()
            .unwrap_or_else(|| std::env::current_dir().unwrap_or_else(|_| PathBuf::from(".")));
        let path = init_default_config(&dir, *force).context("init default config")?;
        progress.info(format!("已写入配置: {}", path.display()));
        return Ok(());
    }

    let (settings, prompts) = load_settings(args.config.clone())?;

    match args.command {
        Command::Translate { input, force } => {
            let spec = SourceSpec::parse(&input)?;
            let orchestrator = build_orchestrator(&settings, prompts)?;
            let result = orchestrator.process_source_with_force(&spec, force)?;
            progress.info(format!("完成: {}", result.record.id));
            progress.info(format!("原文 PDF: {}", result.original_pdf.display()));
            progress.info(format!("译文 PDF: {}", result.translated_pdf.display()));
            if let Some(p) = result.bilingual_pdf {
                progress.info(format!("双语 PDF: {}", p.display()));
            }
        }
        Command::Continue { paper_id } => {
            let orchestrator = build_orchestrator(&settings, prompts)?;
            let result = orchestrator.continue_translation(&paper_id)?;
            progress.info(format!("完成: {}", result.record.id));
        }
        Command::List => {
            let store = ResultStore::new(settings.results_dir.clone())?;
            for summary in store.list()? {
                println!(
                    "{:<24} {:<18} {:<22} {}",
                    summary.id,
                    format!("{:?}", summary.status),
                    summary.translated_at.unwrap_or_default(),
                    summary.title
                );
            }
        }
        Command::Delete { paper_id } => {
            let store = ResultStore::new(settings.results_dir.clone())?;
            store.delete(&paper_id)?;
            progress.info(format!("已删除: {paper_id}"));
        }
        Command::Validate { file } => {
            let text = textenc::read_text(&file)?;
            let report = validate(&text);
            if report.issues.is_empty() {
                progress.info("无问题".to_string());
            } else {
                for issue in &report.issues {
                    println!(
                        "{}:{} [{:?}] {:?}: {}",
                        file.display(),
                        issue.line,
                        issue.severity,
                        issue.kind,
                        issue.message
                    );
                }
            }
            if !report.valid() {
                std::process::exit(1);
            }
        }
        Command::LocateMain { dir } => {
            let main_rel = locate_main(&dir)?;
            println!("{}", main_rel.display());
            for rel in discover(&dir, &main_rel)? {
                if rel != main_rel {
                    println!("  {}", rel.display());
                }
            }
        }
        Command::InitConfig { .. } => unreachable!("handled above"),
    }
    Ok(())
}

fn load_settings(config_arg: Option<PathBuf>) -> anyhow::Result<(Settings, PromptCatalog)> {
    let workdir = std::env::current_dir().unwrap_or_else(|_| PathBuf::from("."));
    let cfg_path = config_arg.or_else(|| find_default_config(&workdir));

    let mut cfg = AppConfig::default();
    let mut config_dir = workdir.clone();
    if let Some(p) = cfg_path.as_ref() {
        if p.exists() {
            cfg = load_config(p)?;
            if let Some(parent) = p.parent() {
                config_dir = parent.to_path_buf();
            }
        }
    }

    let home = std::env::var_os("HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|| workdir.clone());
    let settings = Settings::from_config(&cfg, &home)?;
    let prompts = PromptCatalog::load(&config_dir, &settings.prompt_overrides)?;
    Ok((settings, prompts))
}

fn build_orchestrator(
    settings: &Settings,
    prompts: PromptCatalog,
) -> anyhow::Result<PipelineOrchestrator> {
    if settings.llm_command.is_empty() {
        anyhow::bail!(
            "未配置 LLM 后端: 在 {} 的 [llm] 段设置 command",
            paper_translator::config::CONFIG_FILENAME
        );
    }
    let llm = Arc::new(CommandLlmClient::new(
        &settings.llm_command,
        settings.llm_request_timeout,
    )?);
    let store = ResultStore::new(settings.results_dir.clone())?;
    let error_sink = Arc::new(JsonlErrorSink::new(
        settings.results_dir.join("errors.jsonl"),
    ));
    let listener = Arc::new(ConsoleProgress::new(true));

    let orchestrator = PipelineOrchestrator::new(
        settings.clone(),
        store,
        Arc::new(TexLiveCompiler::new()),
        llm,
        Some(Arc::new(CurlDownloader::new(settings.work_dir.clone()))),
        error_sink,
        listener,
        prompts,
    )?;
    Ok(orchestrator)
}

/// Minimal download capability for the CLI: shells out to curl, which every
/// TeX-capable host already has. Embedders replace this with their own
/// transport.
struct CurlDownloader {
    work_dir: PathBuf,
}

impl CurlDownloader {
    fn new(work_dir: PathBuf) -> Self {
        Self { work_dir }
    }

    fn fetch(&self, url: &str, file_name: &str) -> anyhow::Result<PathBuf> {
        std::fs::create_dir_all(&self.work_dir)
            .with_context(|| format!("create work dir: {}", self.work_dir.display()))?;
        let dest = self.work_dir.join(file_name);
        let status = std::process::Command::new("curl")
            .arg("-L")
            .arg("--fail")
            .arg("--silent")
            .arg("--show-error")
            .arg("--max-time")
            .arg(Duration::from_secs(300).as_secs().to_string())
            .arg("-o")
            .arg(&dest)
            .arg(url)
            .status()
            .context("spawn curl")?;
        if !status.success() {
            anyhow::bail!("curl 退出码 {:?}: {url}", status.code());
        }
        Ok(dest)
    }
}

impl paper_translator::acquire::Downloader for CurlDownloader {
    fn download_url(&self, url: &str) -> anyhow::Result<PathBuf> {
        let name = url
            .rsplit('/')
            .next()
            .filter(|s| !s.is_empty())
            .unwrap_or("source.zip");
        self.fetch(url, &format!("download_{name}"))
    }

    fn download_by_id(&self, id: &str) -> anyhow::Result<PathBuf> {
        let safe = id.replace('/', "_");
        self.fetch(
            &format!("https://arxiv.org/src/{id}"),
            &format!("arxiv_{safe}.tar.gz"),
        )
    }
}

use std::io::{Read, Write};
use std::process::{Command, Stdio};
use std::time::Duration;

use anyhow::Context;

/// One translation reply with the transport's token accounting (estimated
/// when the backend does not report usage).
#[derive(Clone, Debug)]
pub struct LlmReply {
    pub text: String,
    pub tokens_used: u64,
}

/// The model seam. Implementations must be safe for concurrent calls; the
/// pipeline applies its own concurrency cap on top.
pub trait LlmClient: Send + Sync {
    fn translate(&self, prompt: &str) -> anyhow::Result<LlmReply>;

    fn chat(&self, prompt: &str) -> anyhow::Result<String> {
        Ok(self.translate(prompt)?.text)
    }
}

/// Pipes the prompt to a user-configured external command (stdin in,
/// completion on stdout). Keeps the binary usable without embedding any
/// model runtime.
pub struct CommandLlmClient {
    program: String,
    args: Vec<String>,
    timeout: Duration,
}

impl CommandLlmClient {
    pub fn new(command_line: &[String], timeout: Duration) -> anyhow::Result<Self> {
        let (program, args) = command_line
            .split_first()
            .ok_or_else(|| anyhow::anyhow!("llm command is empty"))?;
        Ok(Self {
            program: program.clone(),
            args: args.to_vec(),
            timeout,
        })
    }

    fn run(&self, prompt: &str) -> anyhow::Result<String> {
        let mut child = Command::new(&self.program)
            .args(&self.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .with_context(|| format!("spawn llm command: {}", self.program))?;

        let mut stdin = child.stdin.take().context("llm stdin")?;
        let prompt_bytes = prompt.as_bytes().to_vec();
        let writer = std::thread::spawn(move || {
            let _ = stdin.write_all(&prompt_bytes);
            // stdin drops here so the child sees EOF.
        });

        let mut stdout = child.stdout.take().context("llm stdout")?;
        let (tx, rx) = crossbeam_channel::bounded(1);
        let reader = std::thread::spawn(move || {
            let mut buf = String::new();
            let res = stdout.read_to_string(&mut buf).map(|_| buf);
            let _ = tx.send(res);
        });

        let out = match rx.recv_timeout(self.timeout) {
            Ok(Ok(buf)) => buf,
            Ok(Err(e)) => {
                let _ = child.kill();
                let _ = child.wait();
                return Err(anyhow::Error::from(e).context("read llm output"));
            }
            Err(_) => {
                let _ = child.kill();
                let _ = child.wait();
                anyhow::bail!("llm 请求超时 ({}s)", self.timeout.as_secs());
            }
        };
        let _ = writer.join();
        let _ = reader.join();

        let status = child.wait().context("wait llm command")?;
        if !status.success() {
            anyhow::bail!("llm 命令退出码 {:?}", status.code());
        }
        Ok(out)
    }
}

impl LlmClient for CommandLlmClient {
    fn translate(&self, prompt: &str) -> anyhow::Result<LlmReply> {
        let text = self.run(prompt)?;
        let tokens_used = estimate_tokens(prompt) + estimate_tokens(&text);
        Ok(LlmReply { text, tokens_used })
    }
}

/// Rough byte-based token estimate used when the transport reports nothing.
#[must_use]
pub fn estimate_tokens(text: &str) -> u64 {
    (text.len() as u64).div_ceil(4)
}

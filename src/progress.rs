use std::io::{self, Write};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Instant;

/// Pipeline phase as seen by status listeners.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Phase {
    Idle,
    Downloading,
    Extracting,
    Compiling,
    Translating,
    Validating,
    Complete,
    Error,
}

impl Phase {
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Downloading => "downloading",
            Self::Extracting => "extracting",
            Self::Compiling => "compiling",
            Self::Translating => "translating",
            Self::Validating => "validating",
            Self::Complete => "complete",
            Self::Error => "error",
        }
    }
}

/// One status event. Progress is a percentage in `0..=100` and is
/// non-decreasing within a run except when entering `Error`.
#[derive(Clone, Debug)]
pub struct Status {
    pub phase: Phase,
    pub progress: u8,
    pub message: String,
    pub error: Option<String>,
}

impl Status {
    #[must_use]
    pub fn new(phase: Phase, progress: u8, message: impl Into<String>) -> Self {
        Self {
            phase,
            progress: progress.min(100),
            message: message.into(),
            error: None,
        }
    }

    #[must_use]
    pub fn error(message: impl Into<String>, error: impl Into<String>) -> Self {
        Self {
            phase: Phase::Error,
            progress: 0,
            message: message.into(),
            error: Some(error.into()),
        }
    }
}

/// Best-effort listener; invoked from the orchestrator task, outside the
/// emitter's lock.
pub trait StatusListener: Send + Sync {
    fn on_status(&self, status: &Status);
}

/// Serializes status emission and enforces monotone progress: a stale or
/// backwards event (outside `Error`) is clamped to the last emitted value.
pub struct StatusEmitter {
    listener: Arc<dyn StatusListener>,
    last_progress: Mutex<u8>,
}

impl StatusEmitter {
    #[must_use]
    pub fn new(listener: Arc<dyn StatusListener>) -> Self {
        Self {
            listener,
            last_progress: Mutex::new(0),
        }
    }

    pub fn emit(&self, mut status: Status) {
        {
            let mut last = self.last_progress.lock().expect("status lock");
            if status.phase == Phase::Error {
                *last = 0;
            } else {
                if status.progress < *last {
                    status.progress = *last;
                }
                *last = status.progress;
            }
        }
        // Listener runs outside the lock.
        self.listener.on_status(&status);
    }

    pub fn reset(&self) {
        *self.last_progress.lock().expect("status lock") = 0;
    }
}

/// Cooperative cancellation token checked at phase boundaries and between
/// translation chunks.
#[derive(Clone, Default)]
pub struct CancelToken {
    flag: Arc<AtomicBool>,
}

impl CancelToken {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.flag.store(true, Ordering::SeqCst);
    }

    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }
}

/// stderr reporter with elapsed-time prefixes; doubles as the default
/// status listener.
pub struct ConsoleProgress {
    enabled: bool,
    t0: Instant,
}

impl ConsoleProgress {
    #[must_use]
    pub fn new(enabled: bool) -> Self {
        Self {
            enabled,
            t0: Instant::now(),
        }
    }

    pub fn info(&self, msg: impl AsRef<str>) {
        if !self.enabled {
            return;
        }
        let ts = fmt_elapsed(self.t0.elapsed().as_secs_f64());
        let mut stderr = io::stderr().lock();
        let _ = writeln!(stderr, "[{ts}] {}", msg.as_ref());
    }

    pub fn warn(&self, msg: impl AsRef<str>) {
        if !self.enabled {
            return;
        }
        let ts = fmt_elapsed(self.t0.elapsed().as_secs_f64());
        let mut stderr = io::stderr().lock();
        let _ = writeln!(stderr, "[{ts}] WARN {}", msg.as_ref());
    }

    pub fn progress(&self, label: &str, current: usize, total: usize) {
        if !self.enabled {
            return;
        }
        let total = total.max(1);
        let current = current.min(total);
        let pct = (current as f64 / total as f64) * 100.0;
        let ts = fmt_elapsed(self.t0.elapsed().as_secs_f64());
        let mut stderr = io::stderr().lock();
        let _ = writeln!(stderr, "[{ts}] {label} {current}/{total} ({pct:5.1}%)");
    }
}

impl StatusListener for ConsoleProgress {
    fn on_status(&self, status: &Status) {
        match status.phase {
            Phase::Error => {
                let detail = status.error.as_deref().unwrap_or("");
                self.warn(format!("{} {detail}", status.message));
            }
            _ => self.info(format!(
                "[{:>3}%] {} {}",
                status.progress,
                status.phase.as_str(),
                status.message
            )),
        }
    }
}

fn fmt_elapsed(seconds: f64) -> String {
    let seconds = seconds.max(0.0) as u64;
    let h = seconds / 3600;
    let m = (seconds % 3600) / 60;
    let s = seconds % 60;
    if h > 0 {
        format!("{h:02}:{m:02}:{s:02}")
    } else {
        format!("{m:02}:{s:02}")
    }
}

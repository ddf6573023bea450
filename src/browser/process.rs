//! Supervised browser driver process
//!
//! Spawns the WebDriver executable on a fresh ephemeral port, waits for its
//! readiness marker on the combined output streams, and keeps the child on a
//! kill-on-drop leash so an abandoned handle can never leak a process.

use crate::config::BrowserConfig;
use std::path::PathBuf;
use std::process::Stdio;
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, Command};

/// Substrings the driver prints once it accepts connections
const READY_MARKERS: &[&str] = &["was started successfully", "DevTools listening"];

/// Well-known driver install locations, probed in order
const EXECUTABLE_CANDIDATES: &[&str] = &[
    "/usr/bin/chromedriver",
    "/usr/local/bin/chromedriver",
    "/usr/lib/chromium-browser/chromedriver",
    "/usr/lib/chromium/chromedriver",
    "/opt/homebrew/bin/chromedriver",
    "/snap/bin/chromium.chromedriver",
];

/// Browser process errors
#[derive(Debug, Error)]
pub enum BrowserError {
    #[error("No browser driver executable found; set browser.executable-path")]
    ExecutableNotFound,

    #[error("Browser driver not ready after {attempts} spawn attempt(s)")]
    SpawnFailed { attempts: u32 },

    #[error("Browser process error: {0}")]
    Io(#[from] std::io::Error),
}

/// One supervised driver process bound to a local port
pub struct BrowserProcess {
    child: Child,
    port: u16,
    shut_down: bool,
}

impl BrowserProcess {
    /// One spawn attempt on a fresh ephemeral port.
    ///
    /// Callers own the retry policy. A failed attempt reports
    /// `SpawnFailed { attempts: 1 }`.
    pub async fn spawn_once(config: &BrowserConfig) -> Result<Self, BrowserError> {
        let executable = locate_executable(config)?;
        let port = free_port()?;
        tracing::debug!("Spawning {} on port {}", executable.display(), port);

        let child = spawn_attempt(&executable, port, config).await?;
        tracing::info!("Browser driver ready on port {}", port);
        Ok(Self {
            child,
            port,
            shut_down: false,
        })
    }

    /// Port the driver listens on
    pub fn port(&self) -> u16 {
        self.port
    }

    /// OS process id, while the child is still attached
    pub fn pid(&self) -> Option<u32> {
        self.child.id()
    }

    /// Whether the process still exists in the OS process table
    pub fn alive(&mut self) -> bool {
        if self.shut_down {
            return false;
        }
        matches!(self.child.try_wait(), Ok(None))
    }

    /// Kills the driver process. Idempotent.
    pub async fn shutdown(&mut self) {
        if self.shut_down {
            return;
        }
        self.shut_down = true;

        // Already-exited children return InvalidInput here; tolerated.
        if let Err(error) = self.child.start_kill() {
            tracing::debug!("Browser kill signal failed: {}", error);
        }
        let _ = self.child.wait().await;
    }
}

/// Resolves the driver executable: explicit config path first, then
/// well-known install locations
fn locate_executable(config: &BrowserConfig) -> Result<PathBuf, BrowserError> {
    if let Some(path) = &config.executable_path {
        let path = PathBuf::from(path);
        if path.exists() {
            return Ok(path);
        }
        tracing::error!("Configured browser executable missing: {}", path.display());
        return Err(BrowserError::ExecutableNotFound);
    }

    EXECUTABLE_CANDIDATES
        .iter()
        .map(PathBuf::from)
        .find(|candidate| candidate.exists())
        .ok_or(BrowserError::ExecutableNotFound)
}

/// Picks a currently-free ephemeral port by binding and releasing it
fn free_port() -> Result<u16, BrowserError> {
    let listener = std::net::TcpListener::bind("127.0.0.1:0")?;
    Ok(listener.local_addr()?.port())
}

/// One spawn attempt: launch, then wait for the readiness marker
async fn spawn_attempt(
    executable: &PathBuf,
    port: u16,
    config: &BrowserConfig,
) -> Result<Child, BrowserError> {
    let mut child = Command::new(executable)
        .arg(format!("--port={}", port))
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .spawn()?;

    let ready = tokio::time::timeout(
        config.spawn_timeout(),
        wait_for_ready_marker(&mut child),
    )
    .await
    .unwrap_or(false);

    if ready {
        return Ok(child);
    }

    if let Err(error) = child.start_kill() {
        tracing::debug!("Failed killing unready browser child: {}", error);
    }
    let _ = child.wait().await;
    Err(BrowserError::SpawnFailed { attempts: 1 })
}

/// Scans the child's combined stdout/stderr for a readiness marker.
///
/// Returns false when both streams hit EOF first, which covers drivers that
/// crash or exit immediately.
async fn wait_for_ready_marker(child: &mut Child) -> bool {
    let stdout = match child.stdout.take() {
        Some(stdout) => stdout,
        None => return false,
    };
    let stderr = match child.stderr.take() {
        Some(stderr) => stderr,
        None => return false,
    };

    let mut stdout_lines = BufReader::new(stdout).lines();
    let mut stderr_lines = BufReader::new(stderr).lines();
    let mut stdout_open = true;
    let mut stderr_open = true;

    while stdout_open || stderr_open {
        let line = tokio::select! {
            line = stdout_lines.next_line(), if stdout_open => {
                match line {
                    Ok(Some(line)) => Some(line),
                    _ => {
                        stdout_open = false;
                        None
                    }
                }
            }
            line = stderr_lines.next_line(), if stderr_open => {
                match line {
                    Ok(Some(line)) => Some(line),
                    _ => {
                        stderr_open = false;
                        None
                    }
                }
            }
        };

        if let Some(line) = line {
            tracing::trace!("Browser output: {}", line);
            if READY_MARKERS.iter().any(|marker| line.contains(marker)) {
                return true;
            }
        }
    }

    false
}

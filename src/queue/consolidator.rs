//! The consolidation routine the worker drives.
//!
//! Provides the [`Consolidator`] trait and [`CommandConsolidator`], which runs an
//! external program per session and reads a JSON [`ConsolidationReport`] from its
//! stdout. Closures with the same signature implement the trait too.

use anyhow::{anyhow, bail, Context, Result};
use serde::{Deserialize, Serialize};
use std::io::Read;
use std::path::Path;
use std::process::{Child, Command, Stdio};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError};
use std::thread;
use std::time::{Duration, Instant};

use crate::config::ConsolidatorConfig;
use crate::memory::references::RefType;

const EXIT_POLL_INTERVAL: Duration = Duration::from_millis(50);
/// How long to wait for the output pipes to close once the child is gone.
const PIPE_DRAIN_GRACE: Duration = Duration::from_secs(2);

/// Counts produced by consolidating one session.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ConsolidationReport {
    #[serde(default)]
    pub new_count: u32,
    #[serde(default)]
    pub updated_count: u32,
    #[serde(default)]
    pub duplicate_count: u32,
    /// References the new or updated memories hold on existing memories.
    #[serde(default)]
    pub references: Vec<MemoryReference>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MemoryReference {
    pub memory_id: String,
    pub ref_type: RefType,
}

/// Distills one session transcript into memories. May fail arbitrarily.
pub trait Consolidator: Send + Sync {
    fn consolidate(&self, session_path: &Path, timeout: Duration) -> Result<ConsolidationReport>;
}

impl<F> Consolidator for F
where
    F: Fn(&Path, Duration) -> Result<ConsolidationReport> + Send + Sync,
{
    fn consolidate(&self, session_path: &Path, timeout: Duration) -> Result<ConsolidationReport> {
        self(session_path, timeout)
    }
}

/// Runs `command [args...] <session_path>` and parses its stdout.
#[derive(Debug, Clone)]
pub struct CommandConsolidator {
    program: String,
    args: Vec<String>,
}

impl CommandConsolidator {
    pub fn new(program: impl Into<String>, args: Vec<String>) -> Self {
        Self {
            program: program.into(),
            args,
        }
    }

    pub fn from_config(config: &ConsolidatorConfig) -> Result<Self> {
        if config.command.trim().is_empty() {
            bail!("no consolidator configured; set [consolidator] command in config.toml");
        }
        Ok(Self::new(config.command.clone(), config.args.clone()))
    }
}

impl Consolidator for CommandConsolidator {
    fn consolidate(&self, session_path: &Path, timeout: Duration) -> Result<ConsolidationReport> {
        let mut command = Command::new(&self.program);
        command
            .args(&self.args)
            .arg(session_path)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        // Own process group, so a timeout kills whatever the program spawned too.
        #[cfg(unix)]
        {
            use std::os::unix::process::CommandExt;
            command.process_group(0);
        }
        let mut child = command
            .spawn()
            .with_context(|| format!("failed to start consolidator `{}`", self.program))?;

        // Drain both pipes on their own threads so a chatty child cannot block on a full pipe.
        let stdout_reader = spawn_reader(child.stdout.take());
        let stderr_reader = spawn_reader(child.stderr.take());

        let deadline = Instant::now() + timeout;
        let status = loop {
            if let Some(status) = child.try_wait().context("failed to poll consolidator")? {
                break status;
            }
            if Instant::now() >= deadline {
                kill_process_tree(&mut child);
                let _ = child.wait();
                // Bounded, so a descendant that escaped the group cannot pin these threads.
                let _ = recv_pipe(&stdout_reader);
                let _ = recv_pipe(&stderr_reader);
                bail!(
                    "consolidation of {} timed out after {:?}",
                    session_path.display(),
                    timeout
                );
            }
            thread::sleep(EXIT_POLL_INTERVAL);
        };

        let stdout = recv_pipe(&stdout_reader).context("failed to read consolidator output")?;
        let stderr = recv_pipe(&stderr_reader).unwrap_or_default();

        if !status.success() {
            bail!("consolidator exited with {status}: {}", stderr.trim());
        }

        serde_json::from_str(stdout.trim())
            .with_context(|| format!("consolidator produced invalid report: {}", stdout.trim()))
    }
}

fn spawn_reader(pipe: Option<impl Read + Send + 'static>) -> Receiver<std::io::Result<String>> {
    let (tx, rx) = mpsc::channel();
    thread::spawn(move || {
        let _ = tx.send(read_pipe(pipe));
    });
    rx
}

fn recv_pipe(reader: &Receiver<std::io::Result<String>>) -> Result<String> {
    match reader.recv_timeout(PIPE_DRAIN_GRACE) {
        Ok(output) => Ok(output?),
        Err(RecvTimeoutError::Timeout) => {
            Err(anyhow!("consolidator output still open {PIPE_DRAIN_GRACE:?} after exit"))
        }
        Err(RecvTimeoutError::Disconnected) => Err(anyhow!("consolidator pipe reader panicked")),
    }
}

fn read_pipe(pipe: Option<impl Read>) -> std::io::Result<String> {
    let mut buf = String::new();
    if let Some(mut pipe) = pipe {
        pipe.read_to_string(&mut buf)?;
    }
    Ok(buf)
}

fn kill_process_tree(child: &mut Child) {
    #[cfg(unix)]
    {
        if let Ok(pgid) = libc::pid_t::try_from(child.id()) {
            // SAFETY: killpg only sends a signal; the group was created at spawn.
            if unsafe { libc::killpg(pgid, libc::SIGKILL) } == 0 {
                return;
            }
            tracing::warn!(
                error = %std::io::Error::last_os_error(),
                "failed to kill consolidator process group"
            );
        }
    }
    if let Err(e) = child.kill() {
        tracing::warn!(error = %e, "failed to kill timed-out consolidator");
    }
}

//! Out-of-process remuxer.
//!
//! The capture pipeline never parses media containers itself; it pipes the
//! concatenated segment bytes through an external stream-copy process
//! (ffmpeg in production) and reads the fragmented-MP4 result from its
//! stdout. Stderr is collected into a bounded ring log, which is where the
//! final duration is scraped from.

mod duration;
mod ring_log;

pub use duration::parse_last_duration;
pub use ring_log::RingLog;

use std::process::Stdio;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, ChildStdin, ChildStdout, Command};
use tokio::task::JoinHandle;
use tracing::{debug, info};

#[derive(Debug, thiserror::Error)]
pub enum RemuxError {
    #[error("failed to spawn remuxer `{program}`: {source}")]
    Spawn {
        program: String,
        source: std::io::Error,
    },

    #[error("remuxer stdio was not piped")]
    MissingStdio,

    #[error("I/O error: {source}")]
    Io {
        #[from]
        source: std::io::Error,
    },
}

/// Command line of the remuxer process.
#[derive(Debug, Clone)]
pub struct RemuxSpec {
    pub program: String,
    pub args: Vec<String>,
}

impl RemuxSpec {
    /// The production contract: stream-copy the stdin byte stream into a
    /// fragmented MP4 on stdout, converting ADTS audio framing on the way.
    pub fn ffmpeg(binary: impl Into<String>) -> Self {
        let args = [
            "-i",
            "pipe:0",
            "-c",
            "copy",
            "-movflags",
            "frag_keyframe+empty_moov",
            "-max_muxing_queue_size",
            "1024",
            "-bsf:a",
            "aac_adtstoasc",
            "-f",
            "mp4",
            "-hide_banner",
            "pipe:1",
        ];
        Self {
            program: binary.into(),
            args: args.iter().map(|s| s.to_string()).collect(),
        }
    }

    /// Spawns the process with piped stdio and starts the stderr collector.
    pub fn spawn(&self, log: Arc<RingLog>) -> Result<Remuxer, RemuxError> {
        let mut child = Command::new(&self.program)
            .args(&self.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|source| RemuxError::Spawn {
                program: self.program.clone(),
                source,
            })?;

        let stdin = child.stdin.take().ok_or(RemuxError::MissingStdio)?;
        let stdout = child.stdout.take().ok_or(RemuxError::MissingStdio)?;
        let stderr = child.stderr.take().ok_or(RemuxError::MissingStdio)?;

        let stderr_log = log.clone();
        let stderr_task = tokio::spawn(async move {
            let mut lines = BufReader::new(stderr).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                stderr_log.push(line);
            }
        });

        info!(program = %self.program, "started remuxer");
        Ok(Remuxer {
            child,
            stdin: Some(stdin),
            stdout: Some(stdout),
            stderr_task,
            log,
        })
    }
}

/// A running remuxer process. The caller takes the exclusive stdin write
/// half and stdout read half; closing stdin is what makes the process
/// finish and its stdout return EOF.
pub struct Remuxer {
    child: Child,
    stdin: Option<ChildStdin>,
    stdout: Option<ChildStdout>,
    stderr_task: JoinHandle<()>,
    log: Arc<RingLog>,
}

impl Remuxer {
    pub fn take_stdin(&mut self) -> Option<ChildStdin> {
        self.stdin.take()
    }

    pub fn take_stdout(&mut self) -> Option<ChildStdout> {
        self.stdout.take()
    }

    pub fn log(&self) -> Arc<RingLog> {
        self.log.clone()
    }

    /// Waits for process exit and drains the stderr collector. A non-zero
    /// exit is reported through the log, not as an error: by the time the
    /// remuxer exits the capture outcome is decided by the byte counts.
    pub async fn wait(mut self) -> Result<std::process::ExitStatus, RemuxError> {
        let status = self.child.wait().await?;
        let _ = (&mut self.stderr_task).await;
        debug!(%status, "remuxer exited");
        Ok(status)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    #[cfg(unix)]
    #[tokio::test]
    async fn passthrough_program_round_trips_bytes_and_exits_on_stdin_close() {
        let spec = RemuxSpec {
            program: "cat".to_string(),
            args: Vec::new(),
        };
        let log = Arc::new(RingLog::new(16));
        let mut remuxer = spec.spawn(log).unwrap();

        let mut stdin = remuxer.take_stdin().unwrap();
        let mut stdout = remuxer.take_stdout().unwrap();

        let writer = tokio::spawn(async move {
            stdin.write_all(b"segment-bytes").await.unwrap();
            stdin.shutdown().await.unwrap();
        });

        let mut out = Vec::new();
        stdout.read_to_end(&mut out).await.unwrap();
        writer.await.unwrap();

        assert_eq!(out, b"segment-bytes");
        assert!(remuxer.wait().await.unwrap().success());
    }

    #[tokio::test]
    async fn missing_binary_is_a_spawn_error() {
        let spec = RemuxSpec::ffmpeg("definitely-not-a-remuxer-binary");
        let log = Arc::new(RingLog::new(16));
        assert!(matches!(
            spec.spawn(log),
            Err(RemuxError::Spawn { .. })
        ));
    }
}

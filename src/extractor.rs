use std::{ffi::OsStr, io, process::Stdio, time::Duration};

use axum::body::Bytes;
use futures::StreamExt;
use tokio::{
    io::{AsyncBufReadExt, BufReader},
    process::{Child, ChildStderr, ChildStdout, Command},
    sync::watch,
};
use tokio_util::{io::ReaderStream, sync::CancellationToken};
use tracing::{debug, warn};
use uuid::Uuid;

const STDOUT_CHUNK_BYTES: usize = 64 * 1024;

/// How to launch the extraction executable. `base_args` come before any
/// per-invocation arguments, which allows e.g. `python3 -m yt_dlp`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExtractorCommand {
    pub program: String,
    pub base_args: Vec<String>,
}

impl ExtractorCommand {
    pub fn parse(value: &str) -> Option<Self> {
        let mut parts = value.split_whitespace().map(ToString::to_string);
        let program = parts.next()?;
        Some(Self {
            program,
            base_args: parts.collect(),
        })
    }

    pub fn command<I, S>(&self, args: I) -> Command
    where
        I: IntoIterator<Item = S>,
        S: AsRef<OsStr>,
    {
        let mut command = Command::new(&self.program);
        command
            .args(&self.base_args)
            .args(args)
            .stdin(Stdio::null())
            .kill_on_drop(true);
        command
    }
}

impl Default for ExtractorCommand {
    fn default() -> Self {
        Self {
            program: "yt-dlp".to_string(),
            base_args: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessState {
    Running,
    /// Exit code, `None` when the process died from a signal.
    Exited(Option<i32>),
    Killed,
}

impl ProcessState {
    pub fn is_success(self) -> bool {
        self == ProcessState::Exited(Some(0))
    }
}

/// A running extraction subprocess.
///
/// The child itself lives in a supervisor task that waits for it to exit or
/// for the cancellation token to fire, whichever comes first. Dropping this
/// value (or calling [`ExtractionProcess::terminate`]) fires the token, so
/// the subprocess cannot outlive its owner.
pub struct ExtractionProcess {
    stdout: ReaderStream<ChildStdout>,
    state: watch::Receiver<ProcessState>,
    cancel: CancellationToken,
}

impl ExtractionProcess {
    pub fn spawn(
        extractor: &ExtractorCommand,
        args: &[String],
        max_duration: Option<Duration>,
        request_id: Uuid,
    ) -> io::Result<Self> {
        let mut command = extractor.command(args);
        command.stdout(Stdio::piped()).stderr(Stdio::piped());
        let mut child = command.spawn()?;

        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| io::Error::other("extractor stdout was not captured"))?;
        if let Some(stderr) = child.stderr.take() {
            tokio::spawn(log_stderr(stderr, request_id));
        }

        let pid = child.id();
        let cancel = CancellationToken::new();
        let (state_tx, state_rx) = watch::channel(ProcessState::Running);
        tokio::spawn(supervise(
            child,
            cancel.clone(),
            max_duration,
            state_tx,
            request_id,
        ));

        debug!(%request_id, ?pid, "Extractor spawned");

        Ok(Self {
            stdout: ReaderStream::with_capacity(stdout, STDOUT_CHUNK_BYTES),
            state: state_rx,
            cancel,
        })
    }

    /// Next chunk of stdout, `None` once the pipe is closed.
    pub async fn next_chunk(&mut self) -> Option<io::Result<Bytes>> {
        self.stdout.next().await
    }

    /// Waits until the supervisor has observed the end of the process.
    pub async fn wait(&mut self) -> ProcessState {
        match self
            .state
            .wait_for(|state| *state != ProcessState::Running)
            .await
        {
            Ok(state) => *state,
            Err(_) => ProcessState::Killed,
        }
    }

    #[cfg(test)]
    fn subscribe(&self) -> watch::Receiver<ProcessState> {
        self.state.clone()
    }

    /// Forcibly kills the subprocess. No-op once it is gone.
    pub fn terminate(&self) {
        self.cancel.cancel();
    }
}

impl Drop for ExtractionProcess {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

async fn supervise(
    mut child: Child,
    cancel: CancellationToken,
    max_duration: Option<Duration>,
    state: watch::Sender<ProcessState>,
    request_id: Uuid,
) {
    let deadline = async move {
        match max_duration {
            Some(limit) => tokio::time::sleep(limit).await,
            None => std::future::pending::<()>().await,
        }
    };

    let outcome = tokio::select! {
        status = child.wait() => match status {
            Ok(status) => ProcessState::Exited(status.code()),
            Err(error) => {
                warn!(%request_id, "Could not wait on extractor: {error}");
                ProcessState::Exited(None)
            }
        },
        () = cancel.cancelled() => kill(&mut child, request_id).await,
        () = deadline => {
            warn!(%request_id, ?max_duration, "Extractor exceeded its maximum run time");
            kill(&mut child, request_id).await
        }
    };

    debug!(%request_id, ?outcome, "Extractor finished");
    state.send_replace(outcome);
}

async fn kill(child: &mut Child, request_id: Uuid) -> ProcessState {
    match child.kill().await {
        Ok(()) => ProcessState::Killed,
        Err(error) => {
            debug!(%request_id, "Extractor kill skipped: {error}");
            match child.try_wait() {
                Ok(Some(status)) => ProcessState::Exited(status.code()),
                _ => ProcessState::Killed,
            }
        }
    }
}

async fn log_stderr(stderr: ChildStderr, request_id: Uuid) {
    let mut lines = BufReader::new(stderr).lines();
    loop {
        match lines.next_line().await {
            Ok(Some(line)) => {
                let line = line.trim();
                if !line.is_empty() {
                    warn!(%request_id, "[yt-dlp] {line}");
                }
            }
            Ok(None) => break,
            Err(error) => {
                debug!(%request_id, "Stopped reading extractor stderr: {error}");
                break;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use tokio::time::timeout;

    use super::*;

    fn shell(script: &str) -> ExtractorCommand {
        ExtractorCommand {
            program: "sh".to_string(),
            base_args: vec!["-c".to_string(), script.to_string(), "extractor".to_string()],
        }
    }

    fn spawn(script: &str, max_duration: Option<Duration>) -> ExtractionProcess {
        ExtractionProcess::spawn(&shell(script), &[], max_duration, Uuid::new_v4()).unwrap()
    }

    #[test]
    fn parse_splits_program_from_base_args() {
        let parsed = ExtractorCommand::parse("  python3 -m   yt_dlp ").unwrap();
        assert_eq!(parsed.program, "python3");
        assert_eq!(parsed.base_args, vec!["-m", "yt_dlp"]);
        assert!(ExtractorCommand::parse("   ").is_none());
    }

    #[tokio::test]
    async fn forwards_stdout_and_reports_clean_exit() {
        let mut process = spawn("printf 'hello'", None);

        let mut received = Vec::new();
        while let Some(chunk) = process.next_chunk().await {
            received.extend_from_slice(&chunk.unwrap());
        }

        assert_eq!(received, b"hello");
        assert!(process.wait().await.is_success());
    }

    #[tokio::test]
    async fn reports_nonzero_exit() {
        let mut process = spawn("echo 'ERROR: video unavailable' >&2; exit 3", None);

        assert!(process.next_chunk().await.is_none());
        assert_eq!(process.wait().await, ProcessState::Exited(Some(3)));
    }

    #[tokio::test]
    async fn terminate_kills_a_streaming_process_and_is_idempotent() {
        let mut process = spawn("printf 'ready'; exec sleep 30", None);

        let first = process.next_chunk().await.unwrap().unwrap();
        assert_eq!(&first[..], b"ready");

        process.terminate();
        process.terminate();
        let state = timeout(Duration::from_secs(5), process.wait())
            .await
            .expect("subprocess was not terminated in time");
        assert_eq!(state, ProcessState::Killed);

        process.terminate();
    }

    #[tokio::test]
    async fn dropping_the_handle_kills_the_process() {
        let process = spawn("exec sleep 30", None);
        let mut state = process.subscribe();
        drop(process);

        let observed = timeout(
            Duration::from_secs(5),
            state.wait_for(|state| *state != ProcessState::Running),
        )
        .await
        .expect("subprocess outlived its handle")
        .map(|state| *state)
        .unwrap();
        assert_eq!(observed, ProcessState::Killed);
    }

    #[tokio::test]
    async fn watchdog_kills_processes_that_run_too_long() {
        let mut process = spawn("exec sleep 30", Some(Duration::from_millis(100)));

        let state = timeout(Duration::from_secs(5), process.wait())
            .await
            .expect("watchdog did not fire");
        assert_eq!(state, ProcessState::Killed);
    }

    #[tokio::test]
    async fn spawn_fails_for_missing_executable() {
        let missing = ExtractorCommand {
            program: "/nonexistent/yt-dlp".to_string(),
            base_args: Vec::new(),
        };

        let error = ExtractionProcess::spawn(&missing, &[], None, Uuid::new_v4())
            .err()
            .unwrap();
        assert_eq!(error.kind(), io::ErrorKind::NotFound);
    }
}

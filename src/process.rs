//! Child process plumbing shared by the framework adapters.

use std::collections::HashMap;
use std::io::{BufRead, BufReader, Read};
use std::path::PathBuf;
use std::process::{Command, Stdio};
use std::sync::mpsc::{self, RecvTimeoutError, Sender};
use std::time::Duration;

use crate::data::StopSignal;
use crate::{Error, Result};

const POLL_INTERVAL: Duration = Duration::from_millis(50);

#[derive(Debug, Clone, Default)]
pub struct TestCommand {
    pub program: String,
    pub args: Vec<String>,
    pub cwd: Option<PathBuf>,
    pub env: HashMap<String, String>,
}

impl TestCommand {
    pub fn new(program: impl Into<String>) -> Self {
        Self { program: program.into(), ..Default::default() }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn cwd(mut self, cwd: impl Into<PathBuf>) -> Self {
        self.cwd = Some(cwd.into());
        self
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    /// Human-readable command line for logs and errors.
    pub fn display(&self) -> String {
        std::iter::once(self.program.as_str())
            .chain(self.args.iter().map(String::as_str))
            .collect::<Vec<_>>()
            .join(" ")
    }

    fn to_command(&self) -> Command {
        let mut command = Command::new(&self.program);
        command.args(&self.args).envs(&self.env).stdin(Stdio::null());
        if let Some(cwd) = &self.cwd {
            command.current_dir(cwd);
        }
        command
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputSource {
    Stdout,
    Stderr,
}

#[derive(Debug, Clone)]
pub struct ProcessOutput {
    pub stdout: String,
    pub stderr: String,
    pub exit_code: i32,
}

/// Run to completion and capture both streams. Exit codes outside
/// `success_codes` are reported as [`Error::CommandFailed`].
pub fn run_to_string(cmd: &TestCommand, success_codes: &[i32]) -> Result<ProcessOutput> {
    tracing::debug!("Running {}", cmd.display());
    let output = cmd
        .to_command()
        .output()
        .map_err(|source| Error::ProcessLaunch { command: cmd.display(), source })?;

    let result = ProcessOutput {
        stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
        stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        exit_code: output.status.code().unwrap_or(-1),
    };

    if !success_codes.contains(&result.exit_code) {
        return Err(Error::CommandFailed {
            command: cmd.display(),
            code: result.exit_code,
            stderr: result.stderr.trim().to_string(),
        });
    }
    Ok(result)
}

/// Run while forwarding each output line, newline included, to `on_output`
/// as it arrives. The child is killed once `stop` is raised.
///
/// Returns the exit code, or `None` if the process died from a signal.
pub fn run_streamed<F>(cmd: &TestCommand, stop: &StopSignal, mut on_output: F) -> Result<Option<i32>>
where
    F: FnMut(OutputSource, &str),
{
    tracing::debug!("Streaming {}", cmd.display());
    let mut child = cmd
        .to_command()
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()
        .map_err(|source| Error::ProcessLaunch { command: cmd.display(), source })?;

    let (tx, rx) = mpsc::channel();
    if let Some(stdout) = child.stdout.take() {
        spawn_reader(stdout, OutputSource::Stdout, tx.clone());
    }
    if let Some(stderr) = child.stderr.take() {
        spawn_reader(stderr, OutputSource::Stderr, tx.clone());
    }
    drop(tx);

    let mut killed = false;
    loop {
        match rx.recv_timeout(POLL_INTERVAL) {
            Ok((source, line)) => on_output(source, &line),
            Err(RecvTimeoutError::Timeout) => {}
            Err(RecvTimeoutError::Disconnected) => break,
        }

        if !killed && stop.is_stopped() {
            tracing::info!("Stopping {}", cmd.display());
            if let Err(e) = child.kill() {
                tracing::warn!("Failed to kill {}: {}", cmd.display(), e);
            }
            killed = true;
        }

        // Grandchildren may keep the pipes open after a kill.
        if killed {
            let exited = match child.try_wait() {
                Ok(status) => status.is_some(),
                Err(e) => {
                    tracing::warn!("Failed to poll {}: {}", cmd.display(), e);
                    true
                }
            };
            if exited {
                while let Ok((source, line)) = rx.try_recv() {
                    on_output(source, &line);
                }
                break;
            }
        }
    }

    let status = child.wait()?;
    Ok(status.code())
}

fn spawn_reader<R: Read + Send + 'static>(pipe: R, source: OutputSource, tx: Sender<(OutputSource, String)>) {
    std::thread::spawn(move || {
        let mut reader = BufReader::new(pipe);
        let mut buf = Vec::new();
        loop {
            buf.clear();
            match reader.read_until(b'\n', &mut buf) {
                Ok(0) => break,
                Ok(_) => {
                    let line = String::from_utf8_lossy(&buf).into_owned();
                    if tx.send((source, line)).is_err() {
                        break;
                    }
                }
                Err(e) => {
                    tracing::debug!("Output reader stopped: {}", e);
                    break;
                }
            }
        }
    });
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use std::time::Instant;

    fn sh(script: &str) -> TestCommand {
        TestCommand::new("sh").args(["-c", script])
    }

    #[test]
    fn test_run_to_string_captures_streams() {
        let output = run_to_string(&sh("echo out; echo err >&2"), &[0]).unwrap();
        assert_eq!(output.stdout, "out\n");
        assert_eq!(output.stderr, "err\n");
        assert_eq!(output.exit_code, 0);
    }

    #[test]
    fn test_run_to_string_rejects_unexpected_exit_code() {
        let err = run_to_string(&sh("echo nope >&2; exit 3"), &[0]).unwrap_err();
        match err {
            Error::CommandFailed { code, stderr, .. } => {
                assert_eq!(code, 3);
                assert_eq!(stderr, "nope");
            }
            other => panic!("unexpected error: {other}"),
        }
        assert!(run_to_string(&sh("exit 5"), &[0, 5]).is_ok());
    }

    #[test]
    fn test_launch_failure() {
        let err = run_to_string(&TestCommand::new("/nonexistent/binary"), &[0]).unwrap_err();
        assert!(matches!(err, Error::ProcessLaunch { .. }));
    }

    #[test]
    fn test_working_directory_and_env() {
        let dir = tempfile::tempdir().unwrap();
        let cmd = sh("pwd; echo $TE_VALUE").cwd(dir.path()).env("TE_VALUE", "42");
        let output = run_to_string(&cmd, &[0]).unwrap();
        let canonical = dir.path().canonicalize().unwrap();
        assert!(output.stdout.contains(canonical.to_str().unwrap()));
        assert!(output.stdout.ends_with("42\n"));
    }

    #[test]
    fn test_streamed_lines_in_order() {
        let mut lines = Vec::new();
        let code = run_streamed(&sh("echo a; echo b; printf c"), &StopSignal::new(), |source, line| {
            assert_eq!(source, OutputSource::Stdout);
            lines.push(line.to_string());
        })
        .unwrap();
        assert_eq!(code, Some(0));
        assert_eq!(lines, vec!["a\n", "b\n", "c"]);
    }

    #[test]
    fn test_streamed_stop_kills_child() {
        let stop = StopSignal::new();
        let started = Instant::now();
        let mut seen = Vec::new();
        let code = run_streamed(&sh("echo ready; exec sleep 30"), &stop, |_, line| {
            seen.push(line.to_string());
            stop.stop();
        })
        .unwrap();
        assert_eq!(seen, vec!["ready\n"]);
        assert_eq!(code, None);
        assert!(started.elapsed() < Duration::from_secs(10));
    }

    #[test]
    fn test_streamed_stop_reaps_child_while_grandchild_holds_pipes() {
        let stop = StopSignal::new();
        let started = Instant::now();
        let code = run_streamed(&sh("sleep 30 & echo ready; wait"), &stop, |_, _| stop.stop()).unwrap();
        assert_eq!(code, None);
        assert!(started.elapsed() < Duration::from_secs(10));
    }
}

use crate::state::StepError;
use serde_json::json;
use std::collections::BTreeMap;
use std::io::{Read, Write};
use std::path::Path;
use std::process::{Child, Command, Stdio};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

/// One argv invocation. The command never goes through a shell; `argv[0]`
/// is the program and the rest are passed verbatim.
#[derive(Debug)]
pub struct CommandRequest<'a> {
    pub argv: &'a [String],
    pub cwd: &'a Path,
    /// Fully composed child environment (process env with secrets and step
    /// env already overlaid). Replaces the inherited environment.
    pub env: &'a BTreeMap<String, String>,
    /// Delivered to the child's stdin when present (stdin-mode providers).
    pub stdin: Option<&'a str>,
    pub timeout: Option<Duration>,
}

#[derive(Debug)]
pub struct CommandOutcome {
    pub exit_code: i32,
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
    pub duration_ms: u64,
    pub error: Option<StepError>,
}

impl CommandOutcome {
    fn spawn_failure(message: String, duration_ms: u64) -> Self {
        Self {
            exit_code: 1,
            stdout: Vec::new(),
            stderr: message.clone().into_bytes(),
            duration_ms,
            error: Some(StepError::new("execution_error", message, json!({}))),
        }
    }
}

pub fn run_command(request: &CommandRequest<'_>) -> CommandOutcome {
    let start = Instant::now();

    if request.argv.is_empty() {
        return CommandOutcome::spawn_failure("empty command".to_string(), 0);
    }

    let mut command = Command::new(&request.argv[0]);
    command
        .args(&request.argv[1..])
        .current_dir(request.cwd)
        .env_clear()
        .envs(request.env)
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());
    if request.stdin.is_some() {
        command.stdin(Stdio::piped());
    } else {
        command.stdin(Stdio::null());
    }

    let mut child = match command.spawn() {
        Ok(child) => child,
        Err(err) => {
            return CommandOutcome::spawn_failure(
                format!("failed to spawn {}: {err}", request.argv[0]),
                elapsed_ms(start),
            )
        }
    };

    let stdin_writer = take_stdin_writer(&mut child, request.stdin);
    let stdout_reader = take_reader(child.stdout.take());
    let stderr_reader = take_reader(child.stderr.take());

    let waited = wait_with_timeout(&mut child, request.timeout, start);

    if let Some(writer) = stdin_writer {
        let _ = writer.join();
    }
    let stdout = stdout_reader
        .and_then(|r| r.join().ok())
        .unwrap_or_default();
    let stderr = stderr_reader
        .and_then(|r| r.join().ok())
        .unwrap_or_default();

    match waited {
        Waited::Exited(code) => CommandOutcome {
            exit_code: code,
            stdout,
            stderr,
            duration_ms: elapsed_ms(start),
            error: None,
        },
        Waited::TimedOut(timeout) => {
            let timeout_sec = timeout.as_secs();
            CommandOutcome {
                exit_code: 124,
                stdout,
                stderr,
                duration_ms: elapsed_ms(start),
                error: Some(StepError::new(
                    "timeout",
                    format!("command timed out after {timeout_sec} seconds"),
                    json!({"timeout_sec": timeout_sec}),
                )),
            }
        }
        Waited::WaitFailed(message) => CommandOutcome {
            exit_code: 1,
            stdout,
            stderr,
            duration_ms: elapsed_ms(start),
            error: Some(StepError::new("execution_error", message, json!({}))),
        },
    }
}

enum Waited {
    Exited(i32),
    TimedOut(Duration),
    WaitFailed(String),
}

fn wait_with_timeout(child: &mut Child, timeout: Option<Duration>, start: Instant) -> Waited {
    loop {
        match child.try_wait() {
            Ok(Some(status)) => return Waited::Exited(status.code().unwrap_or(-1)),
            Ok(None) => {
                if let Some(limit) = timeout {
                    if start.elapsed() > limit {
                        let _ = child.kill();
                        let _ = child.wait();
                        return Waited::TimedOut(limit);
                    }
                }
                thread::sleep(Duration::from_millis(10));
            }
            Err(err) => {
                let _ = child.kill();
                let _ = child.wait();
                return Waited::WaitFailed(format!("failed to wait on child: {err}"));
            }
        }
    }
}

fn take_reader<R: Read + Send + 'static>(pipe: Option<R>) -> Option<JoinHandle<Vec<u8>>> {
    pipe.map(|mut reader| {
        thread::spawn(move || {
            let mut buf = Vec::new();
            let _ = reader.read_to_end(&mut buf);
            buf
        })
    })
}

fn take_stdin_writer(child: &mut Child, stdin: Option<&str>) -> Option<JoinHandle<()>> {
    let content = stdin?.as_bytes().to_vec();
    let mut pipe = child.stdin.take()?;
    Some(thread::spawn(move || {
        let _ = pipe.write_all(&content);
    }))
}

fn elapsed_ms(start: Instant) -> u64 {
    start.elapsed().as_millis() as u64
}

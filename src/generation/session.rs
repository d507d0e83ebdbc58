//! One worker invocation, streamed line by line.
//!
//! The read loop has two independent exits besides end-of-output: a polled predicate checked
//! after every line (soft stop, no error recorded) and a [`CancellationToken`] watched while
//! waiting for output (forced stop, records [`GenerationError::Cancelled`]). Every exit path
//! returns whatever was aggregated so far, and the worker is always reaped.

use std::collections::VecDeque;
use std::process::Stdio;
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::{Child, Command};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use super::{aggregator, Aggregate, GenerationRequest, GenerationResult, Mode};
use crate::config::{GenerationConfig, LoggingConfig};
use crate::error::GenerationError;

/// How many trailing stderr lines are kept for the exit report.
const STDERR_TAIL: usize = 20;
/// How long a finished worker's stderr gets to flush before the drain is abandoned.
const STDERR_FLUSH: Duration = Duration::from_millis(500);

/// Spawns and streams the generation worker.
#[derive(Debug, Clone)]
pub struct GenerationSession {
    program: String,
    run_args: Vec<String>,
    model: String,
    format_args: Vec<String>,
    echo_stderr: bool,
}

/// Why the read loop ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Stop {
    Eof,
    Polled,
    Cancelled,
    ReadFailed,
}

impl GenerationSession {
    pub fn new(generation: &GenerationConfig, logging: &LoggingConfig) -> Self {
        Self {
            program: generation.program.clone(),
            run_args: generation.run_args.clone(),
            model: generation.model.clone(),
            format_args: generation.format_args.clone(),
            echo_stderr: logging.echo_worker_stderr,
        }
    }

    /// Arguments after the program name: run args, model, payload, then format args
    /// in structured mode only.
    fn args(&self, mode: Mode, payload: String) -> Vec<String> {
        let mut args = self.run_args.clone();
        args.push(self.model.clone());
        args.push(payload);
        if mode == Mode::Structured {
            args.extend(self.format_args.iter().cloned());
        }
        args
    }

    /// Run one generation to completion, soft stop, or cancellation.
    ///
    /// `cancel_check` is polled after each line; returning `true` ends the stream without
    /// recording an error. Cancelling `token` kills the worker and records
    /// [`GenerationError::Cancelled`]. Both set `interrupted`.
    pub async fn run(
        &self,
        request: &GenerationRequest,
        cancel_check: impl Fn() -> bool,
        token: &CancellationToken,
    ) -> GenerationResult {
        let mode = request.mode;
        let payload = match request.payload.to_json() {
            Ok(payload) => payload,
            Err(e) => {
                return GenerationResult::spawn_failed(
                    mode,
                    GenerationError::Spawn {
                        program: self.program.clone(),
                        message: format!("{e:#}"),
                    },
                )
            }
        };

        let spawned = Command::new(&self.program)
            .args(self.args(mode, payload))
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn();
        let mut child = match spawned {
            Ok(child) => child,
            Err(e) => {
                tracing::warn!(program = %self.program, error = %e, "failed to start generation worker");
                return GenerationResult::spawn_failed(
                    mode,
                    GenerationError::Spawn {
                        program: self.program.clone(),
                        message: e.to_string(),
                    },
                );
            }
        };
        tracing::info!(%mode, model = %self.model, pid = ?child.id(), "generation started");

        let Some(stdout) = child.stdout.take() else {
            terminate(&mut child).await;
            return GenerationResult::spawn_failed(
                mode,
                GenerationError::Spawn {
                    program: self.program.clone(),
                    message: "worker stdout was not captured".into(),
                },
            );
        };
        let stderr_task = child
            .stderr
            .take()
            .map(|stderr| tokio::spawn(drain_stderr(stderr, self.echo_stderr)));

        let mut reader = BufReader::new(stdout);
        let mut acc = Aggregate::empty(mode);
        let mut errors = Vec::new();
        let mut buf = Vec::new();
        let mut lines = 0usize;

        let stop = loop {
            buf.clear();
            let read = tokio::select! {
                biased;
                _ = token.cancelled() => break Stop::Cancelled,
                read = reader.read_until(b'\n', &mut buf) => read,
            };
            match read {
                Ok(0) => break Stop::Eof,
                Ok(_) => {
                    lines += 1;
                    match aggregator::decode_line(&buf) {
                        Ok(line) => {
                            let (next, line_errors) = aggregator::aggregate(&line, acc);
                            acc = next;
                            for e in line_errors {
                                tracing::debug!(line = lines, error = %e, "worker line rejected");
                                errors.push(e);
                            }
                        }
                        Err(e) => {
                            tracing::debug!(line = lines, error = %e, "worker line undecodable");
                            errors.push(e);
                        }
                    }
                    if cancel_check() {
                        break Stop::Polled;
                    }
                }
                Err(e) => {
                    tracing::warn!(error = %e, "reading worker output failed");
                    errors.push(GenerationError::Io {
                        message: e.to_string(),
                    });
                    break Stop::ReadFailed;
                }
            }
        };
        drop(reader);

        let mut interrupted = false;
        match stop {
            Stop::Cancelled => {
                terminate(&mut child).await;
                abort_stderr(stderr_task);
                errors.push(GenerationError::Cancelled);
                interrupted = true;
            }
            Stop::Polled => {
                terminate(&mut child).await;
                finish_stderr(stderr_task).await;
                interrupted = true;
            }
            Stop::ReadFailed => {
                terminate(&mut child).await;
                finish_stderr(stderr_task).await;
            }
            Stop::Eof => {
                let exited = tokio::select! {
                    biased;
                    _ = token.cancelled() => None,
                    status = child.wait() => Some(status),
                };
                match exited {
                    None => {
                        terminate(&mut child).await;
                        abort_stderr(stderr_task);
                        errors.push(GenerationError::Cancelled);
                        interrupted = true;
                    }
                    Some(Ok(status)) => {
                        let tail = finish_stderr(stderr_task).await;
                        if !status.success() {
                            tracing::warn!(%status, stderr = %tail.join("\n"), "generation worker failed");
                            errors.push(GenerationError::WorkerExit {
                                status: status.to_string(),
                            });
                        }
                    }
                    Some(Err(e)) => {
                        finish_stderr(stderr_task).await;
                        errors.push(GenerationError::Io {
                            message: format!("failed to wait for worker: {e}"),
                        });
                    }
                }
            }
        }

        tracing::info!(
            %mode,
            lines,
            errors = errors.len(),
            interrupted,
            ?stop,
            "generation finished"
        );
        GenerationResult {
            aggregate: acc,
            errors,
            interrupted,
        }
    }
}

/// Kill the worker if it is still running and reap it.
async fn terminate(child: &mut Child) {
    if let Err(e) = child.start_kill() {
        tracing::debug!(error = %e, "worker already exited");
    }
    match child.wait().await {
        Ok(status) => tracing::debug!(%status, "worker reaped"),
        Err(e) => tracing::warn!(error = %e, "failed to reap worker"),
    }
}

/// Forward worker stderr to the log, keeping the last few lines.
async fn drain_stderr(stderr: impl AsyncRead + Unpin, echo: bool) -> Vec<String> {
    let mut reader = BufReader::new(stderr);
    let mut tail = VecDeque::with_capacity(STDERR_TAIL);
    let mut buf = Vec::new();
    loop {
        buf.clear();
        match reader.read_until(b'\n', &mut buf).await {
            Ok(0) => break,
            Ok(_) => {
                let line = String::from_utf8_lossy(&buf).trim_end().to_string();
                if line.is_empty() {
                    continue;
                }
                if echo {
                    tracing::info!(target: "worker", "{line}");
                } else {
                    tracing::debug!(target: "worker", "{line}");
                }
                if tail.len() == STDERR_TAIL {
                    tail.pop_front();
                }
                tail.push_back(line);
            }
            Err(e) => {
                tracing::debug!(error = %e, "worker stderr closed");
                break;
            }
        }
    }
    tail.into()
}

async fn finish_stderr(task: Option<JoinHandle<Vec<String>>>) -> Vec<String> {
    let Some(mut task) = task else {
        return Vec::new();
    };
    match tokio::time::timeout(STDERR_FLUSH, &mut task).await {
        Ok(Ok(tail)) => tail,
        Ok(Err(e)) => {
            tracing::debug!(error = %e, "stderr drain task failed");
            Vec::new()
        }
        Err(_) => {
            task.abort();
            Vec::new()
        }
    }
}

fn abort_stderr(task: Option<JoinHandle<Vec<String>>>) {
    if let Some(task) = task {
        task.abort();
    }
}

//! Long-lived exiftool session.
//!
//! The tool is launched once per worker in keep-alive mode (`-stay_open
//! True -@ -`) and fed argument batches on stdin, each terminated by
//! `-execute`. Output has no reliable framing beyond the `{ready}` marker
//! the tool prints after each batch, so the per-batch exit status is
//! captured by echoing a deterministic marker line through `-echo3`.
//!
//! stdout and stderr are drained by two reader threads into one channel;
//! the session consumes lines with a per-line ready timeout. A timeout
//! kills the child and poisons the session.

use std::io::{self, BufRead, BufReader, Read, Write};
use std::path::Path;
use std::process::{Child, ChildStdin, Command, Stdio};
use std::sync::mpsc::{Receiver, RecvTimeoutError, Sender};
use std::sync::Mutex;
use std::time::Duration;

use thiserror::Error;

pub const STATUS_MARKER_PREFIX: &str = "__TAKEOUTFIX_STATUS__:";

const DEFAULT_READY_TIMEOUT: Duration = Duration::from_secs(60);

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("exiftool session is closed")]
    Closed,
    #[error("invalid exiftool argument: contains newline or null byte")]
    InvalidArgument,
    #[error("timeout waiting for exiftool ready marker")]
    ReadyTimeout { output: String },
    #[error("write command: {0}")]
    Write(#[source] io::Error),
    #[error("read output: {message}")]
    Read { message: String, output: String },
    #[error("{message}")]
    CommandFailed {
        status: i32,
        message: String,
        output: String,
    },
}

impl SessionError {
    /// Output captured before the failure, for corrupt-EXIF detection.
    pub fn output(&self) -> &str {
        match self {
            SessionError::ReadyTimeout { output }
            | SessionError::Read { output, .. }
            | SessionError::CommandFailed { output, .. } => output,
            _ => "",
        }
    }
}

pub struct Session {
    inner: Mutex<Inner>,
}

struct Inner {
    child: Child,
    stdin: Option<ChildStdin>,
    lines: Receiver<io::Result<String>>,
    ready_timeout: Duration,
    closed: bool,
}

impl Session {
    /// Launch the tool at `bin` in keep-alive mode.
    pub fn start(bin: &Path) -> io::Result<Self> {
        let mut cmd = Command::new(bin);
        cmd.args(["-stay_open", "True", "-@", "-"]);
        Self::start_with_command(cmd)
    }

    /// Launch an arbitrary command speaking the keep-alive protocol. Used by
    /// `start` and by tests with stub children.
    pub fn start_with_command(mut cmd: Command) -> io::Result<Self> {
        cmd.stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        let mut child = cmd.spawn()?;

        let stdin = child.stdin.take().expect("stdin piped");
        let stdout = child.stdout.take().expect("stdout piped");
        let stderr = child.stderr.take().expect("stderr piped");

        let (tx, rx) = std::sync::mpsc::channel();
        spawn_reader(stdout, tx.clone());
        spawn_reader(stderr, tx);

        Ok(Self {
            inner: Mutex::new(Inner {
                child,
                stdin: Some(stdin),
                lines: rx,
                ready_timeout: DEFAULT_READY_TIMEOUT,
                closed: false,
            }),
        })
    }

    pub fn set_ready_timeout(&self, timeout: Duration) {
        self.inner.lock().unwrap().ready_timeout = timeout;
    }

    /// Submit one argument batch and wait for `{ready}`. Concurrent calls
    /// serialize; one batch is outstanding at a time.
    pub fn run(&self, args: &[String]) -> Result<String, SessionError> {
        let mut inner = self.inner.lock().unwrap();

        if inner.closed {
            return Err(SessionError::Closed);
        }
        validate_args(args)?;

        {
            let stdin = inner.stdin.as_mut().expect("open session has stdin");
            for arg in args {
                writeln!(stdin, "{arg}").map_err(SessionError::Write)?;
            }
            writeln!(stdin, "-echo3").map_err(SessionError::Write)?;
            writeln!(stdin, "{STATUS_MARKER_PREFIX}${{status}}").map_err(SessionError::Write)?;
            writeln!(stdin, "-execute").map_err(SessionError::Write)?;
            stdin.flush().map_err(SessionError::Write)?;
        }

        let batch = match inner.read_until_ready() {
            Ok(batch) => batch,
            Err(err) => {
                if matches!(err, SessionError::ReadyTimeout { .. }) {
                    inner.terminate();
                }
                inner.closed = true;
                return Err(err);
            }
        };

        match batch.status {
            Some(0) => Ok(batch.output),
            Some(status) => Err(command_failed(status, batch.output)),
            None if has_error_line(&batch.output) => Err(command_failed(1, batch.output)),
            None => Ok(batch.output),
        }
    }

    /// Ask the tool to exit and reap it. Safe to call more than once.
    pub fn close(&self) -> io::Result<()> {
        let mut inner = self.inner.lock().unwrap();
        if inner.closed {
            return Ok(());
        }
        inner.closed = true;

        if let Some(mut stdin) = inner.stdin.take() {
            let write_result = stdin.write_all(b"-stay_open\nFalse\n");
            drop(stdin);
            write_result?;
        }
        inner.child.wait()?;
        Ok(())
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        let _ = self.close();
    }
}

struct BatchResult {
    output: String,
    status: Option<i32>,
}

impl Inner {
    fn read_until_ready(&mut self) -> Result<BatchResult, SessionError> {
        let mut output = String::new();
        let mut status = None;
        let timeout = self.ready_timeout;

        loop {
            let line = match self.lines.recv_timeout(timeout) {
                Ok(Ok(line)) => line,
                Ok(Err(err)) => {
                    return Err(SessionError::Read {
                        message: err.to_string(),
                        output,
                    });
                }
                Err(RecvTimeoutError::Timeout) => {
                    return Err(SessionError::ReadyTimeout { output });
                }
                Err(RecvTimeoutError::Disconnected) => {
                    return Err(SessionError::Read {
                        message: "unexpected end of output".to_string(),
                        output,
                    });
                }
            };

            let trimmed = line.trim();
            if trimmed.starts_with("{ready") {
                break;
            }
            if let Some(value) = trimmed.strip_prefix(STATUS_MARKER_PREFIX) {
                if let Ok(code) = value.trim().parse::<i32>() {
                    status = Some(code);
                    continue;
                }
            }
            output.push_str(&line);
            output.push('\n');
        }

        Ok(BatchResult { output, status })
    }

    fn terminate(&mut self) {
        self.stdin.take();
        let _ = self.child.kill();
        let _ = self.child.wait();
    }
}

fn spawn_reader(stream: impl Read + Send + 'static, tx: Sender<io::Result<String>>) {
    std::thread::spawn(move || {
        let reader = BufReader::new(stream);
        for line in reader.lines() {
            let failed = line.is_err();
            if tx.send(line).is_err() || failed {
                break;
            }
        }
    });
}

fn validate_args(args: &[String]) -> Result<(), SessionError> {
    for arg in args {
        if arg.contains(['\n', '\r', '\0']) {
            return Err(SessionError::InvalidArgument);
        }
    }
    Ok(())
}

fn command_failed(status: i32, output: String) -> SessionError {
    let message = match first_error_line(&output) {
        Some(line) => format!("exiftool command failed (status {status}): {line}"),
        None => format!("exiftool command failed with status {status}"),
    };
    SessionError::CommandFailed {
        status,
        message,
        output,
    }
}

fn has_error_line(output: &str) -> bool {
    first_error_line(output).is_some()
}

fn first_error_line(output: &str) -> Option<String> {
    output
        .lines()
        .map(str::trim)
        .find(|line| line.to_lowercase().starts_with("error:"))
        .map(str::to_string)
}

//! Blocking invocation of the external programs clevis bindings depend on.
//!
//! Shell integration stays isolated here so the wrappers above it only build
//! argument lists and interpret output.

use crate::error::{ClevisError, Result};
use std::ffi::OsStr;
use std::io::{ErrorKind, Read, Write};
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::thread;

#[derive(Debug, Clone)]
pub(crate) struct Tool {
    binary: PathBuf,
}

#[derive(Debug)]
pub(crate) struct Output {
    pub stdout: Vec<u8>,
    pub stderr: String,
    pub status: i32,
}

impl Output {
    pub fn success(&self) -> bool {
        self.status == 0
    }

    pub fn stdout_string(&self) -> String {
        String::from_utf8_lossy(&self.stdout).into_owned()
    }

    pub fn diagnostic(&self) -> String {
        let stderr = self.stderr.trim();
        if !stderr.is_empty() {
            return stderr.to_string();
        }
        let stdout = String::from_utf8_lossy(&self.stdout);
        match stdout.trim() {
            "" => "no additional output".to_string(),
            stdout => stdout.to_string(),
        }
    }
}

impl Tool {
    pub fn new(binary: impl Into<PathBuf>) -> Self {
        Self {
            binary: binary.into(),
        }
    }

    pub fn binary(&self) -> &Path {
        &self.binary
    }

    /// Run to completion; a non-zero exit is returned, not raised.
    pub fn run<I, S>(&self, args: I, input: Option<&[u8]>) -> Result<Output>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<OsStr>,
    {
        let mut command = Command::new(&self.binary);
        command.args(args);
        command.stdout(Stdio::piped());
        command.stderr(Stdio::piped());
        command.stdin(if input.is_some() {
            Stdio::piped()
        } else {
            Stdio::null()
        });
        log::debug!("running {:?}", command);

        let mut child = command.spawn()?;
        let stdout_handle = spawn_output_reader(child.stdout.take());
        let stderr_handle = spawn_output_reader(child.stderr.take());

        let mut written = Ok(());
        if let Some(payload) = input {
            if let Some(mut stdin) = child.stdin.take() {
                // A tool that exits without reading its input is judged by its status.
                written = match stdin.write_all(payload) {
                    Err(e) if e.kind() != ErrorKind::BrokenPipe => Err(e),
                    _ => Ok(()),
                };
            }
        }

        // Reap the child and its readers even when the input did not go through.
        let status = child.wait()?;
        let stdout = join_reader(stdout_handle)?;
        let stderr = String::from_utf8_lossy(&join_reader(stderr_handle)?).into_owned();
        written?;

        Ok(Output {
            stdout,
            stderr,
            status: status.code().unwrap_or(-1),
        })
    }

    pub fn run_checked<I, S>(&self, args: I, input: Option<&[u8]>) -> Result<Output>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<OsStr>,
    {
        let out = self.run(args, input)?;
        if out.success() {
            return Ok(out);
        }
        Err(self.failure(&out))
    }

    pub fn failure(&self, out: &Output) -> ClevisError {
        ClevisError::ExternalToolFailure {
            program: self.binary.display().to_string(),
            status: out.status,
            diagnostic: out.diagnostic(),
        }
    }
}

fn spawn_output_reader<R>(pipe: Option<R>) -> thread::JoinHandle<std::io::Result<Vec<u8>>>
where
    R: Read + Send + 'static,
{
    thread::spawn(move || {
        let mut buf = Vec::new();
        if let Some(mut reader) = pipe {
            reader.read_to_end(&mut buf)?;
        }
        Ok(buf)
    })
}

fn join_reader(handle: thread::JoinHandle<std::io::Result<Vec<u8>>>) -> Result<Vec<u8>> {
    let bytes = handle.join().map_err(|_| {
        std::io::Error::new(std::io::ErrorKind::Other, "output reader thread panicked")
    })??;
    Ok(bytes)
}

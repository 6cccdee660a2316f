//! Subject process execution.

use std::io::Read;
use std::path::{Component, Path, PathBuf};
use std::process::{Command, Stdio};
use std::thread;
use std::time::Duration;

use wait_timeout::ChildExt;

use crate::EnvError;

/// Captured output of one subject execution.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Observation {
    pub stdout: String,
    pub stderr: String,
    /// Exit code, if the subject exited rather than being signalled.
    pub status: Option<i32>,
}

impl Observation {
    /// Stdout and stderr concatenated, the raw material the drift check
    /// works from.
    pub fn combined(&self) -> String {
        format!("{}{}", self.stdout, self.stderr)
    }
}

/// Runs the subject with no arguments and piped stdio, killing it if it
/// outlives `timeout`.
pub fn run_subject(path: &Path, timeout: Duration) -> Result<Observation, EnvError> {
    let execution_error = |reason: String| EnvError::SubjectExecution {
        path: path.to_path_buf(),
        reason,
    };

    let mut child = Command::new(invocation_path(path))
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()
        .map_err(|err| execution_error(err.to_string()))?;

    // drain both pipes while waiting; a subject emitting more than a pipe
    // buffer would otherwise block forever before the wait returns
    let stdout = spawn_reader(child.stdout.take());
    let stderr = spawn_reader(child.stderr.take());

    match child.wait_timeout(timeout) {
        Ok(Some(status)) => Ok(Observation {
            stdout: join_reader(stdout),
            stderr: join_reader(stderr),
            status: status.code(),
        }),
        Ok(None) => {
            // the killed child's pipes hit EOF, so the reader threads finish
            // on their own
            let _ = child.kill();
            let _ = child.wait();
            Err(execution_error(format!(
                "timed out after {}s",
                timeout.as_secs_f64()
            )))
        }
        Err(err) => Err(execution_error(err.to_string())),
    }
}

fn spawn_reader<R: Read + Send + 'static>(source: Option<R>) -> Option<thread::JoinHandle<String>> {
    source.map(|mut reader| {
        thread::spawn(move || {
            let mut buffer = String::new();
            let _ = reader.read_to_string(&mut buffer);
            buffer
        })
    })
}

fn join_reader(handle: Option<thread::JoinHandle<String>>) -> String {
    handle
        .and_then(|handle| handle.join().ok())
        .unwrap_or_default()
}

/// A bare file name must be spelled `./name` to be found, since the
/// subject's directory is not on PATH.
fn invocation_path(path: &Path) -> PathBuf {
    let bare = path.components().count() == 1
        && matches!(path.components().next(), Some(Component::Normal(_)));
    if bare {
        Path::new(".").join(path)
    } else {
        path.to_path_buf()
    }
}

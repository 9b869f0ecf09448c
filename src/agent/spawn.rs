//! Build script supervision
//!
//! Runs a command with stdin from /dev/null and stdout/stderr piped.
//! Output is consumed line by line: mirrored to the terminal, appended to
//! the capture buffer (stderr lines prefixed with the EF BF B9 marker so
//! the streams can be reconstructed) and offered to a per-line interceptor.
//! A command that stays silent for the timeout window is killed.

use crate::error::DoozerError;
use colored::Colorize;
use std::io::IsTerminal;
use std::path::Path;
use std::process::Stdio;
use std::time::Duration;
use tokio::io::AsyncReadExt;
use tokio::process::Command;

/// Marker bytes inserted before every captured stderr line.
pub const STDERR_MARKER: [u8; 3] = [0xef, 0xbf, 0xb9];

/// Default "no output" timeout in seconds.
pub const DEFAULT_TIMEOUT: u64 = 600;

#[derive(Debug, PartialEq, Eq)]
pub enum SpawnResult {
    /// Process exited on its own; 0 is success, 127 means exec failure.
    Exited(i32),
    /// Killed after producing no output for the given number of seconds.
    NoOutput(u64),
    /// Terminated by a signal.
    Signaled(i32),
}

struct LineBuffer {
    data: Vec<u8>,
    stderr: bool,
    done: bool,
}

impl LineBuffer {
    fn new(stderr: bool) -> Self {
        Self {
            data: Vec::new(),
            stderr,
            done: false,
        }
    }

    /// Pop one complete line, without its newline.
    fn next_line(&mut self) -> Option<Vec<u8>> {
        let pos = self.data.iter().position(|&b| b == b'\n')?;
        let mut line: Vec<u8> = self.data.drain(..=pos).collect();
        line.pop();
        Some(line)
    }
}

/// Run `argv` in `workdir`, dropping to `uid`/`gid` when given.
///
/// The interceptor sees every complete line from both streams; returning an
/// error kills the child and fails the build permanently.
pub async fn spawn_command<F>(
    argv: &[String],
    workdir: &Path,
    uid: Option<u32>,
    gid: Option<u32>,
    output: &mut Vec<u8>,
    timeout_secs: u64,
    mut line_cb: F,
) -> Result<SpawnResult, DoozerError>
where
    F: FnMut(&str) -> Result<(), String>,
{
    let Some((program, args)) = argv.split_first() else {
        return Err(DoozerError::BadRequest("Empty command".to_string()));
    };

    let mut cmd = Command::new(program);
    cmd.args(args)
        .current_dir(workdir)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());
    if let Some(gid) = gid {
        cmd.gid(gid);
    }
    if let Some(uid) = uid {
        cmd.uid(uid);
    }

    let mut child = cmd
        .spawn()
        .map_err(|e| DoozerError::BuildTempFailed(format!("Unable to spawn: {}", e)))?;

    let mut stdout = child.stdout.take().expect("stdout piped");
    let mut stderr = child.stderr.take().expect("stderr piped");

    let print_to_stdout = std::io::stdout().is_terminal();
    let timeout = Duration::from_secs(timeout_secs);

    let mut out_q = LineBuffer::new(false);
    let mut err_q = LineBuffer::new(true);
    let mut intercept_err: Option<String> = None;
    let mut got_timeout = false;

    let mut obuf = [0u8; 8192];
    let mut ebuf = [0u8; 8192];

    while !(out_q.done && err_q.done) && intercept_err.is_none() {
        let out_open = !out_q.done;
        let err_open = !err_q.done;
        let read = tokio::time::timeout(timeout, async {
            tokio::select! {
                r = stdout.read(&mut obuf), if out_open => (false, r),
                r = stderr.read(&mut ebuf), if err_open => (true, r),
            }
        })
        .await;

        let (is_stderr, r) = match read {
            Err(_) => {
                got_timeout = true;
                break;
            }
            Ok(v) => v,
        };

        let (q, chunk) = if is_stderr {
            (&mut err_q, &ebuf[..])
        } else {
            (&mut out_q, &obuf[..])
        };

        match r {
            Ok(0) | Err(_) => {
                q.done = true;
                continue;
            }
            Ok(n) => q.data.extend_from_slice(&chunk[..n]),
        }

        while let Some(line) = q.next_line() {
            if q.stderr {
                output.extend_from_slice(&STDERR_MARKER);
            }
            output.extend_from_slice(&line);
            output.push(b'\n');

            let text = String::from_utf8_lossy(&line).to_string();

            if print_to_stdout {
                if q.stderr {
                    println!("{}: {}", "stderr".red(), text);
                } else {
                    println!("{}: {}", "stdout".yellow(), text);
                }
            }

            if let Err(e) = line_cb(&text) {
                intercept_err = Some(e);
                break;
            }
        }
    }

    if got_timeout || intercept_err.is_some() {
        let _ = child.kill().await;
    }

    let status = child
        .wait()
        .await
        .map_err(|e| DoozerError::BuildTempFailed(format!("Unable to wait for child: {}", e)))?;

    if got_timeout {
        return Ok(SpawnResult::NoOutput(timeout_secs));
    }

    if let Some(e) = intercept_err {
        return Err(DoozerError::BuildFailed(e));
    }

    match status.code() {
        Some(code) => Ok(SpawnResult::Exited(code)),
        None => {
            use std::os::unix::process::ExitStatusExt;
            Ok(SpawnResult::Signaled(status.signal().unwrap_or(0)))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sh(script: &str) -> Vec<String> {
        vec!["/bin/sh".to_string(), "-c".to_string(), script.to_string()]
    }

    #[tokio::test]
    async fn captures_stdout_and_stderr_with_markers() {
        let tmp = tempfile::tempdir().unwrap();
        let mut output = Vec::new();

        let r = spawn_command(
            &sh("echo out-line; echo err-line 1>&2"),
            tmp.path(),
            None,
            None,
            &mut output,
            10,
            |_| Ok(()),
        )
        .await
        .unwrap();

        assert_eq!(r, SpawnResult::Exited(0));
        assert!(String::from_utf8_lossy(&output).contains("out-line\n"));

        // The stderr line is prefixed with the marker bytes
        let marker_pos = output
            .windows(3)
            .position(|w| w == &STDERR_MARKER[..])
            .expect("marker present");
        let after = &output[marker_pos + 3..];
        assert!(after.starts_with(b"err-line"));
    }

    #[tokio::test]
    async fn interceptor_sees_each_line() {
        let tmp = tempfile::tempdir().unwrap();
        let mut output = Vec::new();
        let mut lines = Vec::new();

        spawn_command(
            &sh("printf 'a\\nb\\nc\\n'"),
            tmp.path(),
            None,
            None,
            &mut output,
            10,
            |l| {
                lines.push(l.to_string());
                Ok(())
            },
        )
        .await
        .unwrap();

        assert_eq!(lines, vec!["a", "b", "c"]);
    }

    #[tokio::test]
    async fn interceptor_error_kills_and_fails() {
        let tmp = tempfile::tempdir().unwrap();
        let mut output = Vec::new();

        let r = spawn_command(
            &sh("echo bad-marker; sleep 30"),
            tmp.path(),
            None,
            None,
            &mut output,
            10,
            |l| {
                if l.contains("bad-marker") {
                    Err("Invalid artifact line".to_string())
                } else {
                    Ok(())
                }
            },
        )
        .await;

        assert!(matches!(r, Err(DoozerError::BuildFailed(_))));
    }

    #[tokio::test]
    async fn silent_child_is_killed_on_timeout() {
        let tmp = tempfile::tempdir().unwrap();
        let mut output = Vec::new();

        let r = spawn_command(
            &sh("sleep 30"),
            tmp.path(),
            None,
            None,
            &mut output,
            1,
            |_| Ok(()),
        )
        .await
        .unwrap();

        assert_eq!(r, SpawnResult::NoOutput(1));
    }

    #[tokio::test]
    async fn exit_codes_propagate() {
        let tmp = tempfile::tempdir().unwrap();
        let mut output = Vec::new();

        let r = spawn_command(&sh("exit 3"), tmp.path(), None, None, &mut output, 10, |_| {
            Ok(())
        })
        .await
        .unwrap();
        assert_eq!(r, SpawnResult::Exited(3));
    }
}

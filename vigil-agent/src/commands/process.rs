use serde::Serialize;
use std::process::{Output, Stdio};
use std::time::Duration;
use tokio::io::AsyncReadExt;
use tracing::debug;

use super::CommandError;

/// One row of `ps` output
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ProcessInfo {
    pub pid: u32,
    pub command: String,
    pub cpu: f64,
    pub mem: f64,
}

/// Parse `ps -eo pid,comm,pcpu,pmem --no-headers` output.
///
/// Command names may contain spaces, so the first column is the pid, the two
/// last are cpu and mem, and everything in between is the command.
pub fn parse_ps_output(output: &str) -> Vec<ProcessInfo> {
    output
        .lines()
        .filter_map(|line| {
            let fields: Vec<&str> = line.split_whitespace().collect();
            if fields.len() < 4 {
                return None;
            }
            let n = fields.len();
            let parsed = (
                fields[0].parse::<u32>(),
                fields[n - 2].parse::<f64>(),
                fields[n - 1].parse::<f64>(),
            );
            match parsed {
                (Ok(pid), Ok(cpu), Ok(mem)) => Some(ProcessInfo {
                    pid,
                    command: fields[1..n - 2].join(" "),
                    cpu,
                    mem,
                }),
                _ => {
                    debug!("Skipping unparsable ps line: {:?}", line);
                    None
                }
            }
        })
        .collect()
}

/// Run a program to completion, killing it if it outlives `timeout`.
///
/// stdout and stderr are drained while waiting so a chatty child cannot
/// block on a full pipe.
pub async fn run_with_timeout(
    program: &str,
    args: &[String],
    timeout: Duration,
) -> Result<Output, CommandError> {
    let mut child = tokio::process::Command::new(program)
        .args(args)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .spawn()
        .map_err(|e| CommandError::Internal(format!("failed to spawn {}: {}", program, e)))?;

    let mut stdout_handle = child.stdout.take();
    let mut stderr_handle = child.stderr.take();

    tokio::select! {
        result = async {
            let (status, stdout, stderr) = tokio::join!(
                child.wait(),
                async {
                    let mut buf = Vec::new();
                    if let Some(ref mut h) = stdout_handle {
                        let _ = h.read_to_end(&mut buf).await;
                    }
                    buf
                },
                async {
                    let mut buf = Vec::new();
                    if let Some(ref mut h) = stderr_handle {
                        let _ = h.read_to_end(&mut buf).await;
                    }
                    buf
                },
            );
            let status = status.map_err(|e| {
                CommandError::Internal(format!("waiting for {}: {}", program, e))
            })?;
            Ok::<Output, CommandError>(Output { status, stdout, stderr })
        } => result,
        () = tokio::time::sleep(timeout) => {
            let _ = child.kill().await;
            Err(CommandError::Internal(format!(
                "{} timed out after {}ms",
                program,
                timeout.as_millis()
            )))
        }
    }
}

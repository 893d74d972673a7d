//! External command execution
//!
//! Every tool the pipeline shells out to (QC tools, `du`, `df`) goes through
//! [`execute`], which captures both output streams and turns a non-zero exit
//! into [`RunstageError::Command`].

use crate::error::{Result, RunstageError};
use std::ffi::OsStr;
use std::path::Path;
use tokio::process::Command;
use tracing::{debug, instrument};

/// Captured output of a successful command
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandOutput {
    pub stdout: String,
    pub stderr: String,
}

/// Run `program` with `args` and wait for it to exit.
///
/// A program that cannot be spawned surfaces as [`RunstageError::Io`]; a
/// program that exits non-zero surfaces as [`RunstageError::Command`] carrying
/// its stdout and stderr.
#[instrument(skip(args, cwd))]
pub async fn execute<I, S>(program: &str, args: I, cwd: Option<&Path>) -> Result<CommandOutput>
where
    I: IntoIterator<Item = S>,
    S: AsRef<OsStr>,
{
    let args: Vec<_> = args
        .into_iter()
        .map(|a| a.as_ref().to_os_string())
        .collect();
    let command_line = std::iter::once(program.to_string())
        .chain(args.iter().map(|a| a.to_string_lossy().into_owned()))
        .collect::<Vec<_>>()
        .join(" ");

    let mut command = Command::new(program);
    command.args(&args).kill_on_drop(true);
    if let Some(cwd) = cwd {
        command.current_dir(cwd);
    }

    debug!(command = %command_line, "Executing command");
    let output = command.output().await?;

    let stdout = String::from_utf8_lossy(&output.stdout).into_owned();
    let stderr = String::from_utf8_lossy(&output.stderr).into_owned();

    if !output.status.success() {
        return Err(RunstageError::Command {
            command: command_line,
            status: output.status.code(),
            stdout,
            stderr,
        });
    }

    Ok(CommandOutput { stdout, stderr })
}

/// Disk usage of a directory in bytes (`du -sb`)
pub async fn total_size(dir: &Path) -> Result<u64> {
    let output = execute("du", [OsStr::new("-sb"), dir.as_os_str()], None).await?;
    output
        .stdout
        .split_whitespace()
        .next()
        .and_then(|field| field.parse().ok())
        .ok_or_else(|| RunstageError::Parse(format!("Unexpected du output: {:?}", output.stdout)))
}

/// Bytes available to unprivileged users on the filesystem holding `dir`
pub async fn available_space(dir: &Path) -> Result<u64> {
    let output = execute(
        "df",
        [OsStr::new("-B1"), OsStr::new("--output=avail"), dir.as_os_str()],
        None,
    )
    .await?;
    output
        .stdout
        .lines()
        .last()
        .and_then(|line| line.trim().parse().ok())
        .ok_or_else(|| RunstageError::Parse(format!("Unexpected df output: {:?}", output.stdout)))
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_execute_captures_streams() {
        let output = execute("sh", ["-c", "echo out; echo err >&2"], None)
            .await
            .unwrap();
        assert_eq!(output.stdout.trim(), "out");
        assert_eq!(output.stderr.trim(), "err");
    }

    #[tokio::test]
    async fn test_execute_non_zero_exit() {
        let err = execute("sh", ["-c", "echo partial; echo broken >&2; exit 3"], None)
            .await
            .unwrap_err();

        match err {
            RunstageError::Command {
                status,
                stdout,
                stderr,
                ..
            } => {
                assert_eq!(status, Some(3));
                assert_eq!(stdout.trim(), "partial");
                assert_eq!(stderr.trim(), "broken");
            },
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_execute_missing_program() {
        let err = execute("runstage-no-such-tool", Vec::<&str>::new(), None)
            .await
            .unwrap_err();
        assert!(matches!(err, RunstageError::Io(_)));
    }

    #[tokio::test]
    async fn test_execute_in_cwd() {
        let dir = tempfile::tempdir().unwrap();
        let output = execute("pwd", Vec::<&str>::new(), Some(dir.path())).await.unwrap();
        let reported = std::fs::canonicalize(output.stdout.trim()).unwrap();
        assert_eq!(reported, std::fs::canonicalize(dir.path()).unwrap());
    }

    #[tokio::test]
    async fn test_total_size() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("reads.fastq.gz"), vec![0u8; 10_000]).unwrap();

        let size = total_size(dir.path()).await.unwrap();
        assert!(size >= 10_000);
    }

    #[tokio::test]
    async fn test_available_space() {
        let dir = tempfile::tempdir().unwrap();
        assert!(available_space(dir.path()).await.unwrap() > 0);
    }
}

//! Running base-system tools and capturing their output

use std::path::Path;
use std::process::ExitStatus;
use tokio::process::Command;

#[derive(Debug, thiserror::Error)]
pub enum CommandError {
    #[error("failed to run {command}: {source}")]
    Spawn {
        command: String,
        #[source]
        source: std::io::Error,
    },

    #[error("{command} exited with {status}: {stderr}")]
    Failed {
        command: String,
        status: ExitStatus,
        stderr: String,
    },
}

/// Run `program` with `args` and return its stdout.
pub async fn capture(program: &Path, args: &[&str]) -> Result<String, CommandError> {
    let command = format!("{} {}", program.display(), args.join(" "));
    let output = Command::new(program)
        .args(args)
        .output()
        .await
        .map_err(|source| CommandError::Spawn {
            command: command.clone(),
            source,
        })?;

    if !output.status.success() {
        return Err(CommandError::Failed {
            command,
            status: output.status,
            stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
        });
    }
    Ok(String::from_utf8_lossy(&output.stdout).into_owned())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_capture_stdout() {
        let out = capture(Path::new("echo"), &["hello", "world"]).await.unwrap();
        assert_eq!(out.trim(), "hello world");
    }

    #[tokio::test]
    async fn test_non_zero_exit() {
        let err = capture(Path::new("false"), &[]).await.unwrap_err();
        assert!(matches!(err, CommandError::Failed { .. }));
    }

    #[tokio::test]
    async fn test_missing_program() {
        let err = capture(Path::new("/nonexistent/tool"), &["-v"])
            .await
            .unwrap_err();
        assert!(matches!(err, CommandError::Spawn { .. }));
        assert!(err.to_string().contains("/nonexistent/tool -v"));
    }
}

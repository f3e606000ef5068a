//! Command execution inside running containers

use async_trait::async_trait;
use k8s_openapi::api::core::v1::Pod;
use kube::{api::AttachParams, Api, Client};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tracing::debug;

#[cfg(test)]
use mockall::automock;

/// Captured output of a finished command
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ExecOutput {
    pub stdout: String,
    pub stderr: String,
}

/// Exec primitive errors
#[derive(Error, Debug)]
pub enum ExecError {
    /// The command ran and exited unsuccessfully
    #[error("command failed: {message}, stderr: {stderr}")]
    Failed {
        message: String,
        stdout: String,
        stderr: String,
    },

    /// The exec session could not be established
    #[error("exec request failed: {0}")]
    Kube(#[from] kube::Error),

    /// Reading or writing the attached streams failed
    #[error("exec stream error: {0}")]
    Io(#[from] std::io::Error),
}

impl ExecError {
    /// Standard error of a command that ran, if any
    pub fn stderr(&self) -> Option<&str> {
        match self {
            ExecError::Failed { stderr, .. } => Some(stderr),
            _ => None,
        }
    }
}

/// Runs a command in a container and captures its output
#[cfg_attr(test, automock)]
#[async_trait]
pub trait PodExecutor: Send + Sync {
    async fn exec(
        &self,
        namespace: &str,
        pod: &str,
        container: &str,
        stdin: Option<Vec<u8>>,
        command: Vec<String>,
    ) -> Result<ExecOutput, ExecError>;
}

/// [`PodExecutor`] using the pods/exec subresource
#[derive(Clone)]
pub struct KubePodExecutor {
    client: Client,
}

impl KubePodExecutor {
    pub fn new(client: Client) -> Self {
        Self { client }
    }
}

async fn read_stream<R: AsyncRead + Unpin>(reader: Option<R>) -> std::io::Result<String> {
    let mut buf = Vec::new();
    if let Some(mut reader) = reader {
        reader.read_to_end(&mut buf).await?;
    }
    Ok(String::from_utf8_lossy(&buf).into_owned())
}

#[async_trait]
impl PodExecutor for KubePodExecutor {
    async fn exec(
        &self,
        namespace: &str,
        pod: &str,
        container: &str,
        stdin: Option<Vec<u8>>,
        command: Vec<String>,
    ) -> Result<ExecOutput, ExecError> {
        let pods: Api<Pod> = Api::namespaced(self.client.clone(), namespace);
        let params = AttachParams::default()
            .container(container)
            .stdin(stdin.is_some())
            .stdout(true)
            .stderr(true);

        debug!(namespace, pod, container, command = ?command, "Executing command in pod");
        let mut attached = pods.exec(pod, command, &params).await?;

        if let Some(input) = stdin {
            if let Some(mut writer) = attached.stdin() {
                writer.write_all(&input).await?;
                writer.shutdown().await?;
            }
        }

        let stdout_reader = attached.stdout();
        let stderr_reader = attached.stderr();
        let status = attached.take_status();

        let (stdout, stderr) = tokio::join!(read_stream(stdout_reader), read_stream(stderr_reader));
        let output = ExecOutput {
            stdout: stdout?,
            stderr: stderr?,
        };

        let status = match status {
            Some(status) => status.await,
            None => None,
        };

        match status {
            Some(s) if s.status.as_deref() == Some("Success") => Ok(output),
            Some(s) => Err(ExecError::Failed {
                message: s.message.unwrap_or_else(|| "command exited with failure".to_string()),
                stdout: output.stdout,
                stderr: output.stderr,
            }),
            None => Err(ExecError::Failed {
                message: "exec session ended without a status".to_string(),
                stdout: output.stdout,
                stderr: output.stderr,
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stderr_is_exposed_only_for_finished_commands() {
        let failed = ExecError::Failed {
            message: "exit 1".to_string(),
            stdout: String::new(),
            stderr: "boom".to_string(),
        };
        assert_eq!(failed.stderr(), Some("boom"));

        let io = ExecError::Io(std::io::Error::other("closed"));
        assert_eq!(io.stderr(), None);
    }
}

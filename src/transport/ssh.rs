use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;

use super::CommandOutput;
use super::RemoteCommand;
use super::RemoteTransport;
use crate::common::with_timeout;
use crate::errors::EngineError;
use crate::errors::Result;
use crate::model::Endpoint;

/// ssh reserves this exit code for its own errors.
const SSH_CONNECTION_ERROR: i32 = 255;

/// Runs commands through the system `ssh` client.
///
/// File transfer streams through `cat` on the remote side so no
/// local temp files are needed.
#[derive(Debug, Clone)]
pub struct SshTransport {
    connect_timeout: Duration,
    command_timeout: Duration,
}

impl SshTransport {
    pub fn new(connect_timeout: Duration, command_timeout: Duration) -> Self {
        Self {
            connect_timeout,
            command_timeout,
        }
    }

    fn ssh(&self, endpoint: &Endpoint, remote: &str) -> Command {
        let mut cmd = Command::new("ssh");
        cmd.arg("-o")
            .arg("BatchMode=yes")
            .arg("-o")
            .arg(format!(
                "ConnectTimeout={}",
                self.connect_timeout.as_secs().max(1)
            ))
            .arg("-o")
            .arg("StrictHostKeyChecking=accept-new")
            .arg("-p")
            .arg(endpoint.port.to_string());
        if let Some(key) = &endpoint.credentials_ref {
            cmd.arg("-i").arg(key);
        }
        cmd.arg(format!("{}@{}", endpoint.user, endpoint.host))
            .arg("--")
            .arg(remote)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        cmd
    }

    async fn output(
        &self,
        endpoint: &Endpoint,
        remote: &str,
        stdin: Option<&[u8]>,
    ) -> Result<std::process::Output> {
        let mut cmd = self.ssh(endpoint, remote);
        cmd.stdin(if stdin.is_some() {
            Stdio::piped()
        } else {
            Stdio::null()
        });
        let run = async {
            let mut child = cmd
                .spawn()
                .map_err(|err| EngineError::Config(format!("can't spawn ssh: {err}")))?;
            if let (Some(data), Some(mut pipe)) = (stdin, child.stdin.take()) {
                pipe.write_all(data).await.map_err(|err| {
                    EngineError::TransientNetwork(format!("writing to {endpoint}: {err}"))
                })?;
                // Close stdin so the remote `cat` sees EOF.
                drop(pipe);
            }
            child.wait_with_output().await.map_err(|err| {
                EngineError::TransientNetwork(format!("waiting on ssh to {endpoint}: {err}"))
            })
        };
        let out = with_timeout(&format!("ssh {endpoint}"), self.command_timeout, run).await?;
        if out.status.code() == Some(SSH_CONNECTION_ERROR) {
            return Err(EngineError::TransientNetwork(format!(
                "ssh to {endpoint}: {}",
                String::from_utf8_lossy(&out.stderr).trim()
            )));
        }
        Ok(out)
    }
}

fn exit_code(out: &std::process::Output) -> i32 {
    // Killed by a signal.
    out.status.code().unwrap_or(-1)
}

#[async_trait]
impl RemoteTransport for SshTransport {
    async fn exec(&self, endpoint: &Endpoint, command: &RemoteCommand) -> Result<CommandOutput> {
        tracing::trace!("Running {command} on {endpoint}");
        let out = self.output(endpoint, &command.to_shell(), None).await?;
        Ok(CommandOutput {
            exit_code: exit_code(&out),
            stdout: String::from_utf8_lossy(&out.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&out.stderr).into_owned(),
        })
    }

    async fn upload(&self, endpoint: &Endpoint, data: &[u8], remote_path: &str) -> Result<()> {
        let remote = format!("cat > {}", RemoteCommand::new(remote_path).to_shell());
        let out = self.output(endpoint, &remote, Some(data)).await?;
        if !out.status.success() {
            return Err(EngineError::CommandFailed {
                command: remote,
                exit_code: exit_code(&out),
                stderr: String::from_utf8_lossy(&out.stderr).trim().to_string(),
            });
        }
        tracing::debug!("Uploaded {} bytes to {endpoint}:{remote_path}", data.len());
        Ok(())
    }

    async fn download(&self, endpoint: &Endpoint, remote_path: &str) -> Result<Vec<u8>> {
        let command = RemoteCommand::new("cat").arg(remote_path);
        let out = self.output(endpoint, &command.to_shell(), None).await?;
        if !out.status.success() {
            return Err(EngineError::CommandFailed {
                command: command.to_string(),
                exit_code: exit_code(&out),
                stderr: String::from_utf8_lossy(&out.stderr).trim().to_string(),
            });
        }
        tracing::debug!(
            "Downloaded {} bytes from {endpoint}:{remote_path}",
            out.stdout.len()
        );
        Ok(out.stdout)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builds_batch_mode_invocation() {
        let transport = SshTransport::new(Duration::from_secs(7), Duration::from_secs(60));
        let endpoint = Endpoint {
            host: "10.0.0.5".into(),
            port: 2222,
            user: "root".into(),
            credentials_ref: Some("/keys/id_ed25519".into()),
        };
        let cmd = transport.ssh(&endpoint, "true");
        let args: Vec<_> = cmd
            .as_std()
            .get_args()
            .map(|a| a.to_string_lossy().into_owned())
            .collect();
        assert_eq!(cmd.as_std().get_program(), "ssh");
        assert!(args.contains(&"BatchMode=yes".to_string()));
        assert!(args.contains(&"ConnectTimeout=7".to_string()));
        let port = args.iter().position(|a| a == "-p").unwrap();
        assert_eq!(args[port + 1], "2222");
        let key = args.iter().position(|a| a == "-i").unwrap();
        assert_eq!(args[key + 1], "/keys/id_ed25519");
        assert_eq!(&args[args.len() - 3..], ["root@10.0.0.5", "--", "true"]);
    }
}

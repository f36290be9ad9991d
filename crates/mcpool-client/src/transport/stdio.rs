//! Child-process transport: newline-delimited JSON over standard streams.

use std::collections::HashMap;
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use mcpool_core::{McpError, ServerConfig};
use serde_json::Value;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::{mpsc, Mutex};
use tracing::{debug, info, warn};

use super::{Transport, TransportEvent};

/// How long a child gets to exit on graceful close before it is killed.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

#[derive(Debug)]
pub struct StdioTransport {
    server: String,
    command: String,
    args: Vec<String>,
    env: HashMap<String, String>,
    events: mpsc::UnboundedSender<TransportEvent>,
    state: Mutex<Option<Running>>,
}

#[derive(Debug)]
struct Running {
    child: Child,
    stdin_tx: mpsc::UnboundedSender<String>,
    tasks: Vec<tokio::task::JoinHandle<()>>,
}

impl StdioTransport {
    pub fn new(
        server: &str,
        config: &ServerConfig,
        events: mpsc::UnboundedSender<TransportEvent>,
    ) -> Result<Self, McpError> {
        let command = config
            .command
            .clone()
            .ok_or_else(|| McpError::Configuration {
                server: server.to_string(),
                reason: "stdio transport requires a command".to_string(),
            })?;

        let (command, args) = Self::parse_command(server, &command, &config.args)?;

        Ok(Self {
            server: server.to_string(),
            command,
            args,
            env: config.env.clone(),
            events,
            state: Mutex::new(None),
        })
    }

    /// Parse a command string that may contain embedded arguments, a common
    /// shape in configs copied from desktop MCP clients
    /// (`"docker run -i image"`, `"npx -y @some/server"`).
    fn parse_command(
        server: &str,
        command: &str,
        args: &[String],
    ) -> Result<(String, Vec<String>), McpError> {
        if !args.is_empty() || !command.contains(' ') {
            return Ok((command.to_string(), args.to_vec()));
        }

        let parts = shell_words::split(command).map_err(|e| McpError::Configuration {
            server: server.to_string(),
            reason: format!("failed to parse command string: {e}"),
        })?;
        let mut parts = parts.into_iter();
        let executable = parts.next().ok_or_else(|| McpError::Configuration {
            server: server.to_string(),
            reason: "empty command after parsing".to_string(),
        })?;
        Ok((executable, parts.collect()))
    }
}

#[async_trait]
impl Transport for StdioTransport {
    async fn open(&self) -> Result<(), McpError> {
        let mut state = self.state.lock().await;
        if state.is_some() {
            return Ok(());
        }

        info!(
            server = %self.server,
            command = %self.command,
            args = ?self.args,
            "spawning stdio server"
        );

        let mut cmd = Command::new(&self.command);
        cmd.args(&self.args)
            .envs(&self.env)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        // New process group so terminal signals to the host do not propagate
        // into MCP server children.
        #[cfg(unix)]
        cmd.process_group(0);

        let mut child = cmd.spawn().map_err(|e| {
            McpError::transport(
                &self.server,
                format!("failed to spawn '{}': {e}", self.command),
            )
        })?;

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| McpError::transport(&self.server, "failed to capture stdin"))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| McpError::transport(&self.server, "failed to capture stdout"))?;
        let stderr = child.stderr.take();

        let (stdin_tx, mut stdin_rx) = mpsc::unbounded_channel::<String>();
        let mut tasks = Vec::new();

        let events = self.events.clone();
        let mut writer = stdin;
        tasks.push(tokio::spawn(async move {
            while let Some(line) = stdin_rx.recv().await {
                if let Err(e) = writer.write_all(line.as_bytes()).await {
                    let _ = events.send(TransportEvent::Error(format!("stdin write failed: {e}")));
                    break;
                }
                if let Err(e) = writer.flush().await {
                    let _ = events.send(TransportEvent::Error(format!("stdin flush failed: {e}")));
                    break;
                }
            }
        }));

        let events = self.events.clone();
        let server = self.server.clone();
        tasks.push(tokio::spawn(async move {
            let mut lines = BufReader::new(stdout).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                match serde_json::from_str::<Value>(&line) {
                    Ok(frame) => {
                        let _ = events.send(TransportEvent::Message(frame));
                    }
                    Err(e) => debug!(server = %server, error = %e, "non-JSON line on stdout"),
                }
            }
            let _ = events.send(TransportEvent::Closed);
        }));

        if let Some(stderr) = stderr {
            let server = self.server.clone();
            tasks.push(tokio::spawn(async move {
                let mut lines = BufReader::new(stderr).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    debug!(server = %server, "stderr: {line}");
                }
            }));
        }

        *state = Some(Running {
            child,
            stdin_tx,
            tasks,
        });
        let _ = self.events.send(TransportEvent::Opened);
        Ok(())
    }

    async fn send(&self, frame: Value) -> Result<(), McpError> {
        let state = self.state.lock().await;
        let running = state
            .as_ref()
            .ok_or_else(|| McpError::transport(&self.server, "transport not open"))?;

        let mut line = serde_json::to_string(&frame)
            .map_err(|e| McpError::transport(&self.server, format!("serialize failed: {e}")))?;
        line.push('\n');
        running
            .stdin_tx
            .send(line)
            .map_err(|_| McpError::transport(&self.server, "stdin writer gone"))
    }

    async fn close(&self) -> Result<(), McpError> {
        let Some(mut running) = self.state.lock().await.take() else {
            return Ok(());
        };

        // Dropping the writer channel closes stdin, giving the child its EOF.
        drop(running.stdin_tx);

        match tokio::time::timeout(SHUTDOWN_GRACE, running.child.wait()).await {
            Ok(Ok(status)) => {
                debug!(server = %self.server, ?status, "stdio server exited");
            }
            Ok(Err(e)) => {
                warn!(server = %self.server, error = %e, "error waiting for stdio server");
            }
            Err(_) => {
                warn!(
                    server = %self.server,
                    "stdio server did not exit within {SHUTDOWN_GRACE:?}, killing"
                );
                let _ = running.child.start_kill();
                let _ = running.child.wait().await;
            }
        }

        for task in running.tasks {
            task.abort();
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(json: &str) -> ServerConfig {
        serde_json::from_str(json).unwrap()
    }

    #[test]
    fn test_parse_command_plain() {
        let (exe, args) = StdioTransport::parse_command("s", "node", &["server.js".into()]).unwrap();
        assert_eq!(exe, "node");
        assert_eq!(args, vec!["server.js"]);
    }

    #[test]
    fn test_parse_command_embedded_args() {
        let (exe, args) =
            StdioTransport::parse_command("s", "docker run -i --rm image", &[]).unwrap();
        assert_eq!(exe, "docker");
        assert_eq!(args, vec!["run", "-i", "--rm", "image"]);
    }

    #[test]
    fn test_parse_command_quoting() {
        let (exe, args) =
            StdioTransport::parse_command("s", r#"sh -c "echo hi""#, &[]).unwrap();
        assert_eq!(exe, "sh");
        assert_eq!(args, vec!["-c", "echo hi"]);
    }

    #[test]
    fn test_new_requires_command() {
        let (tx, _rx) = mpsc::unbounded_channel();
        let err = StdioTransport::new("s", &config(r#"{"url": "https://x"}"#), tx).unwrap_err();
        assert!(matches!(err, McpError::Configuration { .. }));
    }

    #[tokio::test]
    async fn test_send_before_open_fails() {
        let (tx, _rx) = mpsc::unbounded_channel();
        let transport =
            StdioTransport::new("s", &config(r#"{"command": "cat"}"#), tx).unwrap();
        let err = transport.send(serde_json::json!({})).await.unwrap_err();
        assert!(err.to_string().contains("not open"));
    }

    #[tokio::test]
    async fn test_close_without_open_is_noop() {
        let (tx, _rx) = mpsc::unbounded_channel();
        let transport =
            StdioTransport::new("s", &config(r#"{"command": "cat"}"#), tx).unwrap();
        transport.close().await.unwrap();
    }
}

use anyhow::Result;
use portauth_ipc::{Command, Response};
use std::path::Path;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::{mpsc, oneshot};
use tracing::{error, info, warn};

/// A control command waiting for the event loop, with the channel for its
/// answer.
#[derive(Debug)]
pub struct ControlRequest {
    pub command: Command,
    pub reply: oneshot::Sender<Response>,
}

async fn handle_connection(mut stream: UnixStream, requests: mpsc::Sender<ControlRequest>) -> Result<()> {
    let mut buffer = Vec::new();
    stream.read_to_end(&mut buffer).await?;

    let response = match serde_json::from_slice::<Command>(&buffer) {
        Ok(command) => {
            let (reply, answer) = oneshot::channel();
            if requests.send(ControlRequest { command, reply }).await.is_err() {
                Response::Error("authenticator is shutting down".to_string())
            } else {
                answer
                    .await
                    .unwrap_or_else(|_| Response::Error("no answer from authenticator".to_string()))
            }
        }
        Err(e) => {
            warn!("Failed to deserialize command: {}", e);
            Response::Error(format!("Deserialization failed: {}", e))
        }
    };

    let serialized = serde_json::to_vec(&response)?;
    stream.write_all(&serialized).await?;
    stream.shutdown().await?;

    Ok(())
}

pub async fn run_cmdsock_listener(path: String, requests: mpsc::Sender<ControlRequest>) -> Result<()> {
    let socket_path = Path::new(&path);

    // Remove the socket file if it already exists
    if socket_path.exists() {
        std::fs::remove_file(socket_path)?;
    }

    let listener = UnixListener::bind(&path)?;
    info!("Cmdsock listener started on {}", path);

    loop {
        match listener.accept().await {
            Ok((stream, _addr)) => {
                let requests = requests.clone();
                tokio::spawn(async move {
                    if let Err(e) = handle_connection(stream, requests).await {
                        error!("Error handling cmdsock connection: {}", e);
                    }
                });
            }
            Err(e) => {
                error!("Cmdsock accept error: {}", e);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pnet_base::MacAddr;
    use std::time::Duration;

    async fn send_test_command(path: &Path, command: Command) -> Result<Response> {
        let mut stream = UnixStream::connect(path).await?;
        let serialized = serde_json::to_vec(&command)?;
        stream.write_all(&serialized).await?;
        stream.shutdown().await?;
        let mut buffer = Vec::new();
        stream.read_to_end(&mut buffer).await?;
        Ok(serde_json::from_slice(&buffer)?)
    }

    #[tokio::test]
    async fn test_cmdsock_forwards_commands() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let socket_path = dir.path().join("portauth.sock");
        let (tx, mut rx) = mpsc::channel::<ControlRequest>(4);

        let path = socket_path.to_string_lossy().into_owned();
        tokio::spawn(async move { run_cmdsock_listener(path, tx).await });

        // Stand-in for the event loop.
        tokio::spawn(async move {
            while let Some(request) = rx.recv().await {
                let response = match request.command {
                    Command::List => Response::Stations(Vec::new()),
                    Command::Disconnect { .. } => Response::Success,
                    Command::Reauthenticate { mac } => Response::Error(format!("station {} not found", mac)),
                };
                let _ = request.reply.send(response);
            }
        });

        for _ in 0..50 {
            if socket_path.exists() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }

        let mac = MacAddr::new(2, 0, 0, 0, 0, 0x10);
        assert!(matches!(
            send_test_command(&socket_path, Command::List).await?,
            Response::Stations(s) if s.is_empty()
        ));
        assert!(matches!(
            send_test_command(&socket_path, Command::Disconnect { mac }).await?,
            Response::Success
        ));
        assert!(matches!(
            send_test_command(&socket_path, Command::Reauthenticate { mac }).await?,
            Response::Error(_)
        ));
        Ok(())
    }

    #[tokio::test]
    async fn test_cmdsock_rejects_garbage() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let socket_path = dir.path().join("portauth.sock");
        let (tx, _rx) = mpsc::channel::<ControlRequest>(4);
        let path = socket_path.to_string_lossy().into_owned();
        tokio::spawn(async move { run_cmdsock_listener(path, tx).await });
        for _ in 0..50 {
            if socket_path.exists() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }

        let mut stream = UnixStream::connect(&socket_path).await?;
        stream.write_all(b"not json").await?;
        stream.shutdown().await?;
        let mut buffer = Vec::new();
        stream.read_to_end(&mut buffer).await?;
        let response: Response = serde_json::from_slice(&buffer)?;
        assert!(matches!(response, Response::Error(e) if e.starts_with("Deserialization failed")));
        Ok(())
    }
}

//! IPC Server - Unix socket server for gallery clients
//!
//! Accepts connections, reads newline-delimited JSON commands and
//! dispatches them to the caches and the activation service.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use base64::Engine;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::RwLock;
use tokio::task::JoinError;
use tracing::{debug, error, info};

use crate::activation::ActivationService;
use crate::cache::asset::{AssetCache, ControlMessage};
use crate::cache::metadata::MetadataCache;
use crate::fetch::AssetRequest;
use crate::ipc::protocol::{
    parse_command, serialize_response, AssetPayload, Command, Response, PROTOCOL_VERSION,
};

/// Services reachable over IPC
pub struct AppState {
    pub assets: AssetCache,
    pub metadata: Arc<MetadataCache>,
    pub activation: Arc<ActivationService>,
}

/// IPC Server that listens for commands from gallery clients
pub struct IpcServer {
    state: Arc<AppState>,
    socket_path: PathBuf,
    /// Socket listener
    listener: Option<UnixListener>,
    /// Active connections counter
    connection_count: Arc<RwLock<u32>>,
}

impl IpcServer {
    /// Create a new IPC server
    pub fn new(state: Arc<AppState>, socket_path: impl Into<PathBuf>) -> Self {
        Self {
            state,
            socket_path: socket_path.into(),
            listener: None,
            connection_count: Arc::new(RwLock::new(0)),
        }
    }

    /// Bind the socket, replacing a stale socket file
    pub async fn start(&mut self) -> Result<()> {
        if self.socket_path.exists() {
            std::fs::remove_file(&self.socket_path)
                .context("Failed to remove existing socket file")?;
        }

        let listener =
            UnixListener::bind(&self.socket_path).context("Failed to bind Unix socket")?;

        info!(socket_path = %self.socket_path.display(), "IPC server started");

        self.listener = Some(listener);
        Ok(())
    }

    /// Run the server loop, accepting connections
    pub async fn run(&self) -> Result<()> {
        let listener = self.listener.as_ref().context("Server not started")?;

        loop {
            match listener.accept().await {
                Ok((stream, _)) => {
                    let state = Arc::clone(&self.state);
                    let connection_count = Arc::clone(&self.connection_count);

                    tokio::spawn(async move {
                        if let Err(e) = handle_connection(stream, state, connection_count).await {
                            error!(error = %e, "Connection handler error");
                        }
                    });
                }
                Err(e) => {
                    error!(error = %e, "Failed to accept connection");
                }
            }
        }
    }

    /// Remove the socket file
    pub fn stop(&self) -> Result<()> {
        remove_socket(&self.socket_path)?;
        info!("IPC server stopped");
        Ok(())
    }

    /// Get the number of active connections
    pub async fn connection_count(&self) -> u32 {
        *self.connection_count.read().await
    }
}

fn remove_socket(path: &Path) -> Result<()> {
    if path.exists() {
        std::fs::remove_file(path).context("Failed to remove socket file")?;
    }
    Ok(())
}

/// Handle a single client connection
async fn handle_connection(
    stream: UnixStream,
    state: Arc<AppState>,
    connection_count: Arc<RwLock<u32>>,
) -> Result<()> {
    {
        let mut count = connection_count.write().await;
        *count += 1;
        debug!(count = *count, "New connection");
    }

    let (reader, mut writer) = stream.into_split();
    let mut buf_reader = BufReader::new(reader);
    let mut line = String::new();

    loop {
        line.clear();
        match buf_reader.read_line(&mut line).await {
            Ok(0) => {
                debug!("Connection closed by client");
                break;
            }
            Ok(_) => {
                let trimmed = line.trim();
                if trimmed.is_empty() {
                    continue;
                }

                let response = match parse_command(trimmed.as_bytes()) {
                    Ok(command) => process_command(command, &state).await,
                    Err(e) => {
                        error!(error = %e, "Failed to parse command");
                        Response::error("invalid-argument", format!("Invalid command: {}", e))
                    }
                };

                match serialize_response(&response) {
                    Ok(json) => {
                        if let Err(e) = writer.write_all(&json).await {
                            error!(error = %e, "Failed to write response");
                            break;
                        }
                    }
                    Err(e) => {
                        error!(error = %e, "Failed to serialize response");
                    }
                }
            }
            Err(e) => {
                error!(error = %e, "Failed to read from socket");
                break;
            }
        }
    }

    {
        let mut count = connection_count.write().await;
        *count = count.saturating_sub(1);
        debug!(count = *count, "Connection ended");
    }

    Ok(())
}

/// Run a metadata cache operation on the blocking pool
async fn with_metadata<T, F>(state: &AppState, op: F) -> Result<T, JoinError>
where
    F: FnOnce(&MetadataCache) -> T + Send + 'static,
    T: Send + 'static,
{
    let metadata = Arc::clone(&state.metadata);
    tokio::task::spawn_blocking(move || op(&metadata)).await
}

fn metadata_failed(err: JoinError) -> Response {
    error!(error = %err, "Metadata task failed");
    Response::error("internal", "Internal error")
}

/// Process a command and return a response
pub async fn process_command(command: Command, state: &AppState) -> Response {
    match command {
        Command::ClearCache => {
            let reply = state.assets.handle_control(ControlMessage::ClearCache);
            Response {
                success: reply.success,
                ..Response::default()
            }
        }

        Command::GetCacheSize => {
            let reply = state.assets.handle_control(ControlMessage::GetCacheSize);
            Response {
                success: reply.success,
                count: reply.count,
                ..Response::default()
            }
        }

        Command::FetchAsset { url } => {
            debug!(url = %url, "Processing fetchAsset command");
            match state.assets.handle(&AssetRequest::get(url)).await {
                Ok(served) => Response {
                    asset: Some(AssetPayload {
                        status: served.response.status,
                        content_type: served.response.content_type().map(str::to_string),
                        source: served.source,
                        body: base64::engine::general_purpose::STANDARD
                            .encode(&served.response.body),
                    }),
                    ..Response::ok()
                },
                Err(e) => Response::error("unavailable", e.to_string()),
            }
        }

        Command::ReadMetadata => {
            let read = with_metadata(state, |metadata| (metadata.read(), metadata.version()));
            match read.await {
                Ok((envelope, version)) => Response {
                    envelope,
                    version: Some(version),
                    ..Response::ok()
                },
                Err(e) => metadata_failed(e),
            }
        }

        Command::WriteMetadata {
            images,
            total_size,
            count,
        } => {
            let write = with_metadata(state, move |metadata| {
                metadata.write(images, total_size, count)
            });
            match write.await {
                Ok(()) => Response::ok(),
                Err(e) => metadata_failed(e),
            }
        }

        Command::InvalidateMetadata => {
            let invalidate = with_metadata(state, |metadata| {
                metadata.invalidate();
                metadata.version()
            });
            match invalidate.await {
                Ok(version) => Response {
                    version: Some(version),
                    ..Response::ok()
                },
                Err(e) => metadata_failed(e),
            }
        }

        Command::MetadataStats => {
            let stats = with_metadata(state, |metadata| (metadata.stats(), metadata.version()));
            match stats.await {
                Ok((stats, version)) => Response {
                    stats: Some(stats),
                    version: Some(version),
                    ..Response::ok()
                },
                Err(e) => metadata_failed(e),
            }
        }

        Command::IssueActivationCode { email, name } => {
            info!("Processing issueActivationCode command");
            match state.activation.issue_call(&email, &name).await {
                Ok(issued) => Response {
                    expires_at: Some(issued.expires_at),
                    ..Response::ok_with(issued.message)
                },
                Err(e) => Response::error(e.code(), e.public_message()),
            }
        }

        Command::VerifyActivationCode { email, code } => {
            info!("Processing verifyActivationCode command");
            match state.activation.verify_call(&email, &code).await {
                Ok(()) => Response::ok_with("Account activated"),
                Err(e) => Response::error(e.code(), e.public_message()),
            }
        }

        Command::GetStatus => Response {
            version: Some(u64::from(PROTOCOL_VERSION)),
            ..Response::ok_with("healthy")
        },
    }
}

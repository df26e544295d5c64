//! Async Unix socket IPC server for daemon control.
//!
//! One JSON command per connection. Most commands get exactly one response
//! line; `follow` keeps the connection open and streams one `event` line per
//! conversation entry until either side hangs up.

use crate::error::{Result, VoiceError};
use crate::ipc::protocol::{Command, Response};
use crate::session::log::ConversationEvent;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::unix::OwnedWriteHalf;
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::{Mutex, broadcast};
use tracing::{debug, warn};

/// Backlog plus live feed for a `follow` client.
pub struct EventFeed {
    pub backlog: Vec<ConversationEvent>,
    pub live: broadcast::Receiver<ConversationEvent>,
}

/// Handler trait for processing IPC commands.
#[async_trait::async_trait]
pub trait CommandHandler: Send + Sync {
    /// Handle a command and return a response.
    async fn handle(&self, command: Command) -> Response;

    /// Open an event feed starting after `since`. `None` if unsupported.
    fn follow(&self, _since: u64) -> Option<EventFeed> {
        None
    }
}

/// State for managing server shutdown.
#[derive(Debug, Clone)]
struct ServerState {
    shutdown: Arc<Mutex<bool>>,
}

impl ServerState {
    fn new() -> Self {
        Self {
            shutdown: Arc::new(Mutex::new(false)),
        }
    }

    async fn is_shutdown(&self) -> bool {
        *self.shutdown.lock().await
    }

    async fn set_shutdown(&self) {
        *self.shutdown.lock().await = true;
    }
}

/// IPC server for handling daemon control commands via Unix socket.
pub struct IpcServer {
    socket_path: PathBuf,
    state: ServerState,
}

impl IpcServer {
    /// Create a new IPC server bound to the specified socket path.
    pub fn new(socket_path: PathBuf) -> Result<Self> {
        Ok(Self {
            socket_path,
            state: ServerState::new(),
        })
    }

    /// Get the socket path this server is using.
    pub fn socket_path(&self) -> &Path {
        &self.socket_path
    }

    /// Get the default socket path based on XDG_RUNTIME_DIR or fallback.
    pub fn default_socket_path() -> PathBuf {
        if let Ok(xdg_runtime) = std::env::var("XDG_RUNTIME_DIR") {
            PathBuf::from(xdg_runtime).join("medvoice.sock")
        } else {
            // SAFETY: getuid has no preconditions and cannot fail.
            let uid = unsafe { libc::getuid() };
            PathBuf::from(format!("/tmp/medvoice-{}.sock", uid))
        }
    }

    /// Start the IPC server and handle incoming connections.
    pub async fn start<H>(&self, handler: H) -> Result<()>
    where
        H: CommandHandler + 'static,
    {
        // Clean up any existing socket file
        if self.socket_path.exists() {
            std::fs::remove_file(&self.socket_path).map_err(|e| VoiceError::IpcSocket {
                message: format!("Failed to remove existing socket: {}", e),
            })?;
        }

        let listener =
            UnixListener::bind(&self.socket_path).map_err(|e| VoiceError::IpcSocket {
                message: format!("Failed to bind to socket: {}", e),
            })?;

        let handler = Arc::new(handler);

        loop {
            if self.state.is_shutdown().await {
                break;
            }

            // Accept with a timeout so the shutdown flag is checked regularly
            let accept_result =
                tokio::time::timeout(tokio::time::Duration::from_millis(100), listener.accept())
                    .await;

            match accept_result {
                Ok(Ok((stream, _))) => {
                    let handler = Arc::clone(&handler);
                    tokio::spawn(async move {
                        if let Err(e) = handle_client(stream, handler).await {
                            warn!(error = %e, "error handling IPC client");
                        }
                    });
                }
                Ok(Err(e)) => {
                    return Err(VoiceError::IpcConnection {
                        message: format!("Failed to accept connection: {}", e),
                    });
                }
                Err(_) => continue,
            }
        }

        Ok(())
    }

    /// Stop the IPC server and clean up the socket file.
    pub async fn stop(&self) -> Result<()> {
        self.state.set_shutdown().await;

        if self.socket_path.exists() {
            std::fs::remove_file(&self.socket_path).map_err(|e| VoiceError::IpcSocket {
                message: format!("Failed to remove socket file: {}", e),
            })?;
        }

        Ok(())
    }
}

async fn write_response(writer: &mut OwnedWriteHalf, response: &Response) -> Result<()> {
    let mut line = response.to_json().map_err(|e| VoiceError::IpcProtocol {
        message: format!("Failed to serialize response: {}", e),
    })?;
    line.push('\n');

    writer
        .write_all(line.as_bytes())
        .await
        .map_err(|e| VoiceError::IpcConnection {
            message: format!("Failed to write to client: {}", e),
        })?;

    writer
        .flush()
        .await
        .map_err(|e| VoiceError::IpcConnection {
            message: format!("Failed to flush writer: {}", e),
        })
}

/// Handle a single client connection.
async fn handle_client<H>(stream: UnixStream, handler: Arc<H>) -> Result<()>
where
    H: CommandHandler,
{
    let (reader, mut writer) = stream.into_split();
    let mut reader = BufReader::new(reader);
    let mut line = String::new();

    reader
        .read_line(&mut line)
        .await
        .map_err(|e| VoiceError::IpcConnection {
            message: format!("Failed to read from client: {}", e),
        })?;

    let command = match Command::from_json(line.trim()) {
        Ok(command) => command,
        Err(e) => {
            let response = Response::Error {
                message: format!("Invalid command: {}", e),
            };
            write_response(&mut writer, &response).await?;
            return Err(VoiceError::IpcProtocol {
                message: format!("Failed to parse command: {}", e),
            });
        }
    };

    if let Command::Follow { since } = command {
        return stream_events(&mut writer, handler.follow(since)).await;
    }

    let response = handler.handle(command).await;
    write_response(&mut writer, &response).await
}

async fn stream_events(writer: &mut OwnedWriteHalf, feed: Option<EventFeed>) -> Result<()> {
    let Some(EventFeed { backlog, mut live }) = feed else {
        let response = Response::Error {
            message: "follow is not supported".to_string(),
        };
        return write_response(writer, &response).await;
    };

    for event in backlog {
        write_response(writer, &Response::Event { event }).await?;
    }

    loop {
        match live.recv().await {
            Ok(event) => write_response(writer, &Response::Event { event }).await?,
            Err(broadcast::error::RecvError::Lagged(missed)) => {
                let response = Response::Error {
                    message: format!(
                        "{} events skipped, use history to catch up",
                        missed
                    ),
                };
                write_response(writer, &response).await?;
            }
            Err(broadcast::error::RecvError::Closed) => {
                debug!("event feed closed");
                return Ok(());
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::Agent;
    use crate::session::log::{ConversationLog, EventKind};
    use tempfile::TempDir;
    use tokio::io::AsyncReadExt;

    // Mock handler for testing
    struct MockCommandHandler {
        log: ConversationLog,
    }

    impl MockCommandHandler {
        fn new() -> Self {
            let log = ConversationLog::new(16);
            log.append(EventKind::SystemNotice, "Connected to triage agent", Agent::Triage);
            log.append(EventKind::UserUtterance, "hello", Agent::Triage);
            Self { log }
        }
    }

    #[async_trait::async_trait]
    impl CommandHandler for MockCommandHandler {
        async fn handle(&self, command: Command) -> Response {
            match command {
                Command::Status => Response::Status {
                    session: Default::default(),
                    endpoint: "mock://backend".to_string(),
                    device: "mock microphone".to_string(),
                    log_entries: self.log.len() as u64,
                },
                Command::Transfer { agent } => Response::Transferred { agent },
                Command::History { since } => Response::History {
                    events: self.log.view().since(since),
                },
                Command::SendText { text } => {
                    self.log.append(EventKind::UserUtterance, text, Agent::Triage);
                    Response::Ok
                }
                _ => Response::Ok,
            }
        }

        fn follow(&self, since: u64) -> Option<EventFeed> {
            let (backlog, live) = self.log.view().follow(since);
            Some(EventFeed { backlog, live })
        }
    }

    async fn roundtrip(socket_path: &Path, command: Command) -> Response {
        let mut stream = UnixStream::connect(socket_path).await.unwrap();
        let command_json = format!("{}\n", command.to_json().unwrap());
        stream.write_all(command_json.as_bytes()).await.unwrap();

        let mut response_data = Vec::new();
        stream.read_to_end(&mut response_data).await.unwrap();
        let response_str = String::from_utf8(response_data).unwrap();
        Response::from_json(response_str.trim()).unwrap()
    }

    fn start_server(socket_path: PathBuf) -> tokio::task::JoinHandle<Result<()>> {
        tokio::spawn(async move {
            let server = IpcServer::new(socket_path).unwrap();
            server.start(MockCommandHandler::new()).await
        })
    }

    #[test]
    fn test_default_socket_path_returns_valid_path() {
        let path = IpcServer::default_socket_path();
        let path_str = path.to_string_lossy();
        if std::env::var("XDG_RUNTIME_DIR").is_ok() {
            assert!(
                path_str.ends_with("medvoice.sock"),
                "With XDG_RUNTIME_DIR, expected path ending with medvoice.sock, got: {:?}",
                path
            );
        } else {
            let uid = unsafe { libc::getuid() };
            assert_eq!(path_str, format!("/tmp/medvoice-{}.sock", uid));
        }
    }

    #[tokio::test]
    async fn test_server_binds_to_socket() {
        let temp_dir = TempDir::new().unwrap();
        let socket_path = temp_dir.path().join("test.sock");
        let server_handle = start_server(socket_path.clone());

        tokio::time::sleep(tokio::time::Duration::from_millis(50)).await;
        assert!(socket_path.exists());

        server_handle.abort();
    }

    #[tokio::test]
    async fn test_status_and_history() {
        let temp_dir = TempDir::new().unwrap();
        let socket_path = temp_dir.path().join("test.sock");
        let _server_handle = start_server(socket_path.clone());
        tokio::time::sleep(tokio::time::Duration::from_millis(50)).await;

        match roundtrip(&socket_path, Command::Status).await {
            Response::Status { log_entries, .. } => assert_eq!(log_entries, 2),
            other => panic!("Expected Status response, got {:?}", other),
        }

        match roundtrip(&socket_path, Command::History { since: 1 }).await {
            Response::History { events } => {
                assert_eq!(events.len(), 1);
                assert_eq!(events[0].text, "hello");
            }
            other => panic!("Expected History response, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_multiple_concurrent_clients() {
        let temp_dir = TempDir::new().unwrap();
        let socket_path = temp_dir.path().join("test.sock");
        let _server_handle = start_server(socket_path.clone());
        tokio::time::sleep(tokio::time::Duration::from_millis(50)).await;

        let mut client_handles = vec![];
        for i in 0..5 {
            let socket_path = socket_path.clone();
            client_handles.push(tokio::spawn(async move {
                let command = if i % 2 == 0 {
                    Command::Status
                } else {
                    Command::Transfer {
                        agent: Agent::Billing,
                    }
                };
                roundtrip(&socket_path, command).await
            }));
        }

        for handle in client_handles {
            let response = handle.await.unwrap();
            assert!(matches!(
                response,
                Response::Status { .. } | Response::Transferred { .. }
            ));
        }
    }

    #[tokio::test]
    async fn test_invalid_json_gets_error_response() {
        let temp_dir = TempDir::new().unwrap();
        let socket_path = temp_dir.path().join("test.sock");
        let _server_handle = start_server(socket_path.clone());
        tokio::time::sleep(tokio::time::Duration::from_millis(50)).await;

        let mut stream = UnixStream::connect(&socket_path).await.unwrap();
        stream.write_all(b"not valid json\n").await.unwrap();

        let mut response_data = Vec::new();
        stream.read_to_end(&mut response_data).await.unwrap();
        let response = Response::from_json(String::from_utf8(response_data).unwrap().trim()).unwrap();
        assert!(matches!(response, Response::Error { .. }));
    }

    #[tokio::test]
    async fn test_follow_streams_backlog_then_live_events() {
        let temp_dir = TempDir::new().unwrap();
        let socket_path = temp_dir.path().join("test.sock");
        let _server_handle = start_server(socket_path.clone());
        tokio::time::sleep(tokio::time::Duration::from_millis(50)).await;

        let stream = UnixStream::connect(&socket_path).await.unwrap();
        let (reader, mut writer) = stream.into_split();
        let mut lines = BufReader::new(reader).lines();
        writer
            .write_all(format!("{}\n", Command::Follow { since: 1 }.to_json().unwrap()).as_bytes())
            .await
            .unwrap();

        let first = Response::from_json(&lines.next_line().await.unwrap().unwrap()).unwrap();
        match first {
            Response::Event { event } => assert_eq!(event.id, 2),
            other => panic!("Expected Event, got {:?}", other),
        }

        let response = roundtrip(
            &socket_path,
            Command::SendText {
                text: "live".to_string(),
            },
        )
        .await;
        assert_eq!(response, Response::Ok);

        let next = Response::from_json(&lines.next_line().await.unwrap().unwrap()).unwrap();
        match next {
            Response::Event { event } => {
                assert_eq!(event.id, 3);
                assert_eq!(event.text, "live");
            }
            other => panic!("Expected Event, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_server_stop_removes_socket() {
        let temp_dir = TempDir::new().unwrap();
        let socket_path = temp_dir.path().join("test.sock");
        let server = Arc::new(IpcServer::new(socket_path.clone()).unwrap());

        let running = Arc::clone(&server);
        let task = tokio::spawn(async move { running.start(MockCommandHandler::new()).await });
        tokio::time::sleep(tokio::time::Duration::from_millis(50)).await;
        assert!(socket_path.exists());

        server.stop().await.unwrap();
        assert!(task.await.unwrap().is_ok());
        assert!(!socket_path.exists());
    }
}

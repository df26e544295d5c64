//! Command handler implementation for the daemon.

use crate::daemon::DaemonState;
use crate::error::VoiceError;
use crate::identity::Credential;
use crate::ipc::protocol::{Command, Response};
use crate::ipc::server::{CommandHandler, EventFeed};
use std::sync::Arc;
use tracing::info;

/// Command handler for daemon IPC commands.
pub struct DaemonCommandHandler {
    state: Arc<DaemonState>,
}

impl DaemonCommandHandler {
    /// Creates a new command handler.
    pub fn new(state: Arc<DaemonState>) -> Self {
        Self { state }
    }

    fn outcome(result: Result<(), VoiceError>) -> Response {
        match result {
            Ok(()) => Response::Ok,
            Err(e) => Response::Error {
                message: e.to_string(),
            },
        }
    }

    async fn connect(&self, token: String) -> Response {
        let token = token.trim();
        if token.is_empty() {
            return Response::Error {
                message: "A bearer token is required to connect".to_string(),
            };
        }
        Self::outcome(self.state.session.connect(Credential::bearer(token)).await)
    }

    async fn transfer(&self, agent: crate::agent::Agent) -> Response {
        match self.state.session.request_transfer(agent).await {
            Ok(agent) => Response::Transferred { agent },
            Err(e) => Response::Error {
                message: e.to_string(),
            },
        }
    }

    /// Get session status.
    fn get_status(&self) -> Response {
        let session = &self.state.session;
        Response::Status {
            session: session.snapshot(),
            endpoint: session.endpoint().to_string(),
            device: session.device().to_string(),
            log_entries: session.log().last_id(),
        }
    }
}

#[async_trait::async_trait]
impl CommandHandler for DaemonCommandHandler {
    async fn handle(&self, command: Command) -> Response {
        let session = &self.state.session;
        match command {
            Command::Connect { token } => self.connect(token).await,
            Command::Disconnect => {
                session.disconnect().await;
                Response::Ok
            }
            Command::AcknowledgeError => Self::outcome(session.acknowledge_error().await),
            Command::StartListening => Self::outcome(session.start_listening().await),
            Command::StopListening => Self::outcome(session.stop_listening().await),
            Command::SendText { text } => Self::outcome(session.send_text(&text).await),
            Command::Transfer { agent } => self.transfer(agent).await,
            Command::Status => self.get_status(),
            Command::History { since } => Response::History {
                events: session.log().since(since),
            },
            // Streamed by the server through `follow`
            Command::Follow { .. } => Response::Error {
                message: "follow must be the only command on its connection".to_string(),
            },
            Command::Shutdown => {
                info!("shutdown requested over IPC");
                self.state.shutdown.notify_one();
                Response::Ok
            }
        }
    }

    fn follow(&self, since: u64) -> Option<EventFeed> {
        let (backlog, live) = self.state.session.log().follow(since);
        Some(EventFeed { backlog, live })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::Agent;
    use crate::audio::recorder::MockDeviceProvider;
    use crate::session::log::EventKind;
    use crate::session::state::ConnectionState;
    use crate::session::{SessionSettings, VoiceSession};
    use crate::transport::InboundFrame;
    use crate::transport::mock::{MockBackend, MockConnector};
    use std::time::Duration;

    fn create_test_handler() -> (DaemonCommandHandler, MockBackend) {
        let backend = MockBackend::new();
        let session = VoiceSession::spawn(
            SessionSettings::default(),
            Arc::new(MockConnector::new(backend.clone())),
            Arc::new(MockDeviceProvider::default()),
        );
        let state = Arc::new(DaemonState::new(session));
        (DaemonCommandHandler::new(state), backend)
    }

    #[tokio::test]
    async fn test_handler_status_initially_disconnected() {
        let (handler, _backend) = create_test_handler();
        match handler.handle(Command::Status).await {
            Response::Status {
                session,
                endpoint,
                log_entries,
                ..
            } => {
                assert_eq!(session.connection_state, ConnectionState::Disconnected);
                assert_eq!(endpoint, "mock://backend");
                assert_eq!(log_entries, 0);
            }
            other => panic!("Expected Status response, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_connect_requires_token() {
        let (handler, backend) = create_test_handler();
        let response = handler
            .handle(Command::Connect {
                token: "  ".to_string(),
            })
            .await;
        assert!(matches!(response, Response::Error { .. }));
        assert_eq!(backend.open_count(), 0);
    }

    #[tokio::test]
    async fn test_connect_and_send_text() {
        let (handler, backend) = create_test_handler();
        let response = handler
            .handle(Command::Connect {
                token: "tok".to_string(),
            })
            .await;
        assert_eq!(response, Response::Ok);
        assert_eq!(backend.last_credential(), Some(Credential::bearer("tok")));

        let response = handler
            .handle(Command::SendText {
                text: "I need billing help".to_string(),
            })
            .await;
        assert_eq!(response, Response::Ok);

        match handler.handle(Command::History { since: 0 }).await {
            Response::History { events } => {
                let kinds: Vec<EventKind> = events.iter().map(|e| e.kind).collect();
                assert_eq!(kinds, vec![EventKind::SystemNotice, EventKind::UserUtterance]);
            }
            other => panic!("Expected History response, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_transfer_resolves_with_backend_choice() {
        let (handler, backend) = create_test_handler();
        handler
            .handle(Command::Connect {
                token: "tok".to_string(),
            })
            .await;

        let pusher = backend.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            pusher.push(InboundFrame::AgentTransfer {
                new_agent: Agent::Support,
            });
        });

        let response = handler
            .handle(Command::Transfer {
                agent: Agent::Billing,
            })
            .await;
        assert_eq!(
            response,
            Response::Transferred {
                agent: Agent::Support
            }
        );
    }

    #[tokio::test]
    async fn test_send_text_while_disconnected_is_error() {
        let (handler, _backend) = create_test_handler();
        let response = handler
            .handle(Command::SendText {
                text: "hello".to_string(),
            })
            .await;
        match response {
            Response::Error { message } => assert!(message.contains("disconnected")),
            other => panic!("Expected Error response, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_handler_shutdown_notifies() {
        let (handler, _backend) = create_test_handler();
        let response = handler.handle(Command::Shutdown).await;
        assert_eq!(response, Response::Ok);

        tokio::time::timeout(Duration::from_secs(1), handler.state.shutdown.notified())
            .await
            .expect("shutdown should have been signalled");
    }
}

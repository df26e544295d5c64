//! Daemon mode: one voice session behind the IPC server.

pub mod handler;

use crate::audio::capture::{CpalDeviceProvider, suppress_audio_warnings};
use crate::config::Config;
use crate::error::{Result, VoiceError};
use crate::ipc::server::IpcServer;
use crate::session::{SessionSettings, VoiceSession};
use crate::transport::ws::WsConnector;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::Notify;
use tracing::{info, warn};

/// What the command handler shares with the daemon loop.
pub struct DaemonState {
    /// The hosted session
    pub session: VoiceSession,
    /// Signalled by the `shutdown` command
    pub shutdown: Notify,
}

impl DaemonState {
    pub fn new(session: VoiceSession) -> Self {
        Self {
            session,
            shutdown: Notify::new(),
        }
    }
}

/// Run the daemon: start the session and IPC server, wait for shutdown.
///
/// Shutdown comes from SIGINT, SIGTERM, or the `shutdown` IPC command. The
/// session is disconnected before the socket is removed.
pub async fn run_daemon(config: Config, socket_path: Option<PathBuf>) -> Result<()> {
    suppress_audio_warnings();
    config.validate()?;

    let connector = WsConnector::new(config.transport.url.clone(), config.transport.inbound_buffer)
        .with_close_timeout(config.transport.close_timeout());
    let devices = CpalDeviceProvider::new(config.audio.device.clone(), config.audio.sample_rate);
    let session = VoiceSession::spawn(
        SessionSettings::from(&config),
        Arc::new(connector),
        Arc::new(devices),
    );
    info!(
        session = %session.id(),
        endpoint = session.endpoint(),
        device = session.device(),
        "session ready"
    );

    let state = Arc::new(DaemonState::new(session.clone()));

    let socket_path = socket_path.unwrap_or_else(IpcServer::default_socket_path);
    let server = Arc::new(IpcServer::new(socket_path)?);
    info!(socket = %server.socket_path().display(), "IPC server listening");

    let handler = handler::DaemonCommandHandler::new(Arc::clone(&state));
    let server_clone = Arc::clone(&server);
    let server_handle = tokio::spawn(async move { server_clone.start(handler).await });

    tokio::select! {
        _ = tokio::signal::ctrl_c() => info!("received SIGINT, shutting down"),
        res = wait_for_sigterm() => {
            if let Err(e) = res {
                warn!(error = %e, "error setting up signal handler");
            }
            info!("received SIGTERM, shutting down");
        }
        _ = state.shutdown.notified() => {}
    }

    session.shutdown().await;
    server.stop().await?;

    match server_handle.await {
        Ok(Err(e)) => warn!(error = %e, "IPC server stopped with an error"),
        Err(e) => warn!(error = %e, "IPC server task failed"),
        Ok(Ok(())) => {}
    }

    info!("daemon stopped");
    Ok(())
}

/// Wait for SIGTERM signal (used by systemd).
#[cfg(unix)]
async fn wait_for_sigterm() -> Result<()> {
    use tokio::signal::unix::{SignalKind, signal};
    let mut sigterm = signal(SignalKind::terminate())
        .map_err(|e| VoiceError::Other(format!("Failed to register SIGTERM handler: {}", e)))?;
    sigterm.recv().await;
    Ok(())
}

#[cfg(not(unix))]
async fn wait_for_sigterm() -> Result<()> {
    std::future::pending::<()>().await;
    Ok(())
}

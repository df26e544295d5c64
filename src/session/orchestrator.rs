//! The voice session: one actor task that owns every piece of mutable state.
//!
//! [`VoiceSession`] is a cheap, cloneable handle. Each operation becomes a
//! command on the actor's queue; inbound frames, capture events, connect and
//! acquisition results, and the transfer deadline are all handled by the same
//! `select!` loop, so no two state mutations ever interleave.

use crate::agent::Agent;
use crate::audio::recorder::{AudioSource, DeviceProvider};
use crate::audio::turn::{CaptureEvent, CaptureSettings, CaptureUnit, SequenceCheck};
use crate::config::Config;
use crate::defaults;
use crate::error::{ConnectError, Result, SendError, VoiceError};
use crate::identity::Credential;
use crate::session::log::{ConversationLog, EventKind, LogView};
use crate::session::router::{AgentRouter, TransferOutcome, TransferRequest};
use crate::session::state::{ConnectionState, SessionSnapshot, SessionState};
use crate::transport::{Channel, Connector, InboundEvent, InboundFrame, OutboundFrame};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::{JoinError, JoinHandle};
use tokio::time::Instant;
use tracing::{Instrument, debug, info, warn};
use uuid::Uuid;

/// Timeouts and sizing for one session.
#[derive(Debug, Clone)]
pub struct SessionSettings {
    /// Agent a fresh session starts with
    pub default_agent: Agent,
    /// Bound on `connect()`
    pub connect_timeout: Duration,
    /// Bound on waiting for a transfer confirmation
    pub transfer_timeout: Duration,
    /// Consecutive failed connects before `Error` falls back to `Disconnected`
    pub error_retry_budget: u32,
    /// Bound on writing one frame
    pub send_timeout: Duration,
    /// Bound on the close handshake
    pub close_timeout: Duration,
    /// Sample rate announced in audio frames
    pub sample_rate: u32,
    pub capture: CaptureSettings,
    pub command_buffer: usize,
    pub feed_capacity: usize,
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self {
            default_agent: Agent::default(),
            connect_timeout: Duration::from_millis(defaults::CONNECT_TIMEOUT_MS),
            transfer_timeout: Duration::from_millis(defaults::TRANSFER_TIMEOUT_MS),
            error_retry_budget: defaults::ERROR_RETRY_BUDGET,
            send_timeout: Duration::from_millis(defaults::SEND_TIMEOUT_MS),
            close_timeout: Duration::from_millis(defaults::CLOSE_TIMEOUT_MS),
            sample_rate: defaults::SAMPLE_RATE,
            capture: CaptureSettings::default(),
            command_buffer: defaults::COMMAND_BUFFER,
            feed_capacity: defaults::EVENT_FEED_CAPACITY,
        }
    }
}

impl From<&Config> for SessionSettings {
    fn from(config: &Config) -> Self {
        Self {
            default_agent: config.session.default_agent,
            connect_timeout: config.session.connect_timeout(),
            transfer_timeout: config.session.transfer_timeout(),
            error_retry_budget: config.session.error_retry_budget,
            send_timeout: config.transport.send_timeout(),
            close_timeout: config.transport.close_timeout(),
            sample_rate: config.audio.sample_rate,
            capture: CaptureSettings::from(&config.audio),
            ..Self::default()
        }
    }
}

type Reply<T> = oneshot::Sender<Result<T>>;

enum SessionCommand {
    Connect {
        credential: Credential,
        reply: Reply<()>,
    },
    Disconnect {
        reply: oneshot::Sender<()>,
    },
    AcknowledgeError {
        reply: Reply<()>,
    },
    StartListening {
        reply: Reply<()>,
    },
    StopListening {
        reply: Reply<()>,
    },
    SendText {
        text: String,
        reply: Reply<()>,
    },
    RequestTransfer {
        agent: Agent,
        reply: Reply<Agent>,
    },
    Shutdown {
        reply: oneshot::Sender<()>,
    },
}

/// Handle to a running voice session.
#[derive(Clone)]
pub struct VoiceSession {
    id: Uuid,
    commands: mpsc::Sender<SessionCommand>,
    snapshot: watch::Receiver<SessionSnapshot>,
    log: LogView,
    endpoint: String,
    device: String,
}

impl VoiceSession {
    /// Start the session actor. Must be called within a tokio runtime.
    pub fn spawn(
        settings: SessionSettings,
        connector: Arc<dyn Connector>,
        devices: Arc<dyn DeviceProvider>,
    ) -> Self {
        let id = Uuid::new_v4();
        let (command_tx, command_rx) = mpsc::channel(settings.command_buffer.max(1));
        let state = SessionState::new(settings.default_agent, settings.error_retry_budget);
        let (snapshot_tx, snapshot_rx) = watch::channel(state.snapshot(None));
        let log = ConversationLog::new(settings.feed_capacity);
        let view = log.view();
        let endpoint = connector.endpoint();
        let capture = CaptureUnit::new(devices, settings.capture.clone());
        let device = capture.device_description();

        let actor = SessionActor {
            router: AgentRouter::new(settings.transfer_timeout),
            capture,
            settings,
            connector,
            state,
            log,
            channel: None,
            inbound: None,
            connecting: None,
            acquiring: None,
            transfer_reply: None,
            snapshot: snapshot_tx,
            commands: command_rx,
        };

        let span = tracing::info_span!("session", id = %id);
        tokio::spawn(actor.run().instrument(span));

        Self {
            id,
            commands: command_tx,
            snapshot: snapshot_rx,
            log: view,
            endpoint,
            device,
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    pub fn device(&self) -> &str {
        &self.device
    }

    async fn call<T>(&self, make: impl FnOnce(Reply<T>) -> SessionCommand) -> Result<T> {
        let (reply, rx) = oneshot::channel();
        self.commands
            .send(make(reply))
            .await
            .map_err(|_| VoiceError::SessionClosed)?;
        rx.await.map_err(|_| VoiceError::SessionClosed)?
    }

    /// Open the channel. Resolves once the transport is open, has failed, or
    /// the connect timeout has elapsed.
    pub async fn connect(&self, credential: Credential) -> Result<()> {
        self.call(|reply| SessionCommand::Connect { credential, reply })
            .await
    }

    /// Cancel everything in flight and return to `Disconnected`. Never fails.
    pub async fn disconnect(&self) {
        let (reply, rx) = oneshot::channel();
        if self
            .commands
            .send(SessionCommand::Disconnect { reply })
            .await
            .is_ok()
            && rx.await.is_err()
        {
            debug!("session stopped while disconnecting");
        }
    }

    /// Move `Error` back to `Disconnected`.
    pub async fn acknowledge_error(&self) -> Result<()> {
        self.call(|reply| SessionCommand::AcknowledgeError { reply })
            .await
    }

    /// Acquire the microphone and start streaming a turn.
    pub async fn start_listening(&self) -> Result<()> {
        self.call(|reply| SessionCommand::StartListening { reply })
            .await
    }

    /// Release the microphone and send the end-of-turn marker.
    pub async fn stop_listening(&self) -> Result<()> {
        self.call(|reply| SessionCommand::StopListening { reply })
            .await
    }

    pub async fn send_text(&self, text: &str) -> Result<()> {
        let text = text.to_string();
        self.call(|reply| SessionCommand::SendText { text, reply })
            .await
    }

    /// Ask the backend to hand the conversation to `agent`.
    ///
    /// Resolves with the agent the backend actually routed to, which may differ
    /// from the one requested.
    pub async fn request_transfer(&self, agent: Agent) -> Result<Agent> {
        self.call(|reply| SessionCommand::RequestTransfer { agent, reply })
            .await
    }

    /// Disconnect and stop the actor. Later calls fail with `SessionClosed`.
    pub async fn shutdown(&self) {
        let (reply, rx) = oneshot::channel();
        if self
            .commands
            .send(SessionCommand::Shutdown { reply })
            .await
            .is_ok()
            && rx.await.is_err()
        {
            debug!("session already stopped");
        }
    }

    pub fn snapshot(&self) -> SessionSnapshot {
        self.snapshot.borrow().clone()
    }

    pub fn watch_state(&self) -> watch::Receiver<SessionSnapshot> {
        self.snapshot.clone()
    }

    pub fn log(&self) -> LogView {
        self.log.clone()
    }
}

struct PendingConnect {
    task: JoinHandle<std::result::Result<Box<dyn Channel>, ConnectError>>,
    reply: Reply<()>,
}

struct PendingAcquire {
    task: JoinHandle<Result<Box<dyn AudioSource>>>,
    replies: Vec<Reply<()>>,
}

struct SessionActor {
    settings: SessionSettings,
    connector: Arc<dyn Connector>,
    state: SessionState,
    log: ConversationLog,
    router: AgentRouter,
    capture: CaptureUnit,
    channel: Option<Box<dyn Channel>>,
    inbound: Option<mpsc::Receiver<InboundEvent>>,
    connecting: Option<PendingConnect>,
    acquiring: Option<PendingAcquire>,
    transfer_reply: Option<Reply<Agent>>,
    snapshot: watch::Sender<SessionSnapshot>,
    commands: mpsc::Receiver<SessionCommand>,
}

async fn join_pending<T>(task: Option<&mut JoinHandle<T>>) -> std::result::Result<T, JoinError> {
    match task {
        Some(task) => task.await,
        None => std::future::pending().await,
    }
}

async fn next_inbound(inbound: Option<&mut mpsc::Receiver<InboundEvent>>) -> InboundEvent {
    match inbound {
        Some(rx) => rx.recv().await.unwrap_or(InboundEvent::Closed {
            reason: "inbound stream ended".to_string(),
        }),
        None => std::future::pending().await,
    }
}

async fn sleep_until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

fn respond<T>(reply: oneshot::Sender<T>, value: T) {
    if reply.send(value).is_err() {
        debug!("caller went away before the reply");
    }
}

impl SessionActor {
    async fn run(mut self) {
        info!(endpoint = %self.connector.endpoint(), "session started");
        loop {
            tokio::select! {
                command = self.commands.recv() => {
                    match command {
                        Some(SessionCommand::Shutdown { reply }) => {
                            self.disconnect().await;
                            self.reply(reply, ());
                            break;
                        }
                        Some(command) => self.handle_command(command).await,
                        None => {
                            self.disconnect().await;
                            break;
                        }
                    }
                }
                result = join_pending(self.connecting.as_mut().map(|p| &mut p.task)) => {
                    self.finish_connect(result).await;
                }
                result = join_pending(self.acquiring.as_mut().map(|p| &mut p.task)) => {
                    self.finish_acquire(result).await;
                }
                event = next_inbound(self.inbound.as_mut()) => {
                    self.handle_inbound(event).await;
                }
                event = self.capture.next_event() => {
                    self.handle_capture(event).await;
                }
                _ = sleep_until(self.router.deadline()) => {
                    self.expire_transfer();
                }
            }
            self.publish();
        }
        info!("session stopped");
    }

    fn publish(&self) {
        let next = self
            .state
            .snapshot(self.router.pending().map(|request| request.to));
        self.snapshot.send_if_modified(|current| {
            if *current == next {
                false
            } else {
                *current = next;
                true
            }
        });
    }

    /// Publish first so a caller never reads a stale snapshot after its call
    /// returns.
    fn reply<T>(&self, reply: oneshot::Sender<T>, value: T) {
        self.publish();
        respond(reply, value);
    }

    /// The snapshot goes out before the entry that announces it.
    fn append(&self, kind: EventKind, text: impl Into<String>) {
        self.publish();
        self.log.append(kind, text, self.state.active_agent());
    }

    async fn handle_command(&mut self, command: SessionCommand) {
        match command {
            SessionCommand::Connect { credential, reply } => self.connect(credential, reply),
            SessionCommand::Disconnect { reply } => {
                self.disconnect().await;
                self.reply(reply, ());
            }
            SessionCommand::AcknowledgeError { reply } => {
                let result = self.state.check_acknowledge().map(|()| {
                    self.state.acknowledge();
                });
                self.reply(reply, result);
            }
            SessionCommand::StartListening { reply } => self.start_listening(reply),
            SessionCommand::StopListening { reply } => {
                let result = self.stop_listening().await;
                self.reply(reply, result);
            }
            SessionCommand::SendText { text, reply } => {
                let result = self.send_text(&text).await;
                self.reply(reply, result);
            }
            SessionCommand::RequestTransfer { agent, reply } => {
                self.request_transfer(agent, reply).await;
            }
            SessionCommand::Shutdown { reply } => self.reply(reply, ()),
        }
    }

    // Connection lifecycle

    fn connect(&mut self, credential: Credential, reply: Reply<()>) {
        if let Err(e) = self.state.check_connect() {
            self.reply(reply, Err(e));
            return;
        }

        self.state.begin_connecting();
        info!(agent = %self.state.active_agent(), "connecting");

        let connector = Arc::clone(&self.connector);
        let limit = self.settings.connect_timeout;
        let task = tokio::spawn(async move {
            match tokio::time::timeout(limit, connector.open(&credential)).await {
                Ok(result) => result,
                Err(_) => Err(ConnectError::Timeout(limit)),
            }
        });
        self.connecting = Some(PendingConnect { task, reply });
    }

    async fn finish_connect(
        &mut self,
        result: std::result::Result<std::result::Result<Box<dyn Channel>, ConnectError>, JoinError>,
    ) {
        let Some(pending) = self.connecting.take() else {
            return;
        };

        let outcome = match result {
            Ok(Ok(mut channel)) => match channel.take_inbound() {
                Some(inbound) => Ok((channel, inbound)),
                None => {
                    channel.close().await;
                    Err(ConnectError::Handshake {
                        message: "transport has no inbound stream".to_string(),
                    })
                }
            },
            Ok(Err(e)) => Err(e),
            Err(e) => Err(ConnectError::Unreachable {
                message: format!("connect task failed: {}", e),
            }),
        };

        match outcome {
            Ok((channel, inbound)) => {
                self.channel = Some(channel);
                self.inbound = Some(inbound);
                self.state.connected();
                let agent = self.state.active_agent();
                self.append(
                    EventKind::SystemNotice,
                    format!("Connected to {} agent", agent),
                );
                info!(%agent, "connected");
                self.reply(pending.reply, Ok(()));
            }
            Err(e) => {
                let error = VoiceError::Connect(e);
                warn!(error = %error, "connect failed");
                if self.state.connect_failed() {
                    warn!("retry budget exhausted, falling back to disconnected");
                }
                self.append(EventKind::ErrorNotice, error.to_string());
                self.reply(pending.reply, Err(error));
            }
        }
    }

    /// Tear everything down. Safe to call in any state, any number of times.
    async fn disconnect(&mut self) {
        if let Some(pending) = self.connecting.take() {
            pending.task.abort();
            self.reply(pending.reply, Err(VoiceError::Connect(ConnectError::Cancelled)));
            info!("in-flight connect cancelled");
        }

        self.cancel_acquisition("listening cancelled by disconnect");

        if let Some(turn) = self.capture.abort_turn().await {
            self.send_best_effort(OutboundFrame::TurnAborted { turn }).await;
        }

        if let Some(request) = self.router.abandon() {
            self.append(
                EventKind::ErrorNotice,
                format!("Transfer to {} agent abandoned: disconnected", request.to),
            );
            self.reply_transfer(Err(VoiceError::TransferRejected {
                agent: request.to,
                reason: "session disconnected".to_string(),
            }));
        }

        self.close_channel().await;

        let was_connected = self.state.connection() == ConnectionState::Connected;
        self.state.disconnected();
        if was_connected {
            let agent = self.state.active_agent();
            self.append(
                EventKind::SystemNotice,
                format!("Disconnected from {} agent", agent),
            );
            info!(%agent, "disconnected");
        }
    }

    /// The channel is dropped once `close_timeout` passes, finished or not.
    async fn close_channel(&mut self) {
        self.inbound = None;
        if let Some(mut channel) = self.channel.take() {
            let limit = self.settings.close_timeout;
            if tokio::time::timeout(limit, channel.close()).await.is_err() {
                warn!(
                    timeout_ms = limit.as_millis() as u64,
                    "close handshake timed out, dropping connection"
                );
            }
        }
    }

    /// The connection dropped underneath an active session.
    async fn connection_lost(&mut self, reason: &str) {
        if self.state.connection() != ConnectionState::Connected {
            debug!(reason, "close notice after the session already left connected");
            self.inbound = None;
            return;
        }

        warn!(reason, "connection lost");
        self.cancel_acquisition("connection lost");
        self.capture.abort_turn().await;
        if let Some(request) = self.router.abandon() {
            self.reply_transfer(Err(VoiceError::TransferRejected {
                agent: request.to,
                reason: "connection lost".to_string(),
            }));
        }
        self.close_channel().await;
        self.state.connection_lost();
        self.append(EventKind::ErrorNotice, format!("Connection lost: {}", reason));
    }

    // Sending

    /// A write that outlives `send_timeout` counts as a transport failure.
    async fn send(&mut self, frame: &OutboundFrame) -> std::result::Result<(), SendError> {
        let limit = self.settings.send_timeout;
        let Some(channel) = self.channel.as_mut() else {
            return Err(SendError::NotOpen);
        };
        match tokio::time::timeout(limit, channel.send(frame)).await {
            Ok(result) => result,
            Err(_) => Err(SendError::Transport {
                message: format!("write timed out after {}ms", limit.as_millis()),
            }),
        }
    }

    /// Send, retrying once immediately on a transport failure.
    async fn send_with_retry(&mut self, frame: OutboundFrame) -> std::result::Result<(), SendError> {
        match self.send(&frame).await {
            Ok(()) => {
                debug!(kind = frame.kind(), "frame sent");
                Ok(())
            }
            Err(SendError::NotOpen) => Err(SendError::NotOpen),
            Err(e) => {
                warn!(kind = frame.kind(), error = %e, "send failed, retrying once");
                self.send(&frame).await
            }
        }
    }

    async fn send_best_effort(&mut self, frame: OutboundFrame) {
        if let Err(e) = self.send(&frame).await {
            debug!(kind = frame.kind(), error = %e, "frame dropped");
        }
    }

    async fn send_text(&mut self, text: &str) -> Result<()> {
        let text = text.trim();
        if text.is_empty() {
            return Err(VoiceError::InvalidInput {
                message: "message is empty".to_string(),
            });
        }
        self.state.check_connected("send text")?;

        match self
            .send_with_retry(OutboundFrame::Text {
                text: text.to_string(),
            })
            .await
        {
            Ok(()) => {
                self.append(EventKind::UserUtterance, text);
                Ok(())
            }
            Err(e) => {
                let error = VoiceError::Send(e);
                self.append(EventKind::ErrorNotice, error.to_string());
                Err(error)
            }
        }
    }

    // Listening turns

    fn start_listening(&mut self, reply: Reply<()>) {
        if let Err(e) = self.state.check_start_listening() {
            self.reply(reply, Err(e));
            return;
        }
        if self.capture.is_listening() {
            debug!("already listening");
            self.reply(reply, Ok(()));
            return;
        }
        if let Some(pending) = self.acquiring.as_mut() {
            pending.replies.push(reply);
            return;
        }

        let task = tokio::spawn(self.capture.acquisition());
        self.acquiring = Some(PendingAcquire {
            task,
            replies: vec![reply],
        });
    }

    async fn finish_acquire(
        &mut self,
        result: std::result::Result<Result<Box<dyn AudioSource>>, JoinError>,
    ) {
        let Some(pending) = self.acquiring.take() else {
            return;
        };

        let result = match result {
            Ok(result) => result,
            Err(e) => Err(VoiceError::device(format!("device task failed: {}", e))),
        };

        let outcome = match result {
            Ok(mut source) => match self.state.check_start_listening() {
                Ok(()) => {
                    let turn = self.capture.begin_turn(source);
                    self.state.set_listening(true);
                    debug!(turn, "listening");
                    Ok(())
                }
                Err(e) => {
                    if let Err(stop_err) = source.stop() {
                        warn!(error = %stop_err, "failed to release unused microphone");
                    }
                    Err(e)
                }
            },
            Err(e) => {
                warn!(error = %e, "microphone acquisition failed");
                self.append(EventKind::ErrorNotice, e.to_string());
                Err(e)
            }
        };

        for reply in pending.replies {
            self.reply(reply, clone_outcome(&outcome));
        }
    }

    fn cancel_acquisition(&mut self, reason: &str) {
        if let Some(pending) = self.acquiring.take() {
            pending.task.abort();
            for reply in pending.replies {
                self.reply(reply, Err(VoiceError::device(reason)));
            }
        }
    }

    async fn stop_listening(&mut self) -> Result<()> {
        self.cancel_acquisition("listening stopped before the microphone started");
        if !self.capture.is_listening() {
            return Ok(());
        }
        self.finish_turn().await
    }

    /// Flush the tail of the turn, release the device and send end-of-turn.
    async fn finish_turn(&mut self) -> Result<()> {
        let mut interrupted = None;
        if let Some(tail) = self.capture.finish_turn().await {
            for event in tail.events {
                if interrupted.is_some() {
                    break;
                }
                match event {
                    CaptureEvent::Chunk(chunk) => {
                        if let Err(e) = self.forward_chunk(chunk).await {
                            interrupted = Some(e);
                        }
                    }
                    CaptureEvent::DeviceLost(e) => {
                        self.append(EventKind::ErrorNotice, e.to_string());
                    }
                    CaptureEvent::Ended => {}
                }
            }
        }

        let turn = self.capture.current_turn();
        let delivered = self.capture.close_turn().unwrap_or(0);
        self.state.set_listening(false);

        if let Some(e) = interrupted {
            let error = VoiceError::Send(e);
            self.append(EventKind::ErrorNotice, error.to_string());
            return Err(error);
        }

        let Some(turn) = turn else {
            return Ok(());
        };
        match self
            .send_with_retry(OutboundFrame::EndOfTurn {
                turn,
                chunks: delivered,
            })
            .await
        {
            Ok(()) => {
                info!(turn, chunks = delivered, "turn finished");
                Ok(())
            }
            Err(e) => {
                let error = VoiceError::Send(e);
                self.append(EventKind::ErrorNotice, error.to_string());
                Err(error)
            }
        }
    }

    async fn forward_chunk(
        &mut self,
        chunk: crate::audio::chunk::AudioChunk,
    ) -> std::result::Result<(), SendError> {
        match self.capture.accept(&chunk) {
            SequenceCheck::InOrder => {}
            SequenceCheck::Gap { from, to } => {
                warn!(turn = chunk.turn, from, to, "audio chunks lost");
                self.append(
                    EventKind::ErrorNotice,
                    format!("Audio lost: chunks {} to {} never arrived", from, to - 1),
                );
            }
            SequenceCheck::Stale => {
                debug!(turn = chunk.turn, seq = chunk.seq, "stale audio chunk dropped");
                return Ok(());
            }
        }

        self.send_with_retry(OutboundFrame::Audio {
            turn: chunk.turn,
            seq: chunk.seq,
            sample_rate: self.settings.sample_rate,
            data: chunk.encode_base64(),
        })
        .await
    }

    async fn handle_capture(&mut self, event: CaptureEvent) {
        match event {
            CaptureEvent::Chunk(chunk) => {
                let turn = chunk.turn;
                if let Err(e) = self.forward_chunk(chunk).await {
                    warn!(turn, error = %e, "audio stream interrupted");
                    self.capture.abort_turn().await;
                    self.state.set_listening(false);
                    self.send_best_effort(OutboundFrame::TurnAborted { turn }).await;
                    self.append(
                        EventKind::ErrorNotice,
                        format!("Listening stopped: {}", VoiceError::Send(e)),
                    );
                }
            }
            CaptureEvent::DeviceLost(e) => {
                warn!(error = %e, "microphone lost mid-turn");
                self.append(EventKind::ErrorNotice, e.to_string());
                if let Err(e) = self.finish_turn().await {
                    debug!(error = %e, "end of turn after device loss not delivered");
                }
            }
            CaptureEvent::Ended => {
                let error = VoiceError::device("capture stopped unexpectedly");
                self.append(EventKind::ErrorNotice, error.to_string());
                if let Err(e) = self.finish_turn().await {
                    debug!(error = %e, "end of turn after capture stop not delivered");
                }
            }
        }
    }

    /// Cut the current turn short without finalising it.
    async fn abort_turn(&mut self, reason: &str) {
        self.cancel_acquisition(reason);
        if let Some(turn) = self.capture.abort_turn().await {
            self.state.set_listening(false);
            self.send_best_effort(OutboundFrame::TurnAborted { turn }).await;
            self.append(
                EventKind::ErrorNotice,
                format!("Listening turn aborted: {}", reason),
            );
        }
    }

    // Transfers

    async fn request_transfer(&mut self, agent: Agent, reply: Reply<Agent>) {
        let active = self.state.active_agent();
        let request = match self.router.request(self.state.connection(), active, agent) {
            Ok(request) => request,
            Err(e) => {
                self.reply(reply, Err(e));
                return;
            }
        };

        info!(from = %request.from, to = %request.to, "transfer requested");
        match self
            .send_with_retry(OutboundFrame::TransferRequest {
                from: request.from,
                to: request.to,
            })
            .await
        {
            Ok(()) => self.transfer_reply = Some(reply),
            Err(e) => {
                self.router.abandon();
                let error = VoiceError::Send(e);
                self.append(EventKind::ErrorNotice, error.to_string());
                self.reply(reply, Err(error));
            }
        }
    }

    fn reply_transfer(&mut self, result: Result<Agent>) {
        if let Some(reply) = self.transfer_reply.take() {
            self.reply(reply, result);
        }
    }

    async fn apply_transfer(&mut self, confirmed: Agent) {
        let active = self.state.active_agent();
        match self.router.confirm(active, confirmed) {
            TransferOutcome::Applied { from, to, requested } => {
                if let Some(requested) = requested
                    && requested != to
                {
                    info!(%requested, %to, "backend rerouted transfer");
                }
                if self.capture.is_listening() || self.acquiring.is_some() {
                    self.abort_turn(&format!("transferred to {} agent", to))
                        .await;
                }
                self.state.set_active_agent(to);
                self.append(
                    EventKind::TransferNotice,
                    format!("Transferred from {} to {} agent", from, to),
                );
                info!(%from, %to, "transfer applied");
                self.reply_transfer(Ok(to));
            }
            TransferOutcome::Unchanged { requested } => {
                debug!(agent = %confirmed, ?requested, "transfer confirms active agent");
                self.reply_transfer(Ok(confirmed));
            }
        }
    }

    fn reject_transfer(&mut self, agent: Agent, reason: String) {
        let error = VoiceError::TransferRejected { agent, reason };
        warn!(error = %error, "transfer rejected");
        self.append(EventKind::ErrorNotice, error.to_string());
        if self.router.reject(agent).is_some() {
            self.reply_transfer(Err(error));
        }
    }

    fn expire_transfer(&mut self) {
        let Some(TransferRequest { to, .. }) = self.router.expire(Instant::now()) else {
            return;
        };
        let error = VoiceError::TransferRejected {
            agent: to,
            reason: format!(
                "no confirmation within {}ms",
                self.settings.transfer_timeout.as_millis()
            ),
        };
        warn!(error = %error, "transfer timed out");
        self.append(EventKind::ErrorNotice, error.to_string());
        self.reply_transfer(Err(error));
    }

    // Inbound

    async fn handle_inbound(&mut self, event: InboundEvent) {
        match event {
            InboundEvent::Frame(frame) => self.handle_frame(frame).await,
            InboundEvent::Invalid(e) => {
                let error = VoiceError::Protocol(e);
                warn!(error = %error, "ignoring frame");
                self.append(EventKind::ErrorNotice, error.to_string());
            }
            InboundEvent::Closed { reason } => self.connection_lost(&reason).await,
        }
    }

    async fn handle_frame(&mut self, frame: InboundFrame) {
        debug!(kind = frame.kind(), "handling frame");
        match frame {
            InboundFrame::Transcript { text } => {
                self.state.record_transcript(&text);
                self.append(EventKind::UserUtterance, text);
            }
            InboundFrame::AgentResponse { text } => {
                self.state.record_reply(&text);
                self.append(EventKind::AgentReply, text);
            }
            InboundFrame::AgentTransfer { new_agent } => self.apply_transfer(new_agent).await,
            InboundFrame::Error { message } => {
                warn!(message = %message, "backend error");
                self.append(EventKind::ErrorNotice, message);
            }
            InboundFrame::TransferRejected { agent, reason } => {
                self.reject_transfer(agent, reason);
            }
            InboundFrame::SpeechStarted => {
                if self.capture.is_listening()
                    && let Err(e) = self.finish_turn().await
                {
                    debug!(error = %e, "turn closed by agent speech");
                }
                self.state.set_speaking(true);
            }
            InboundFrame::SpeechFinished => self.state.set_speaking(false),
        }
    }
}

fn clone_outcome(outcome: &Result<()>) -> Result<()> {
    match outcome {
        Ok(()) => Ok(()),
        Err(VoiceError::Device { message }) => Err(VoiceError::device(message.clone())),
        Err(VoiceError::InvalidState { operation, state }) => Err(VoiceError::InvalidState {
            operation: *operation,
            state: state.clone(),
        }),
        Err(e) => Err(VoiceError::Other(e.to_string())),
    }
}

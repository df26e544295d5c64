//! In-process backend for tests.
//!
//! [`MockBackend`] is a cloneable handle onto the fake server: tests script what
//! the next handshake does, push inbound frames, and inspect what the session
//! sent. [`MockConnector`] is the [`Connector`] the session is given.

use super::{Channel, Connector, InboundEvent};
use crate::error::{ConnectError, SendError};
use crate::identity::Credential;
use crate::transport::protocol::{InboundFrame, OutboundFrame};
use async_trait::async_trait;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::mpsc;

/// What the next handshakes do.
#[derive(Debug, Clone, PartialEq)]
pub enum HandshakeBehavior {
    Accept,
    /// Accept after a delay.
    AcceptAfter(Duration),
    Refuse(ConnectError),
    /// Never complete.
    Hang,
}

#[derive(Debug)]
struct BackendState {
    behavior: HandshakeBehavior,
    inbound_capacity: usize,
    inbound: Option<mpsc::Sender<InboundEvent>>,
    sent: Vec<OutboundFrame>,
    fail_sends: usize,
    stalled: bool,
    open_count: usize,
    last_credential: Option<Credential>,
}

#[derive(Debug, Clone)]
pub struct MockBackend {
    state: Arc<Mutex<BackendState>>,
}

impl Default for MockBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl MockBackend {
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(BackendState {
                behavior: HandshakeBehavior::Accept,
                inbound_capacity: 64,
                inbound: None,
                sent: Vec::new(),
                fail_sends: 0,
                stalled: false,
                open_count: 0,
                last_credential: None,
            })),
        }
    }

    fn lock(&self) -> MutexGuard<'_, BackendState> {
        self.state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn set_behavior(&self, behavior: HandshakeBehavior) {
        self.lock().behavior = behavior;
    }

    /// Deliver a frame on the current connection. Returns false when no
    /// connection is open or its buffer is full.
    pub fn push(&self, frame: InboundFrame) -> bool {
        self.push_event(InboundEvent::Frame(frame))
    }

    /// Deliver raw JSON, decoded the way a real transport would.
    pub fn push_raw(&self, json: &str) -> bool {
        let event = match InboundFrame::from_json(json) {
            Ok(frame) => InboundEvent::Frame(frame),
            Err(e) => InboundEvent::Invalid(e),
        };
        self.push_event(event)
    }

    fn push_event(&self, event: InboundEvent) -> bool {
        let state = self.lock();
        match &state.inbound {
            Some(tx) => tx.try_send(event).is_ok(),
            None => false,
        }
    }

    /// Drop the current connection from the backend side.
    pub fn close_connection(&self, reason: &str) -> bool {
        let Some(tx) = self.lock().inbound.take() else {
            return false;
        };
        tx.try_send(InboundEvent::Closed {
            reason: reason.to_string(),
        })
        .is_ok()
    }

    /// Frames received from the session so far, across all connections.
    pub fn sent(&self) -> Vec<OutboundFrame> {
        self.lock().sent.clone()
    }

    /// Make the next `count` sends fail with a transport error.
    pub fn fail_next_sends(&self, count: usize) {
        self.lock().fail_sends = count;
    }

    /// Stop reading: while stalled, sends and the close handshake never finish.
    pub fn stall_writes(&self, stalled: bool) {
        self.lock().stalled = stalled;
    }

    /// Completed handshakes.
    pub fn open_count(&self) -> usize {
        self.lock().open_count
    }

    pub fn last_credential(&self) -> Option<Credential> {
        self.lock().last_credential.clone()
    }

    pub fn is_connected(&self) -> bool {
        self.lock().inbound.as_ref().is_some_and(|tx| !tx.is_closed())
    }
}

/// Connector that talks to a [`MockBackend`].
#[derive(Debug, Clone)]
pub struct MockConnector {
    backend: MockBackend,
}

impl MockConnector {
    pub fn new(backend: MockBackend) -> Self {
        Self { backend }
    }
}

#[async_trait]
impl Connector for MockConnector {
    async fn open(&self, credential: &Credential) -> Result<Box<dyn Channel>, ConnectError> {
        let behavior = self.backend.lock().behavior.clone();
        match behavior {
            HandshakeBehavior::Accept => {}
            HandshakeBehavior::AcceptAfter(delay) => tokio::time::sleep(delay).await,
            HandshakeBehavior::Refuse(err) => return Err(err),
            HandshakeBehavior::Hang => std::future::pending::<()>().await,
        }

        let mut state = self.backend.lock();
        let (tx, rx) = mpsc::channel(state.inbound_capacity);
        state.inbound = Some(tx);
        state.open_count += 1;
        state.last_credential = Some(credential.clone());
        Ok(Box::new(MockChannel {
            backend: self.backend.clone(),
            inbound: Some(rx),
            open: true,
        }))
    }

    fn endpoint(&self) -> String {
        "mock://backend".to_string()
    }
}

struct MockChannel {
    backend: MockBackend,
    inbound: Option<mpsc::Receiver<InboundEvent>>,
    open: bool,
}

#[async_trait]
impl Channel for MockChannel {
    async fn send(&mut self, frame: &OutboundFrame) -> Result<(), SendError> {
        if !self.open {
            return Err(SendError::NotOpen);
        }
        if self.backend.lock().stalled {
            std::future::pending::<()>().await;
        }
        let mut state = self.backend.lock();
        if state.fail_sends > 0 {
            state.fail_sends -= 1;
            return Err(SendError::Transport {
                message: "mock write failure".to_string(),
            });
        }
        state.sent.push(frame.clone());
        Ok(())
    }

    fn take_inbound(&mut self) -> Option<mpsc::Receiver<InboundEvent>> {
        self.inbound.take()
    }

    async fn close(&mut self) {
        self.open = false;
        if self.backend.lock().stalled {
            std::future::pending::<()>().await;
        }
    }

    fn is_open(&self) -> bool {
        self.open
    }
}

//! Transport seam under a session
//!
//! The session only needs to hand a message to the wire and to close it.
//! [`ChannelTransport`] is an in-process implementation over a tokio channel,
//! used for loopback sessions and tests.

use crate::error::{Error, Result};
use crate::rpc::RpcMessage;
use crate::session::RpcSession;
use async_trait::async_trait;
use std::fmt;
use std::sync::{Arc, Mutex, PoisonError, Weak};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, trace};

#[async_trait]
pub trait Transport: Send + Sync + fmt::Debug {
    async fn send(&self, msg: RpcMessage) -> Result<()>;

    /// Stop sending; the peer observes a disconnect
    async fn close(&self);

    fn is_closed(&self) -> bool;
}

/// Sends into an unbounded channel whose receiver belongs to the peer
pub struct ChannelTransport {
    remote: String,
    tx: Mutex<Option<mpsc::UnboundedSender<RpcMessage>>>,
}

impl ChannelTransport {
    /// Create a transport towards `remote` and the receiver the peer reads
    pub fn channel(remote: &str) -> (Self, mpsc::UnboundedReceiver<RpcMessage>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (
            Self {
                remote: remote.to_string(),
                tx: Mutex::new(Some(tx)),
            },
            rx,
        )
    }

    fn sender(&self) -> Option<mpsc::UnboundedSender<RpcMessage>> {
        self.tx
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

#[async_trait]
impl Transport for ChannelTransport {
    async fn send(&self, msg: RpcMessage) -> Result<()> {
        let Some(tx) = self.sender() else {
            return Err(Error::disconnected(&format!(
                "transport to {} is closed",
                self.remote
            )));
        };
        trace!("send to {}: {:?}", self.remote, msg);
        tx.send(msg)
            .map_err(|_| Error::disconnected(&format!("{} hung up", self.remote)))
    }

    async fn close(&self) {
        if self
            .tx
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
            .is_some()
        {
            debug!("closed transport to {}", self.remote);
        }
    }

    fn is_closed(&self) -> bool {
        match self.sender() {
            Some(tx) => tx.is_closed(),
            None => true,
        }
    }
}

impl fmt::Debug for ChannelTransport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ChannelTransport")
            .field("remote", &self.remote)
            .field("closed", &self.is_closed())
            .finish()
    }
}

/// Deliver everything arriving on `rx` to `session`, one message at a time
///
/// The task holds only a weak reference: once the session is dropped the
/// remaining input is discarded. A closed channel is reported as a
/// disconnect.
pub fn spawn_reader(
    session: &Arc<RpcSession>,
    mut rx: mpsc::UnboundedReceiver<RpcMessage>,
) -> JoinHandle<()> {
    let session: Weak<RpcSession> = Arc::downgrade(session);
    tokio::spawn(async move {
        while let Some(msg) = rx.recv().await {
            let Some(session) = session.upgrade() else {
                return;
            };
            if let Err(e) = session.deliver(msg).await {
                debug!("{}: delivery failed: {}", session.remote(), e);
            }
        }
        if let Some(session) = session.upgrade() {
            session.on_disconnected().await;
        }
    })
}

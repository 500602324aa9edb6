//! Message channels between the coordinator and its agents.
//!
//! Each agent has one duplex link made of two one-way halves: an
//! [`AgentChannel`] to write into and an [`Inbox`] to read from. Delivery is
//! FIFO per half.

use std::fmt;

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use crate::error::ChannelError;
use crate::protocol::Message;

/// Identity of an agent.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct AgentId(String);

impl AgentId {
    /// A fresh random id.
    pub fn new() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for AgentId {
    fn default() -> Self {
        Self::new()
    }
}

impl From<&str> for AgentId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl From<String> for AgentId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

impl fmt::Display for AgentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Writable half of a link.
pub trait AgentChannel: Send + Sync {
    /// Queue a message for the peer. Never blocks.
    fn send(&self, message: Message) -> Result<(), ChannelError>;

    /// Whether the peer can still receive.
    fn is_writable(&self) -> bool;
}

/// In-memory channel half backed by an unbounded tokio mpsc sender.
#[derive(Debug, Clone)]
pub struct MemoryChannel {
    peer: String,
    tx: mpsc::UnboundedSender<Message>,
}

impl MemoryChannel {
    pub fn new(peer: impl Into<String>, tx: mpsc::UnboundedSender<Message>) -> Self {
        Self {
            peer: peer.into(),
            tx,
        }
    }
}

impl AgentChannel for MemoryChannel {
    fn send(&self, message: Message) -> Result<(), ChannelError> {
        self.tx.send(message).map_err(|_| ChannelError::Closed {
            peer: self.peer.clone(),
        })
    }

    fn is_writable(&self) -> bool {
        !self.tx.is_closed()
    }
}

/// Readable half of a link.
#[derive(Debug)]
pub struct Inbox {
    rx: mpsc::UnboundedReceiver<Message>,
    closed: bool,
}

impl Inbox {
    pub fn new(rx: mpsc::UnboundedReceiver<Message>) -> Self {
        Self { rx, closed: false }
    }

    /// Next message, or `None` once every sender is gone and the queue is drained.
    pub async fn recv(&mut self) -> Option<Message> {
        if self.closed {
            return None;
        }
        let message = self.rx.recv().await;
        if message.is_none() {
            self.closed = true;
        }
        message
    }

    /// Whether more messages may still arrive.
    pub fn is_readable(&self) -> bool {
        !self.closed
    }

    pub fn into_inner(self) -> mpsc::UnboundedReceiver<Message> {
        self.rx
    }
}

/// One in-memory half: the writer goes to one side, the inbox to the other.
pub fn memory(peer: impl Into<String>) -> (MemoryChannel, Inbox) {
    let (tx, rx) = mpsc::unbounded_channel();
    (MemoryChannel::new(peer, tx), Inbox::new(rx))
}

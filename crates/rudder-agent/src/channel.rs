//! Bounded packet channels
//!
//! Commands flow from the reconciler to the executor, responses from both to
//! the reporter. Both queues are bounded and senders wait when they are full:
//! a dropped command would lose a desired-state transition. The response
//! queue is usually given more room since reports are cheap to hold.

use tokio::sync::mpsc;

use crate::error::{AgentError, Result};
use crate::packet::Packet;

pub const DEFAULT_COMMAND_CAPACITY: usize = 100;
pub const DEFAULT_RESPONSE_CAPACITY: usize = 1000;

/// Sending half of both queues
#[derive(Debug, Clone)]
pub struct Outbox {
    commands: mpsc::Sender<Packet>,
    responses: mpsc::Sender<Packet>,
}

/// Receiving half of both queues
#[derive(Debug)]
pub struct Inbox {
    pub commands: mpsc::Receiver<Packet>,
    pub responses: mpsc::Receiver<Packet>,
}

pub fn channels(command_capacity: usize, response_capacity: usize) -> (Outbox, Inbox) {
    let (command_tx, command_rx) = mpsc::channel(command_capacity.max(1));
    let (response_tx, response_rx) = mpsc::channel(response_capacity.max(1));
    (
        Outbox {
            commands: command_tx,
            responses: response_tx,
        },
        Inbox {
            commands: command_rx,
            responses: response_rx,
        },
    )
}

impl Outbox {
    /// Queue a command, waiting while the queue is full
    pub async fn command(&self, packet: Packet) -> Result<()> {
        tracing::debug!(key = %packet.key, packet_type = %packet.packet_type, "queueing command");
        self.commands
            .send(packet)
            .await
            .map_err(|_| AgentError::ChannelClosed("command"))
    }

    /// Queue a response, waiting while the queue is full
    pub async fn respond(&self, packet: Packet) -> Result<()> {
        tracing::debug!(key = %packet.key, packet_type = %packet.packet_type, "queueing response");
        self.responses
            .send(packet)
            .await
            .map_err(|_| AgentError::ChannelClosed("response"))
    }
}

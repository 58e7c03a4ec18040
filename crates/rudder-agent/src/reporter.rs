//! Response reporting
//!
//! The upstream session that normally carries responses lives outside this
//! agent; [`LogReporter`] records them through tracing instead.

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::error::Result;
use crate::packet::Packet;

/// Consumer of response packets
#[async_trait]
pub trait Reporter: Send + Sync {
    async fn report(&self, packet: &Packet) -> Result<()>;
}

/// Logs every response; failures at warn level
#[derive(Debug, Clone, Copy, Default)]
pub struct LogReporter;

#[async_trait]
impl Reporter for LogReporter {
    async fn report(&self, packet: &Packet) -> Result<()> {
        if packet.packet_type.is_failure() {
            tracing::warn!(
                key = %packet.key,
                packet_type = %packet.packet_type,
                payload = %packet.payload,
                "release operation failed"
            );
        } else {
            tracing::info!(
                key = %packet.key,
                packet_type = %packet.packet_type,
                payload_bytes = packet.payload.len(),
                "release report"
            );
        }
        Ok(())
    }
}

/// Hand every response to `reporter` until the queue closes
///
/// A report that fails is logged and skipped.
pub async fn drain(reporter: &dyn Reporter, mut responses: mpsc::Receiver<Packet>) {
    while let Some(packet) = responses.recv().await {
        if let Err(e) = reporter.report(&packet).await {
            tracing::error!(key = %packet.key, error = %e, "report failed");
        }
    }
    tracing::info!("response queue closed, reporter stopping");
}

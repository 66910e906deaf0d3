//! In-process backplane on a `tokio::sync::broadcast` channel.
//!
//! Clones share one channel, so several gateways in the same process see
//! each other's events exactly as they would through Redis.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use futures_util::stream::BoxStream;
use tokio::sync::broadcast;

use crate::error::GatewayError;

use super::{Backplane, Envelope};

/// Capacity of the broadcast channel. Receivers that fall behind skip events.
const BROADCAST_CAPACITY: usize = 4096;

#[derive(Clone)]
pub struct MemoryBackplane {
    sender: broadcast::Sender<Envelope>,
    available: Arc<AtomicBool>,
}

impl Default for MemoryBackplane {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryBackplane {
    pub fn new() -> Self {
        let (sender, _) = broadcast::channel(BROADCAST_CAPACITY);
        Self {
            sender,
            available: Arc::new(AtomicBool::new(true)),
        }
    }

    /// Simulate an outage: while unavailable every publish fails and the
    /// backplane reports itself disconnected. Coming back announces a resync,
    /// as a resubscribed Redis listener does.
    pub fn set_available(&self, available: bool) {
        let was = self.available.swap(available, Ordering::SeqCst);
        if available && !was {
            let _ = self.sender.send(Envelope::resync("memory"));
        }
    }
}

#[async_trait]
impl Backplane for MemoryBackplane {
    async fn publish(&self, envelope: &Envelope) -> Result<(), GatewayError> {
        if !self.available.load(Ordering::SeqCst) {
            return Err(GatewayError::BackplaneUnavailable(
                "in-process backplane disabled".to_string(),
            ));
        }
        // No receivers just means no gateway is listening yet.
        let _ = self.sender.send(envelope.clone());
        Ok(())
    }

    fn subscribe(&self) -> BoxStream<'static, Envelope> {
        super::feed(self.sender.subscribe(), "memory")
    }

    fn is_connected(&self) -> bool {
        self.available.load(Ordering::SeqCst)
    }
}

//! Read-only gate: a provisional read-only server that only publishes its
//! serving flag through the peer status.

use std::sync::Arc;
use async_trait::async_trait;

use super::ReadOnlyServer;
use crate::error::Result;
use crate::state::PeerStatus;

/// Marks the peer as serving read-only requests while started
pub struct ReadOnlyGate {
    status: Arc<PeerStatus>,
}

impl ReadOnlyGate {
    pub fn new(status: Arc<PeerStatus>) -> Self {
        Self { status }
    }
}

#[async_trait]
impl ReadOnlyServer for ReadOnlyGate {
    async fn startup(&self) -> Result<()> {
        tracing::info!("Read-only server started, serving stale reads while partitioned");
        self.status.set_read_only(true);
        Ok(())
    }

    async fn shutdown(&self) {
        if self.status.is_read_only() {
            tracing::info!("Read-only server stopped");
        }
        self.status.set_read_only(false);
    }
}

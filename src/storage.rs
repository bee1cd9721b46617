//! Storage Collaborator
//!
//! The transaction log / snapshot engine sits outside the quorum core. The
//! peer only needs to load it, ask for the last processed zxid, and close it.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use async_trait::async_trait;

use crate::state::Zxid;
use crate::error::{Error, Result};

/// Storage engine seen from the quorum peer
#[async_trait]
pub trait Storage: Send + Sync {
    /// Load the database from disk
    async fn load_database(&self) -> Result<()>;

    /// Highest zxid applied to the local database
    fn last_processed_zxid(&self) -> Zxid;

    /// Check if the database has been loaded
    fn is_initialized(&self) -> bool;

    /// Close the database
    async fn close(&self) -> Result<()>;
}

/// In-memory storage that only tracks the last processed zxid
#[derive(Debug, Default)]
pub struct VolatileStorage {
    last_zxid: AtomicU64,
    loaded: AtomicBool,
    closed: AtomicBool,
}

impl VolatileStorage {
    /// Create a store positioned at the given zxid
    pub fn new(last_zxid: Zxid) -> Self {
        Self {
            last_zxid: AtomicU64::new(last_zxid),
            loaded: AtomicBool::new(false),
            closed: AtomicBool::new(false),
        }
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }
}

#[async_trait]
impl Storage for VolatileStorage {
    async fn load_database(&self) -> Result<()> {
        if self.is_closed() {
            return Err(Error::Storage("database is closed".into()));
        }
        self.loaded.store(true, Ordering::Release);
        tracing::debug!(
            "Volatile database loaded at zxid 0x{:x}",
            self.last_zxid.load(Ordering::Acquire)
        );
        Ok(())
    }

    fn last_processed_zxid(&self) -> Zxid {
        self.last_zxid.load(Ordering::Acquire)
    }

    fn is_initialized(&self) -> bool {
        self.loaded.load(Ordering::Acquire)
    }

    async fn close(&self) -> Result<()> {
        self.closed.store(true, Ordering::Release);
        Ok(())
    }
}

//! Rebalancing token
//!
//! Cluster-wide permit ensuring a single rebalance run at a time.

use crate::client::ClientError;
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::debug;

/// Mutual exclusion between rebalance runs
#[async_trait::async_trait]
pub trait RebalancingToken: Send + Sync {
    /// Try to take the token. May block or retry internally.
    ///
    /// Returns `Ok(false)` when another run holds it.
    async fn acquire(&self) -> Result<bool, ClientError>;

    /// Give the token back
    async fn release(&self) -> Result<(), ClientError>;
}

/// Token scoped to the current process
#[derive(Debug, Default)]
pub struct LocalRebalancingToken {
    held: AtomicBool,
}

impl LocalRebalancingToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_held(&self) -> bool {
        self.held.load(Ordering::Acquire)
    }
}

#[async_trait::async_trait]
impl RebalancingToken for LocalRebalancingToken {
    async fn acquire(&self) -> Result<bool, ClientError> {
        let granted = self
            .held
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok();
        debug!(granted, "Rebalancing token requested");
        Ok(granted)
    }

    async fn release(&self) -> Result<(), ClientError> {
        self.held.store(false, Ordering::Release);
        Ok(())
    }
}

//! Periodically refreshed minimum block reference

use std::sync::Arc;

use tracing::{debug, warn};

use crate::error::LedgerResult;
use crate::traits::{BlockRef, LedgerClient};

/// Latest known tip block, refreshed on a timer rather than per chunk
pub struct BlockTracker {
    ledger: Arc<dyn LedgerClient>,
    current: BlockRef,
}

impl BlockTracker {
    /// Read the current tip once so every batch has a reference to attach
    pub async fn start(ledger: Arc<dyn LedgerClient>) -> LedgerResult<Self> {
        let current = ledger.current_block().await?;
        debug!(height = current.height, "Block tracker started");
        Ok(Self { ledger, current })
    }

    /// Start from a known reference without asking the ledger
    pub fn at(ledger: Arc<dyn LedgerClient>, current: BlockRef) -> Self {
        Self { ledger, current }
    }

    pub fn current(&self) -> &BlockRef {
        &self.current
    }

    /// Re-read the tip; a failed read keeps the previous reference
    pub async fn refresh(&mut self) -> &BlockRef {
        match self.ledger.current_block().await {
            Ok(block) => {
                if block.height != self.current.height {
                    debug!(
                        from = self.current.height,
                        to = block.height,
                        "Minimum block reference refreshed"
                    );
                }
                self.current = block;
            }
            Err(e) => {
                warn!(error = %e, height = self.current.height, "Block refresh failed, keeping previous reference");
            }
        }
        &self.current
    }
}

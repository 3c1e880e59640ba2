//! Exclusive access to a shared engine.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use thiserror::Error;
use tracing::{debug, warn};

use super::Keystone;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum BrokerError {
    /// The returned engine is not the one this broker guards.
    #[error("keystone is not guarded by this broker")]
    NotGuarded,

    /// The engine was returned without being claimed.
    #[error("keystone is not claimed")]
    NotClaimed,
}

/// Hands a single [`Keystone`] to one client at a time.
pub struct KeystoneBroker {
    keystone: Arc<Keystone>,
    claimed: AtomicBool,
}

impl KeystoneBroker {
    pub fn new(keystone: Arc<Keystone>) -> Self {
        Self {
            keystone,
            claimed: AtomicBool::new(false),
        }
    }

    /// Claim the engine. Returns `None` without waiting if another client
    /// holds it.
    pub fn claim_keystone(&self) -> Option<Arc<Keystone>> {
        match self
            .claimed
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
        {
            Ok(_) => {
                debug!("Keystone claimed");
                Some(Arc::clone(&self.keystone))
            }
            Err(_) => None,
        }
    }

    /// Give back a claimed engine.
    pub fn return_keystone(&self, keystone: &Arc<Keystone>) -> Result<(), BrokerError> {
        if !Arc::ptr_eq(keystone, &self.keystone) {
            return Err(BrokerError::NotGuarded);
        }
        self.claimed
            .compare_exchange(true, false, Ordering::AcqRel, Ordering::Acquire)
            .map_err(|_| BrokerError::NotClaimed)?;
        debug!("Keystone returned");
        Ok(())
    }

    /// Stop whatever the current holder is doing and release the claim.
    pub fn force_unlock(&self) {
        warn!("Forcing keystone unlock");
        self.keystone.stop_and_reset();
        self.claimed.store(false, Ordering::Release);
    }

    pub fn is_claimed(&self) -> bool {
        self.claimed.load(Ordering::Acquire)
    }
}

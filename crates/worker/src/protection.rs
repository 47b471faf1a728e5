//! Scale-in protection: tells the autoscaler whether this instance is busy.

use std::sync::Mutex;

use async_trait::async_trait;
use tracing::info;

use crate::error::WorkerError;

#[async_trait]
pub trait ScaleInProtection: Send + Sync {
    async fn set_protected(&self, protected: bool) -> Result<(), WorkerError>;
}

/// Logs protection changes without calling out anywhere.
#[derive(Default)]
pub struct LogOnlyProtection {
    current: Mutex<Option<bool>>,
}

impl LogOnlyProtection {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn current(&self) -> Option<bool> {
        *self.current.lock().unwrap()
    }
}

#[async_trait]
impl ScaleInProtection for LogOnlyProtection {
    async fn set_protected(&self, protected: bool) -> Result<(), WorkerError> {
        let mut current = self.current.lock().unwrap();
        if *current != Some(protected) {
            info!(protected, "Scale-in protection changed");
            *current = Some(protected);
        }
        Ok(())
    }
}

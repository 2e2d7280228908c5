use std::sync::Arc;

use async_trait::async_trait;
use tracing::warn;

use crate::mirror::MirrorError;
use crate::model::Signal;
use crate::state::{IntegrationStore, StoreError};

#[derive(Debug, thiserror::Error)]
pub enum SignalStoreError {
    #[error(transparent)]
    Local(#[from] StoreError),
    #[error(transparent)]
    Remote(#[from] MirrorError),
}

/// A backend signals can be written to and read back from.
#[async_trait]
pub trait SignalStore: Send + Sync {
    fn name(&self) -> &'static str;

    async fn upsert(&self, signal: &Signal) -> Result<(), SignalStoreError>;

    /// Newest first.
    async fn list(&self, source: Option<&str>, limit: usize) -> Result<Vec<Signal>, SignalStoreError>;
}

/// Bounded signal cache inside the integration state file.
#[derive(Debug, Clone)]
pub struct LocalSignalStore {
    store: Arc<IntegrationStore>,
}

impl LocalSignalStore {
    pub fn new(store: Arc<IntegrationStore>) -> Self {
        Self { store }
    }
}

#[async_trait]
impl SignalStore for LocalSignalStore {
    fn name(&self) -> &'static str {
        "local"
    }

    async fn upsert(&self, signal: &Signal) -> Result<(), SignalStoreError> {
        let signal = signal.clone();
        Ok(self
            .store
            .blocking(move |store| store.upsert_signal(signal))
            .await?)
    }

    async fn list(&self, source: Option<&str>, limit: usize) -> Result<Vec<Signal>, SignalStoreError> {
        Ok(self.store.list_signals(source, limit)?)
    }
}

/// Writes go to the remote first and always to the local cache; a remote write
/// failure is still returned. Reads prefer the remote and fall back to local.
#[derive(Clone)]
pub struct MirroredSignalStore {
    local: Arc<dyn SignalStore>,
    remote: Option<Arc<dyn SignalStore>>,
}

impl MirroredSignalStore {
    pub fn new(local: Arc<dyn SignalStore>, remote: Option<Arc<dyn SignalStore>>) -> Self {
        Self { local, remote }
    }

    pub fn has_remote(&self) -> bool {
        self.remote.is_some()
    }
}

#[async_trait]
impl SignalStore for MirroredSignalStore {
    fn name(&self) -> &'static str {
        "mirrored"
    }

    async fn upsert(&self, signal: &Signal) -> Result<(), SignalStoreError> {
        let remote_result = match &self.remote {
            Some(remote) => remote.upsert(signal).await,
            None => Ok(()),
        };
        let local_result = self.local.upsert(signal).await;

        match (remote_result, local_result) {
            (Err(remote_err), Err(local_err)) => {
                warn!(signal_id = %signal.id, error = %local_err, "local signal write failed");
                Err(remote_err)
            }
            (Err(remote_err), Ok(())) => {
                warn!(signal_id = %signal.id, error = %remote_err, "remote signal write failed; kept local copy");
                Err(remote_err)
            }
            (Ok(()), local_result) => local_result,
        }
    }

    async fn list(&self, source: Option<&str>, limit: usize) -> Result<Vec<Signal>, SignalStoreError> {
        if let Some(remote) = &self.remote {
            match remote.list(source, limit).await {
                Ok(signals) => return Ok(signals),
                Err(err) => {
                    warn!(backend = remote.name(), error = %err, "remote signal read failed; using local cache");
                }
            }
        }
        self.local.list(source, limit).await
    }
}

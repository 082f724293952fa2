use crux_core::capability::{Capability, CapabilityContext, Operation};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::offline_store::{MessageStore, StoreError, StoredRecord};

/// Transactions against the shell's message store. Each request is one
/// transaction.
#[derive(Clone)]
pub struct Storage<E> {
    context: CapabilityContext<StorageOperation, E>,
}

impl<Ev> Capability<Ev> for Storage<Ev> {
    type Operation = StorageOperation;
    type MappedSelf<MappedEv> = Storage<MappedEv>;

    fn map_event<F, NewEv>(&self, f: F) -> Self::MappedSelf<NewEv>
    where
        F: Fn(NewEv) -> Ev + Send + Sync + 'static,
        Ev: 'static,
        NewEv: 'static + Send,
    {
        Storage::new(self.context.map_event(f))
    }
}

impl<E> Storage<E>
where
    E: Send + 'static,
{
    pub fn new(context: CapabilityContext<StorageOperation, E>) -> Self {
        Self { context }
    }

    /// Upserts every record, all or nothing.
    pub fn put_batch<F>(&self, records: Vec<StoredRecord>, callback: F)
    where
        F: FnOnce(StorageResult) -> E + Send + 'static,
    {
        self.request(StorageOperation::PutBatch { records }, callback);
    }

    pub fn clear<F>(&self, callback: F)
    where
        F: FnOnce(StorageResult) -> E + Send + 'static,
    {
        self.request(StorageOperation::Clear, callback);
    }

    /// Every record, oldest first (ties broken by id).
    pub fn get_all_by_time<F>(&self, callback: F)
    where
        F: FnOnce(StorageResult) -> E + Send + 'static,
    {
        self.request(StorageOperation::GetAllByTime, callback);
    }

    fn request<F>(&self, operation: StorageOperation, callback: F)
    where
        F: FnOnce(StorageResult) -> E + Send + 'static,
    {
        let ctx = self.context.clone();
        self.context.spawn(async move {
            let result = ctx.request_from_shell(operation).await;
            ctx.update_app(callback(result));
        });
    }
}


#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub enum StorageOperation {
    PutBatch { records: Vec<StoredRecord> },
    Clear,
    GetAllByTime,
}

impl Operation for StorageOperation {
    type Output = StorageResult;
}

#[derive(Debug, Clone, Error, Serialize, Deserialize, PartialEq, Eq)]
pub enum StorageError {
    #[error("store unavailable: {reason}")]
    Unavailable { reason: String },

    #[error("transaction failed: {reason}")]
    Transaction { reason: String },
}

impl From<StoreError> for StorageError {
    fn from(error: StoreError) -> Self {
        match error {
            StoreError::Open(reason) => StorageError::Unavailable { reason },
            other => StorageError::Transaction {
                reason: other.to_string(),
            },
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub enum StorageOutput {
    Written,
    Cleared,
    Records(Vec<StoredRecord>),
}

pub type StorageResult = Result<StorageOutput, StorageError>;

/// Shell side of the capability: runs one request against a [`MessageStore`].
pub async fn serve<S>(store: &S, operation: StorageOperation) -> StorageResult
where
    S: MessageStore + ?Sized,
{
    let outcome = match operation {
        StorageOperation::PutBatch { records } => {
            store.put_batch(&records).await.map(|()| StorageOutput::Written)
        }
        StorageOperation::Clear => store.clear().await.map(|()| StorageOutput::Cleared),
        StorageOperation::GetAllByTime => {
            store.get_all_by_time().await.map(StorageOutput::Records)
        }
    };
    outcome.map_err(StorageError::from)
}

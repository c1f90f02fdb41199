//! Single-use batch credentials and their background refill.

use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use backon::{ExponentialBuilder, Retryable};
use serde::{Deserialize, Serialize};
use tokio::runtime::Handle;
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::{
    config::FlowConfig,
    credential::{CredentialFormat, CredentialRecord, EncodedCredential},
    error::PidKitError,
    platform::{BatchRefill, CredentialRepository, IssuanceError},
    sync::lock,
};

/// Unused credential instances of a record. Each instance is presented at most once.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchCredentialMetadata {
    /// Instances not yet presented. Consumed from the back.
    pub additional_credentials: Vec<EncodedCredential>,
}

impl BatchCredentialMetadata {
    /// Number of unused instances.
    #[must_use]
    pub fn len(&self) -> usize {
        self.additional_credentials.len()
    }

    /// Whether every instance has been used.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.additional_credentials.is_empty()
    }

    /// Whether the remaining instances are at or below `threshold`.
    #[must_use]
    pub fn should_refill(&self, threshold: usize) -> bool {
        self.len() <= threshold
    }

    fn pop(&mut self) -> Option<EncodedCredential> {
        self.additional_credentials.pop()
    }
}

/// A batch credential removed from its record for presentation.
#[derive(Debug)]
pub struct ConsumedCredential {
    /// The instance to present.
    pub credential: EncodedCredential,
    /// The background refill started by this consumption, if any.
    pub refill: Option<JoinHandle<()>>,
}

/// Marks the refill of one record as running. Released on drop, so a panicking refill task
/// does not block later refills of its record.
struct RefillSlot {
    in_flight: Arc<Mutex<HashSet<Uuid>>>,
    record_id: Uuid,
}

impl RefillSlot {
    fn claim(in_flight: &Arc<Mutex<HashSet<Uuid>>>, record_id: Uuid) -> Option<Self> {
        lock(in_flight).insert(record_id).then(|| Self {
            in_flight: Arc::clone(in_flight),
            record_id,
        })
    }
}

impl Drop for RefillSlot {
    fn drop(&mut self) {
        lock(&self.in_flight).remove(&self.record_id);
    }
}

/// Hands out batch credentials and keeps the batches topped up.
///
/// A consumed instance is persisted as removed before it is returned. Refills run in the
/// background; their failure never affects the consumption that triggered them.
pub struct BatchCredentialPool<F> {
    repository: Arc<dyn CredentialRepository>,
    refill: Arc<F>,
    threshold: usize,
    refill_size: usize,
    max_retries: usize,
    in_flight: Arc<Mutex<HashSet<Uuid>>>,
}

impl<F: BatchRefill> BatchCredentialPool<F> {
    /// Creates a pool using the refill settings of `config`.
    #[must_use]
    pub fn new(
        config: &FlowConfig,
        repository: Arc<dyn CredentialRepository>,
        refill: Arc<F>,
    ) -> Self {
        Self {
            repository,
            refill,
            threshold: config.batch_refill_threshold,
            refill_size: config.batch_refill_size,
            max_retries: config.refill_max_retries,
            in_flight: Arc::new(Mutex::new(HashSet::new())),
        }
    }

    /// Persists freshly retrieved records.
    ///
    /// # Errors
    ///
    /// Returns [`PidKitError::Storage`] on the first record that cannot be saved.
    pub fn store(&self, records: &[CredentialRecord]) -> Result<(), PidKitError> {
        for record in records {
            self.repository.save(record)?;
        }
        Ok(())
    }

    /// Removes the next batch instance from `record`, persists the record and starts a
    /// background refill when the batch ran low.
    ///
    /// The refill is only started when called within a tokio runtime, and at most one refill
    /// per record runs at a time.
    ///
    /// # Errors
    ///
    /// Returns [`PidKitError::NoBatchAvailable`] if the record has no batch instance left,
    /// and [`PidKitError::Storage`] if the record cannot be persisted. In the latter case the
    /// record is left unchanged.
    pub fn consume(
        &self,
        record: &mut CredentialRecord,
    ) -> Result<ConsumedCredential, PidKitError> {
        let mut batch = record
            .batch
            .clone()
            .filter(|batch| !batch.is_empty())
            .ok_or(PidKitError::NoBatchAvailable)?;
        let credential = batch.pop().ok_or(PidKitError::NoBatchAvailable)?;
        let low = batch.should_refill(self.threshold);

        let previous = record.batch.replace(batch);
        if let Err(error) = self.repository.save(record) {
            record.batch = previous;
            return Err(error.into());
        }

        let refill = if low {
            self.spawn_refill(record.id, record.format)
        } else {
            None
        };
        Ok(ConsumedCredential { credential, refill })
    }

    fn spawn_refill(&self, record_id: Uuid, format: CredentialFormat) -> Option<JoinHandle<()>> {
        let Ok(handle) = Handle::try_current() else {
            log::warn!("no async runtime, skipping batch refill for record {record_id}");
            return None;
        };
        let Some(slot) = RefillSlot::claim(&self.in_flight, record_id) else {
            log::debug!("batch refill for record {record_id} already running");
            return None;
        };

        let repository = Arc::clone(&self.repository);
        let refill = Arc::clone(&self.refill);
        let count = self.refill_size;
        let backoff = ExponentialBuilder::default()
            .with_min_delay(Duration::from_millis(200))
            .with_max_delay(Duration::from_secs(2))
            .with_max_times(self.max_retries);

        Some(handle.spawn(async move {
            let _slot = slot;
            let result = (|| refill.refill(format, count))
                .retry(backoff)
                .when(IssuanceError::is_transient)
                .await;

            match result {
                Ok(credentials) => {
                    let received = credentials.len();
                    match repository.append_batch(record_id, credentials) {
                        Ok(()) => {
                            log::info!("refilled record {record_id} with {received} credentials");
                        }
                        Err(error) => {
                            log::warn!("failed to store refilled batch for {record_id}: {error}");
                        }
                    }
                }
                Err(error) => log::warn!("batch refill for record {record_id} failed: {error}"),
            }
        }))
    }
}

//! Persistence of credential records.

use thiserror::Error;
use uuid::Uuid;

use crate::{credential::CredentialRecord, credential::EncodedCredential, error::PidKitError};

/// Errors reported by the credential repository.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum RepositoryError {
    /// No record with this id is stored.
    #[error("credential record {0} not found")]
    NotFound(Uuid),
    /// The storage backend failed.
    #[error("repository backend error: {0}")]
    Backend(String),
}

impl From<RepositoryError> for PidKitError {
    fn from(error: RepositoryError) -> Self {
        Self::Storage(error.to_string())
    }
}

/// Stores credential records.
///
/// Implementations must make each call atomic: a batch credential that was handed out must
/// never be readable again after [`CredentialRepository::save`] returns.
pub trait CredentialRepository: Send + Sync {
    /// Inserts or replaces a record.
    ///
    /// # Errors
    ///
    /// Returns an error if the record cannot be persisted.
    fn save(&self, record: &CredentialRecord) -> Result<(), RepositoryError>;

    /// Appends fresh batch credentials to a stored record.
    ///
    /// # Errors
    ///
    /// Returns [`RepositoryError::NotFound`] if the record does not exist.
    fn append_batch(
        &self,
        record_id: Uuid,
        credentials: Vec<EncodedCredential>,
    ) -> Result<(), RepositoryError>;
}

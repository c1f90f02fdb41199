//! Credential records as handed to the host after retrieval.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};
use strum::{Display, EnumString};
use uuid::Uuid;

use crate::{batch::BatchCredentialMetadata, error::PidKitError, platform::IssuedCredential};

/// Claim holding the holder's given name(s).
pub const GIVEN_NAME_CLAIM: &str = "given_name";

/// Claim holding the holder's family name.
pub const FAMILY_NAME_CLAIM: &str = "family_name";

/// Credential format requested from the issuer.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, EnumString, Display,
)]
#[serde(rename_all = "kebab-case")]
#[strum(serialize_all = "kebab-case")]
pub enum CredentialFormat {
    /// SD-JWT VC.
    SdJwtVc,
    /// ISO 18013-5 mdoc.
    MsoMdoc,
}

/// An issued credential in its encoded form. Opaque to this crate.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EncodedCredential(String);

impl EncodedCredential {
    /// Wraps an encoded credential.
    #[must_use]
    pub const fn new(encoded: String) -> Self {
        Self(encoded)
    }

    /// The encoded credential.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for EncodedCredential {
    // credentials are bearer material, keep them out of logs
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "EncodedCredential({} bytes)", self.0.len())
    }
}

/// A stored credential together with its unused batch instances.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CredentialRecord {
    /// Record identifier.
    pub id: Uuid,
    /// Format of every credential in the record.
    pub format: CredentialFormat,
    /// The credential used for display.
    pub credential: EncodedCredential,
    /// Claims parsed by the issuance client.
    pub claims: BTreeMap<String, String>,
    /// Unused credential instances, each presented at most once.
    pub batch: Option<BatchCredentialMetadata>,
}

impl CredentialRecord {
    /// Builds a record from a batch issued by the issuer. The first instance becomes the
    /// display credential, the rest are kept for presentation.
    ///
    /// # Errors
    ///
    /// Returns [`PidKitError::NetworkOrIssuer`] if the issuer returned an empty batch.
    pub fn from_issued(issued: IssuedCredential) -> Result<Self, PidKitError> {
        let IssuedCredential {
            format,
            mut credentials,
            claims,
        } = issued;
        if credentials.is_empty() {
            return Err(PidKitError::NetworkOrIssuer {
                status: None,
                error: format!("issuer returned an empty {format} batch"),
            });
        }
        let credential = credentials.remove(0);
        let batch = (!credentials.is_empty()).then(|| BatchCredentialMetadata {
            additional_credentials: credentials,
        });

        Ok(Self {
            id: Uuid::new_v4(),
            format,
            credential,
            claims,
            batch,
        })
    }

    /// The holder's display name, if the credential discloses it.
    #[must_use]
    pub fn holder_name(&self) -> Option<String> {
        let given = self.claims.get(GIVEN_NAME_CLAIM);
        let family = self.claims.get(FAMILY_NAME_CLAIM);
        match (given, family) {
            (Some(given), Some(family)) => Some(format!("{given} {family}")),
            (Some(name), None) | (None, Some(name)) => Some(name.clone()),
            (None, None) => None,
        }
    }

    /// Number of batch instances left.
    #[must_use]
    pub fn remaining_batch(&self) -> usize {
        self.batch
            .as_ref()
            .map_or(0, BatchCredentialMetadata::len)
    }

    /// Serializes the record for storage.
    ///
    /// # Errors
    ///
    /// Returns an error if serialization fails.
    pub fn to_json(&self) -> Result<String, PidKitError> {
        Ok(serde_json::to_string(self)?)
    }

    /// Deserializes a stored record.
    ///
    /// # Errors
    ///
    /// Returns an error if the JSON is not a valid record.
    pub fn from_json(json: &str) -> Result<Self, PidKitError> {
        Ok(serde_json::from_str(json)?)
    }
}

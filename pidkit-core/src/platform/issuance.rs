//! Issuer-facing collaborators: token exchange, credential retrieval and batch refill.

use std::collections::BTreeMap;
use std::fmt;
use std::future::Future;

use secrecy::SecretString;
use thiserror::Error;

use crate::{
    credential::{CredentialFormat, EncodedCredential},
    error::PidKitError,
    platform::AuthenticatedSession,
    wallet::WalletAgent,
};

/// Access token granted by the issuer after a successful card authentication.
pub struct AccessToken {
    value: SecretString,
}

impl AccessToken {
    /// Wraps a token value.
    #[must_use]
    pub const fn new(value: SecretString) -> Self {
        Self { value }
    }

    /// The token value.
    #[must_use]
    pub const fn value(&self) -> &SecretString {
        &self.value
    }
}

impl fmt::Debug for AccessToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("AccessToken([REDACTED])")
    }
}

/// A batch of credentials of one format, as returned by the issuer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IssuedCredential {
    /// Format of every credential in the batch.
    pub format: CredentialFormat,
    /// Credential instances; each is presented at most once.
    pub credentials: Vec<EncodedCredential>,
    /// Claims parsed from the credential.
    pub claims: BTreeMap<String, String>,
}

/// Errors reported by the issuance client.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum IssuanceError {
    /// Transport failure or unexpected HTTP status.
    #[error("network error (status {status:?}): {error}")]
    Network {
        /// HTTP status, if a response was received.
        status: Option<u16>,
        /// Error details.
        error: String,
    },
    /// The issuer rejected the request.
    #[error("issuer error: {0}")]
    Issuer(String),
    /// The user cancelled the biometric prompt guarding the wallet key.
    #[error("biometric prompt cancelled")]
    BiometricCancelled,
    /// Biometrics are not enabled on the device.
    #[error("biometrics not enabled")]
    BiometricNotEnabled,
}

impl IssuanceError {
    /// Whether retrying the request may succeed: transport failures, rate limiting and
    /// server errors.
    #[must_use]
    pub const fn is_transient(&self) -> bool {
        match self {
            Self::Network { status: None, .. } => true,
            Self::Network {
                status: Some(status),
                ..
            } => *status == 429 || *status >= 500,
            _ => false,
        }
    }
}

impl From<IssuanceError> for PidKitError {
    fn from(error: IssuanceError) -> Self {
        match error {
            IssuanceError::Network { status, error } => Self::NetworkOrIssuer { status, error },
            IssuanceError::Issuer(error) => Self::NetworkOrIssuer {
                status: None,
                error,
            },
            IssuanceError::BiometricCancelled => Self::BiometricCancelled,
            IssuanceError::BiometricNotEnabled => Self::BiometricNotEnabled,
        }
    }
}

/// Client for the PID issuer.
pub trait IssuanceClient: Send + Sync + 'static {
    /// Exchanges an authenticated card session for an access token.
    fn acquire_access_token(
        &self,
        session: &AuthenticatedSession,
    ) -> impl Future<Output = Result<AccessToken, IssuanceError>> + Send;

    /// Retrieves the credentials bound to the wallet key, one batch per format.
    ///
    /// Signing with the wallet key may show a biometric prompt.
    fn retrieve_credentials(
        &self,
        token: &AccessToken,
        wallet: &WalletAgent,
        formats: &[CredentialFormat],
    ) -> impl Future<Output = Result<Vec<IssuedCredential>, IssuanceError>> + Send;
}

/// Re-issuance of batch credentials.
pub trait BatchRefill: Send + Sync + 'static {
    /// Requests `count` fresh credentials of `format`.
    fn refill(
        &self,
        format: CredentialFormat,
        count: usize,
    ) -> impl Future<Output = Result<Vec<EncodedCredential>, IssuanceError>> + Send;
}

use thiserror::Error;

use crate::steps::StepId;

/// Toast text used when an error carries no more specific message.
pub const GENERIC_FAILURE_MESSAGE: &str = "Something went wrong. Please try again.";

/// Error outputs from `PidKit`
///
/// Every variant is classified: [`PidKitError::recovery`] tells the orchestrator which step the
/// flow rolls back to and whether the user is told about it.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[cfg_attr(feature = "ffi", derive(uniffi::Error))]
#[cfg_attr(feature = "ffi", uniffi(flat_error))]
pub enum PidKitError {
    /// The user dismissed the contactless scan.
    #[error("user_cancelled")]
    UserCancelled,
    /// The card reader stopped the scan (system sheet timeout, card removed, etc.).
    #[error("hardware_cancelled")]
    HardwareCancelled,
    /// The card rejected the PIN. Normally handled by the re-entry loop and never surfaced.
    #[error("wrong_pin")]
    WrongPin {
        /// Attempts the card reports as remaining, if known.
        attempts_remaining: Option<u8>,
    },
    /// The user cancelled the biometric prompt guarding the wallet key.
    #[error("biometric_cancelled")]
    BiometricCancelled,
    /// Biometric authentication is not enabled on the device.
    #[error("biometric_not_enabled")]
    BiometricNotEnabled,
    /// Card authentication failed for a reason other than cancellation.
    #[error("id_card_error: {reason}")]
    IdCard {
        /// Reason reported by the card reader.
        reason: String,
    },
    /// Network or issuer failure while exchanging tokens or retrieving credentials.
    #[error("network_or_issuer_error: {error}")]
    NetworkOrIssuer {
        /// HTTP status, when the failure came with one.
        status: Option<u16>,
        /// Error details.
        error: String,
    },
    /// An operation was called in a state where it is illegal. Indicates a caller bug.
    #[error("invariant_violation: {0}")]
    InvariantViolation(String),
    /// The wallet PIN confirmation did not match the first entry.
    #[error("pin_mismatch")]
    PinMismatch,
    /// The presented input is not valid for the requested operation
    #[error("invalid_input attribute: {attribute}. reason: {reason}")]
    InvalidInput {
        /// The attribute that is invalid
        attribute: String,
        /// The reason the input is invalid
        reason: String,
    },
    /// Unexpected error serializing information
    #[error("serialization_error: {error}")]
    SerializationError {
        /// The error message from the serialization
        error: String,
    },
    /// Failure in the credential repository or the secure unlock store.
    #[error("storage_error: {0}")]
    Storage(String),
    /// The credential record has no batch credentials left to consume.
    #[error("no_batch_available")]
    NoBatchAvailable,
}

/// Where the flow goes after an error and whether the user is told about it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Recovery {
    /// Step the flow is reset to.
    pub step: StepId,
    /// Whether a toast is shown.
    pub notify_user: bool,
}

impl PidKitError {
    /// Maps the error to its recovery step.
    #[must_use]
    pub const fn recovery(&self) -> Recovery {
        let (step, notify_user) = match self {
            Self::UserCancelled
            | Self::HardwareCancelled
            | Self::IdCard { .. }
            | Self::NetworkOrIssuer { .. }
            | Self::InvalidInput { .. }
            | Self::SerializationError { .. }
            | Self::Storage(_)
            | Self::NoBatchAvailable => (StepId::DataProtection, true),
            Self::WrongPin { .. } => (StepId::IdCardPin, true),
            Self::BiometricCancelled => (StepId::IdCardFetch, true),
            // the dedicated screen explains what to do
            Self::BiometricNotEnabled => (StepId::BiometricsDisabled, false),
            Self::InvariantViolation(_) | Self::PinMismatch => (StepId::Pin, true),
        };
        Recovery { step, notify_user }
    }

    /// Toast text for errors that deserve a more specific message than
    /// [`GENERIC_FAILURE_MESSAGE`].
    #[must_use]
    pub const fn user_message(&self) -> Option<&'static str> {
        match self {
            Self::UserCancelled | Self::HardwareCancelled => {
                Some("Scanning the ID card was cancelled.")
            }
            Self::WrongPin { .. } => Some("The ID card PIN was not accepted."),
            Self::BiometricCancelled => Some("Biometric authentication was cancelled."),
            Self::PinMismatch => Some("The PINs do not match. Please choose your PIN again."),
            _ => None,
        }
    }

    /// Whether the error is a scan cancellation the user can simply retry.
    #[must_use]
    pub const fn is_cancellation(&self) -> bool {
        matches!(self, Self::UserCancelled | Self::HardwareCancelled)
    }

    /// Whether the error is an expected, user-driven outcome that leaves the current phase
    /// retryable.
    #[must_use]
    pub const fn is_recoverable(&self) -> bool {
        matches!(
            self,
            Self::UserCancelled
                | Self::HardwareCancelled
                | Self::WrongPin { .. }
                | Self::BiometricCancelled
        )
    }

    /// Whether the error indicates a caller bug.
    #[must_use]
    pub const fn is_invariant_violation(&self) -> bool {
        matches!(self, Self::InvariantViolation(_))
    }
}

impl From<serde_json::Error> for PidKitError {
    fn from(error: serde_json::Error) -> Self {
        Self::SerializationError {
            error: error.to_string(),
        }
    }
}

//! Wallet key custody.

use std::fmt;

use secrecy::{ExposeSecret, SecretBox, SecretString};
use thiserror::Error;

use crate::error::PidKitError;

/// State of the secure unlock store.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SecureUnlockState {
    /// No wallet PIN has been set up.
    NotConfigured,
    /// Setup derived the wallet key; [`SecureUnlock::finish_setup`] is pending.
    AcquiredWalletKey,
    /// The wallet key is available.
    Unlocked,
    /// A wallet exists but is locked.
    Locked,
    /// The store is still loading.
    Initializing,
}

/// The 256-bit wallet key. Zeroized on drop.
pub struct WalletKey(SecretBox<[u8; 32]>);

impl WalletKey {
    /// Wraps raw key material.
    #[must_use]
    pub fn new(bytes: [u8; 32]) -> Self {
        Self(SecretBox::new(Box::new(bytes)))
    }

    /// The raw key material.
    #[must_use]
    pub fn expose(&self) -> &[u8; 32] {
        self.0.expose_secret()
    }
}

impl fmt::Debug for WalletKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("WalletKey([REDACTED])")
    }
}

/// Errors reported by the secure unlock store.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum UnlockError {
    /// The operation is not allowed in the current state.
    #[error("secure unlock is {state:?}, expected {expected:?}")]
    InvalidState {
        /// The current state.
        state: SecureUnlockState,
        /// The state the operation requires.
        expected: SecureUnlockState,
    },
    /// The keystore failed.
    #[error("keystore error: {0}")]
    Keystore(String),
}

impl From<UnlockError> for PidKitError {
    fn from(error: UnlockError) -> Self {
        match error {
            UnlockError::InvalidState { .. } => Self::InvariantViolation(error.to_string()),
            UnlockError::Keystore(reason) => Self::Storage(reason),
        }
    }
}

/// Secure storage of the wallet key, unlocked with the wallet PIN.
///
/// Platform implementations keep the key in hardware-backed storage:
/// - iOS: Keychain with Secure Enclave wrapping
/// - Android: Android Keystore
pub trait SecureUnlock: Send + Sync {
    /// Current state of the store.
    fn state(&self) -> SecureUnlockState;

    /// Derives and stores a new wallet key protected by `pin`.
    ///
    /// # Errors
    ///
    /// Returns [`UnlockError::InvalidState`] unless the store is
    /// [`SecureUnlockState::NotConfigured`].
    fn setup(&self, pin: SecretString) -> Result<(), UnlockError>;

    /// The wallet key.
    ///
    /// # Errors
    ///
    /// Returns [`UnlockError::InvalidState`] if the key has not been acquired or unlocked.
    fn wallet_key(&self) -> Result<WalletKey, UnlockError>;

    /// Completes the setup and unlocks the store.
    ///
    /// # Errors
    ///
    /// Returns [`UnlockError::InvalidState`] unless the store is
    /// [`SecureUnlockState::AcquiredWalletKey`].
    fn finish_setup(&self) -> Result<(), UnlockError>;

    /// Removes the wallet key and returns to [`SecureUnlockState::NotConfigured`].
    ///
    /// # Errors
    ///
    /// Returns [`UnlockError::Keystore`] if the key cannot be removed.
    fn reset(&self) -> Result<(), UnlockError>;
}

//! Collaborator traits the orchestration depends on.
//!
//! The orchestration is hardware and protocol agnostic. Everything it does not own is
//! abstracted behind traits implemented by the host app:
//!
//! - [`CardReader`] — contactless eID card driver (APDU transport, PACE, terminal auth)
//! - [`IssuanceClient`] — token exchange and credential retrieval against the PID issuer
//! - [`BatchRefill`] — re-issuance of batch credentials in the background
//! - [`SecureUnlock`] — wallet key custody (Secure Enclave, Android Keystore, cloud HSM)
//! - [`CredentialRepository`] — persisted credential records
//! - [`Notifier`] — toast surface of the host UI
//!
//! # Platform Implementations
//!
//! ## iOS (Swift)
//! - `CardReader`: AusweisApp SDK over Core NFC; the system sheet is closed with an interrupt
//! - `SecureUnlock`: Keychain + Secure Enclave
//!
//! ## Android (Kotlin)
//! - `CardReader`: AusweisApp SDK over the NFC reader mode; the app draws its own overlay
//! - `SecureUnlock`: Android Keystore
//!
//! In-memory implementations for tests and the CLI live in [`memory`].

mod card_reader;
mod issuance;
pub mod memory;
mod notifier;
mod repository;
mod unlock;

pub use card_reader::{
    AccessRights, AuthenticateRequest, AuthenticatedSession, CardEvent, CardEventSender,
    CardReader, CardReaderError, CardSession, InitializeOptions, PinRequest, PinResponder,
    ReaderState, SessionStart, CANCELLED_REASON, USER_CANCELLED_REASON,
};
pub(crate) use card_reader::card_event_channel;
pub use issuance::{AccessToken, BatchRefill, IssuanceClient, IssuanceError, IssuedCredential};
pub use notifier::Notifier;
pub use repository::{CredentialRepository, RepositoryError};
pub use unlock::{SecureUnlock, SecureUnlockState, UnlockError, WalletKey};

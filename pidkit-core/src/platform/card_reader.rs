//! Contactless eID card reader interface.
//!
//! The reader reports hardware progress and asks for the card PIN through [`CardEvent`]
//! messages. A PIN request carries a [`PinResponder`]; the reader suspends until the
//! orchestration resolves it, which may take arbitrarily long (there is no timeout) or never
//! happen if the attempt is abandoned.

use std::future::Future;

use secrecy::SecretString;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};
use uuid::Uuid;

use crate::{credential::CredentialFormat, error::PidKitError};

/// Cancellation reason reported when the user dismissed the scan.
pub const USER_CANCELLED_REASON: &str = "user_cancelled";

/// Cancellation reason reported when the reader stopped the scan on its own.
pub const CANCELLED_REASON: &str = "cancelled";

/// Options for starting a card session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InitializeOptions {
    /// Base URL of the PID issuer.
    pub issuer_url: String,
    /// Formats requested during retrieval.
    pub formats: Vec<CredentialFormat>,
}

impl InitializeOptions {
    /// Options requesting the PID in both SD-JWT VC and mdoc format.
    #[must_use]
    pub fn pid(issuer_url: &str) -> Self {
        Self {
            issuer_url: issuer_url.to_string(),
            formats: vec![CredentialFormat::SdJwtVc, CredentialFormat::MsoMdoc],
        }
    }
}

/// Ordered list of the attributes the issuer reads from the card.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct AccessRights(Vec<String>);

impl AccessRights {
    /// Wraps the attribute identifiers, keeping their order.
    #[must_use]
    pub const fn new(attributes: Vec<String>) -> Self {
        Self(attributes)
    }

    /// The attribute identifiers.
    #[must_use]
    pub fn as_slice(&self) -> &[String] {
        &self.0
    }

    /// Number of attributes.
    #[must_use]
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Whether no attribute is requested.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

/// Opaque continuation of a card session, produced by [`CardReader::initialize`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CardSession {
    /// Session identifier.
    pub id: Uuid,
    /// Reader-specific continuation data (e.g. the TC token URL).
    pub continuation: String,
}

/// Result of starting a card session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionStart {
    /// Attributes the issuer will read.
    pub access_rights: AccessRights,
    /// Continuation passed to [`CardReader::authenticate`].
    pub continuation: CardSession,
}

/// Parameters of a card authentication.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthenticateRequest {
    /// Session from [`CardReader::initialize`].
    pub session: CardSession,
    /// Accept a simulated card instead of real hardware.
    pub use_simulator_card: bool,
}

/// A session authenticated with the card, ready to be exchanged for an access token.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthenticatedSession {
    /// Session identifier.
    pub session_id: Uuid,
    /// Authorization code handed to the issuer's token endpoint.
    pub authorization_code: String,
}

/// State reported by the reader while authenticating.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReaderState {
    /// Waiting for the card to be attached.
    WaitingForCard,
    /// Waiting for the card PIN.
    PinRequested,
    /// Running the card-side authentication.
    Authenticating,
    /// Authentication finished.
    Completed,
}

/// A card PIN request from the reader.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PinRequest {
    /// Attempts the card reports as remaining, if known.
    pub attempts_remaining: Option<u8>,
    /// Whether a previous PIN was rejected by the card.
    pub is_retry: bool,
}

/// Deferred answer to a [`PinRequest`].
#[derive(Debug)]
pub struct PinResponder(oneshot::Sender<SecretString>);

impl PinResponder {
    pub(crate) const fn from_sender(sender: oneshot::Sender<SecretString>) -> Self {
        Self(sender)
    }

    /// Resolves the request. Returns the PIN back if the reader stopped waiting.
    ///
    /// # Errors
    ///
    /// Returns the PIN if the reader side of the request is gone.
    pub fn resolve(self, pin: SecretString) -> Result<(), SecretString> {
        self.0.send(pin)
    }
}

/// Messages from the card reader to the orchestration.
#[derive(Debug)]
pub enum CardEvent {
    /// The reader changed state.
    StateChanged(ReaderState),
    /// A card was attached or removed.
    CardAttachedChanged {
        /// Whether a card is attached.
        is_card_attached: bool,
    },
    /// Read progress.
    StatusProgress {
        /// Progress, `0..=100`.
        progress: u8,
    },
    /// The card needs a PIN.
    EnterPin {
        /// What the card reported.
        request: PinRequest,
        /// Resolved with the PIN.
        responder: PinResponder,
    },
}

/// Sending half handed to [`CardReader::authenticate`].
///
/// Sends never fail: once the orchestration stops listening the events are dropped.
#[derive(Debug, Clone)]
pub struct CardEventSender(mpsc::UnboundedSender<CardEvent>);

impl CardEventSender {
    fn send(&self, event: CardEvent) {
        let _ = self.0.send(event);
    }

    /// Reports a reader state change.
    pub fn state_changed(&self, state: ReaderState) {
        self.send(CardEvent::StateChanged(state));
    }

    /// Reports a card attachment change.
    pub fn card_attached_changed(&self, is_card_attached: bool) {
        self.send(CardEvent::CardAttachedChanged { is_card_attached });
    }

    /// Reports read progress.
    pub fn status_progress(&self, progress: u8) {
        self.send(CardEvent::StatusProgress { progress });
    }

    /// Asks for the card PIN and waits for the answer.
    ///
    /// # Errors
    ///
    /// Returns [`CardReaderError::Cancelled`] if the attempt was abandoned before a PIN was
    /// provided.
    pub async fn request_pin(&self, request: PinRequest) -> Result<SecretString, CardReaderError> {
        let (sender, receiver) = oneshot::channel();
        self.send(CardEvent::EnterPin {
            request,
            responder: PinResponder::from_sender(sender),
        });
        receiver.await.map_err(|_| CardReaderError::Cancelled {
            reason: CANCELLED_REASON.to_string(),
        })
    }
}

pub(crate) fn card_event_channel() -> (CardEventSender, mpsc::UnboundedReceiver<CardEvent>) {
    let (sender, receiver) = mpsc::unbounded_channel();
    (CardEventSender(sender), receiver)
}

/// Errors reported by the card reader.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum CardReaderError {
    /// The scan was cancelled; `reason` is `user_cancelled`, `cancelled` or reader specific.
    #[error("card scanning cancelled: {reason}")]
    Cancelled {
        /// Cancellation reason.
        reason: String,
    },
    /// The card-side authentication failed (blocked PIN, unsupported card, ...).
    #[error("card authentication failed: {0}")]
    Failed(String),
    /// NFC is unavailable or disabled.
    #[error("card reader unavailable: {0}")]
    Unavailable(String),
}

impl From<CardReaderError> for PidKitError {
    fn from(error: CardReaderError) -> Self {
        match error {
            CardReaderError::Cancelled { reason } => match reason.as_str() {
                USER_CANCELLED_REASON => Self::UserCancelled,
                CANCELLED_REASON => Self::HardwareCancelled,
                _ => Self::IdCard { reason },
            },
            CardReaderError::Failed(reason) | CardReaderError::Unavailable(reason) => {
                Self::IdCard { reason }
            }
        }
    }
}

/// Contactless eID card driver.
///
/// Only one scan may be open at a time. [`CardReader::cancel`] must be safe to call when no
/// scan is active.
pub trait CardReader: Send + Sync + 'static {
    /// Starts session establishment with the issuer and returns the requested access rights.
    fn initialize(
        &self,
        options: &InitializeOptions,
    ) -> impl Future<Output = Result<SessionStart, CardReaderError>> + Send;

    /// Authenticates with the card. Reports progress and PIN requests through `events`.
    fn authenticate(
        &self,
        request: AuthenticateRequest,
        events: CardEventSender,
    ) -> impl Future<Output = Result<AuthenticatedSession, CardReaderError>> + Send;

    /// Interrupts the current attempt so the system NFC sheet closes.
    fn interrupt(&self) -> impl Future<Output = Result<(), CardReaderError>> + Send;

    /// Cancels the current scan, if any.
    fn cancel(&self) -> impl Future<Output = Result<(), CardReaderError>> + Send;
}

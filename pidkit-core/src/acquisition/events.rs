use crate::platform::{ReaderState, SessionStart};

/// Phase of the acquisition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "ffi", derive(uniffi::Enum))]
pub enum AcquisitionState {
    /// No card session yet.
    Initializing,
    /// A card session is open; the card has to be authenticated.
    IdCardAuth,
    /// An access token was granted; the credentials can be retrieved.
    RetrieveCredential,
    /// The credentials were retrieved.
    Done,
    /// The last operation failed. Only a reset leaves this state.
    Failed,
}

/// Events delivered to the host while the acquisition runs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AcquisitionEvent {
    /// The acquisition changed phase.
    StateChanged(AcquisitionState),
    /// The card reader changed state.
    ReaderStateChanged(ReaderState),
    /// A card was attached or removed.
    CardAttachedChanged {
        /// Whether a card is attached.
        is_card_attached: bool,
    },
    /// Card read progress.
    StatusProgress {
        /// Progress, `0..=100`.
        progress: u8,
    },
    /// The card rejected the PIN and the overlay has settled; show the PIN re-entry screen.
    CardPinReentryRequested {
        /// Attempts the card reports as remaining.
        attempts_remaining: Option<u8>,
    },
}

/// Result of [`super::AcquisitionStateMachine::initialize`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InitializeOutcome {
    /// The card session is open.
    Started(SessionStart),
    /// Another `initialize` is still in flight; nothing was started.
    AlreadyInitializing,
}

/// Result of [`super::AcquisitionStateMachine::authenticate_using_id_card`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthenticateOutcome {
    /// The card accepted the PIN.
    Authenticated,
    /// Another card authentication is still running; the reader was not touched.
    AlreadyAuthenticating,
}

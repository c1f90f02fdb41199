//! Wallet PIN confirmation and card PIN entry, including the wrong-PIN re-entry loop.
//!
//! Every PIN is read at most once: the operation consuming it takes it out of the coordinator,
//! whether the operation then succeeds or not.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use secrecy::{ExposeSecret, SecretString};
use subtle::ConstantTimeEq;

use crate::{
    card_scan::CardScanCoordinator,
    error::PidKitError,
    platform::{PinRequest, PinResponder},
    sync::lock,
    DevicePlatform,
};

/// Reserved card PIN that selects a simulated card when simulator cards are allowed.
pub const SIMULATOR_CARD_PIN: &str = "276001";

/// Number of digits of the wallet PIN and the eID card PIN.
pub const PIN_LENGTH: usize = 6;

/// How a submitted card PIN was used.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CardPinSubmission {
    /// Stored for the next card authentication.
    Stored,
    /// Handed to a card waiting for a re-entered PIN.
    Resumed,
}

/// How a PIN request from the card was handled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PinRequestOutcome {
    /// The stored PIN was handed to the card.
    Answered,
    /// The card rejected the previous PIN; the user has to enter a new one.
    ReentryRequired {
        /// Attempts the card reports as remaining.
        attempts_remaining: Option<u8>,
    },
}

/// What follows a PIN the card rejected.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PinRejection {
    /// Whether the card reader has to be interrupted so the system NFC sheet closes.
    pub interrupt_reader: bool,
    /// Time to wait before the re-entry is surfaced.
    pub settle_window: Duration,
}

#[derive(Debug)]
struct PendingReentry {
    responder: PinResponder,
    attempts_remaining: Option<u8>,
    surfaced: bool,
}

#[derive(Debug, Default)]
struct PinState {
    wallet_pin: Option<SecretString>,
    card_pin: Option<SecretString>,
    pending: Option<PendingReentry>,
    card_pin_supplied: bool,
}

fn validate_pin(pin: &SecretString, attribute: &str) -> Result<(), PidKitError> {
    let digits = pin.expose_secret();
    if digits.len() != PIN_LENGTH || !digits.bytes().all(|b| b.is_ascii_digit()) {
        return Err(PidKitError::InvalidInput {
            attribute: attribute.to_string(),
            reason: format!("must be {PIN_LENGTH} digits"),
        });
    }
    Ok(())
}

/// Holds the wallet PIN and the card PIN between entry and use.
#[derive(Debug)]
pub struct PinCoordinator {
    platform: DevicePlatform,
    card_scan: Arc<CardScanCoordinator>,
    state: Mutex<PinState>,
}

impl PinCoordinator {
    /// Creates a coordinator driving `card_scan` on `platform`.
    #[must_use]
    pub fn new(platform: DevicePlatform, card_scan: Arc<CardScanCoordinator>) -> Self {
        Self {
            platform,
            card_scan,
            state: Mutex::new(PinState::default()),
        }
    }

    // ---- wallet PIN ----

    /// Stores the first wallet PIN entry, replacing any previous one.
    ///
    /// # Errors
    ///
    /// Returns [`PidKitError::InvalidInput`] unless the PIN is [`PIN_LENGTH`] digits.
    pub fn submit_wallet_pin(&self, pin: SecretString) -> Result<(), PidKitError> {
        validate_pin(&pin, "wallet_pin")?;
        lock(&self.state).wallet_pin = Some(pin);
        Ok(())
    }

    /// Compares the confirmation against the first entry and returns the confirmed PIN.
    ///
    /// The stored entry is consumed either way.
    ///
    /// # Errors
    ///
    /// Returns [`PidKitError::PinMismatch`] if the entries differ and
    /// [`PidKitError::InvariantViolation`] if there is no first entry.
    pub fn confirm_wallet_pin(
        &self,
        confirmation: &SecretString,
    ) -> Result<SecretString, PidKitError> {
        let first = lock(&self.state).wallet_pin.take().ok_or_else(|| {
            PidKitError::InvariantViolation("wallet PIN confirmed before it was entered".to_string())
        })?;
        let matches: bool = first
            .expose_secret()
            .as_bytes()
            .ct_eq(confirmation.expose_secret().as_bytes())
            .into();
        if !matches {
            return Err(PidKitError::PinMismatch);
        }
        Ok(first)
    }

    /// Whether a first wallet PIN entry is held.
    #[must_use]
    pub fn has_wallet_pin(&self) -> bool {
        lock(&self.state).wallet_pin.is_some()
    }

    /// Drops the wallet PIN.
    pub fn clear_wallet_pin(&self) {
        lock(&self.state).wallet_pin = None;
    }

    // ---- card PIN ----

    /// Accepts a card PIN from the user.
    ///
    /// Once a pending re-entry was surfaced the PIN goes straight to the waiting card and the
    /// scan overlay is opened again; otherwise it is stored for the next authentication.
    ///
    /// # Errors
    ///
    /// Returns [`PidKitError::InvalidInput`] unless the PIN is [`PIN_LENGTH`] digits or while
    /// the settle window of a rejected PIN is still running, and
    /// [`PidKitError::HardwareCancelled`] if the card stopped waiting for the re-entered PIN.
    pub fn submit_card_pin(&self, pin: SecretString) -> Result<CardPinSubmission, PidKitError> {
        validate_pin(&pin, "card_pin")?;
        let mut state = lock(&self.state);
        if state.pending.as_ref().is_some_and(|pending| !pending.surfaced) {
            return Err(PidKitError::InvalidInput {
                attribute: "card_pin".to_string(),
                reason: "PIN re-entry is not open yet".to_string(),
            });
        }
        let Some(pending) = state.pending.take() else {
            state.card_pin = Some(pin);
            return Ok(CardPinSubmission::Stored);
        };
        drop(state);

        if pending.responder.resolve(pin).is_err() {
            log::debug!("card reader stopped waiting for the re-entered PIN");
            return Err(PidKitError::HardwareCancelled);
        }
        self.card_scan.begin();
        Ok(CardPinSubmission::Resumed)
    }

    /// Consumes the stored card PIN if it is the simulator sentinel and simulator cards are
    /// allowed. Returns whether the next authentication should use a simulated card.
    ///
    /// When `allow` is false the sentinel is left in place and handed to the card like any
    /// other PIN.
    pub fn consume_simulator_sentinel(&self, allow: bool) -> bool {
        if !allow {
            return false;
        }
        let mut state = lock(&self.state);
        let is_sentinel = state
            .card_pin
            .as_ref()
            .is_some_and(|pin| pin.expose_secret() == SIMULATOR_CARD_PIN);
        if is_sentinel {
            state.card_pin = None;
        }
        is_sentinel
    }

    /// Marks the start of a card authentication. The first PIN request of the attempt is
    /// answered with the stored PIN.
    pub fn begin_card_attempt(&self) {
        let mut state = lock(&self.state);
        state.card_pin_supplied = false;
        state.pending = None;
    }

    /// Answers a PIN request from the card.
    ///
    /// The first request of an attempt takes the stored PIN. A request after a PIN was
    /// supplied means the card rejected it: the responder is parked until the user enters a
    /// new PIN through [`PinCoordinator::submit_card_pin`].
    pub fn answer_pin_request(
        &self,
        request: PinRequest,
        responder: PinResponder,
    ) -> PinRequestOutcome {
        let mut state = lock(&self.state);
        let rejected = request.is_retry || state.card_pin_supplied;
        let stored = if rejected { None } else { state.card_pin.take() };

        if let Some(pin) = stored {
            state.card_pin_supplied = true;
            drop(state);
            if responder.resolve(pin).is_err() {
                log::debug!("card reader stopped waiting for the PIN");
            }
            return PinRequestOutcome::Answered;
        }

        state.card_pin_supplied = true;
        state.pending = Some(PendingReentry {
            responder,
            attempts_remaining: request.attempts_remaining,
            surfaced: false,
        });
        PinRequestOutcome::ReentryRequired {
            attempts_remaining: request.attempts_remaining,
        }
    }

    /// Shows the error overlay for a rejected PIN and tells the caller how to wind down the
    /// card attempt before [`PinCoordinator::surface_reentry`].
    pub fn reject_card_attempt(&self) -> PinRejection {
        self.card_scan.on_error();
        PinRejection {
            interrupt_reader: self.platform.interrupts_on_wrong_pin(),
            settle_window: self.platform.pin_reentry_settle_window(),
        }
    }

    /// Hides the scan overlay so the PIN re-entry screen can show the keyboard.
    ///
    /// Returns the remaining attempts if a re-entry is still pending and was not surfaced yet.
    pub fn surface_reentry(&self) -> Option<Option<u8>> {
        let mut state = lock(&self.state);
        let pending = state.pending.as_mut().filter(|pending| !pending.surfaced)?;
        pending.surfaced = true;
        let attempts_remaining = pending.attempts_remaining;
        drop(state);

        self.card_scan.dismiss_modal();
        Some(attempts_remaining)
    }

    /// Whether the card waits for a re-entered PIN.
    #[must_use]
    pub fn card_pin_reentry_pending(&self) -> bool {
        lock(&self.state).pending.is_some()
    }

    /// Whether a card PIN is stored.
    #[must_use]
    pub fn has_card_pin(&self) -> bool {
        lock(&self.state).card_pin.is_some()
    }

    /// Drops the card PIN and abandons any pending re-entry.
    pub fn clear_card_pin(&self) {
        let mut state = lock(&self.state);
        state.card_pin = None;
        state.pending = None;
        state.card_pin_supplied = false;
    }
}

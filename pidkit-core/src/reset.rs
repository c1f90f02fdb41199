//! Rolls the whole flow back to a recovery step.

use std::sync::Arc;

use crate::{
    acquisition::AcquisitionStateMachine,
    card_scan::CardScanCoordinator,
    error::{PidKitError, GENERIC_FAILURE_MESSAGE},
    pin::PinCoordinator,
    platform::{CardReader, IssuanceClient, Notifier},
    steps::{StepId, StepSequencer},
    wallet::WalletSession,
};

/// Discards every piece of state created at or after a target step.
///
/// Each state slice is owned by the step that creates it:
///
/// | step                          | slice                                      |
/// |-------------------------------|--------------------------------------------|
/// | `pin`                         | wallet PIN, wallet agent                   |
/// | `id-card-requested-attributes`| card session, authentication, access token |
/// | `id-card-pin`                 | card PIN, pending re-entry, scan state     |
/// | `id-card-fetch`               | retrieved credentials and holder name      |
///
/// Slices owned by steps before the target are never touched.
pub struct ResetController<R, I> {
    sequencer: Arc<StepSequencer>,
    pin: Arc<PinCoordinator>,
    card_scan: Arc<CardScanCoordinator>,
    machine: Arc<AcquisitionStateMachine<R, I>>,
    wallet: Arc<WalletSession>,
    notifier: Arc<dyn Notifier>,
}

impl<R: CardReader, I: IssuanceClient> ResetController<R, I> {
    /// Creates a controller over the flow components.
    #[must_use]
    pub fn new(
        sequencer: Arc<StepSequencer>,
        pin: Arc<PinCoordinator>,
        card_scan: Arc<CardScanCoordinator>,
        machine: Arc<AcquisitionStateMachine<R, I>>,
        wallet: Arc<WalletSession>,
        notifier: Arc<dyn Notifier>,
    ) -> Self {
        Self {
            sequencer,
            pin,
            card_scan,
            machine,
            wallet,
            notifier,
        }
    }

    /// Resets the flow to `target`.
    ///
    /// Operations still suspended on a collaborator are abandoned and the card scan is
    /// cancelled, whatever slices are cleared. With `notify_user` one toast is shown, using
    /// the error's message when it has one. Resetting twice to the same target leaves the
    /// same state.
    ///
    /// # Errors
    ///
    /// Returns [`PidKitError::InvalidInput`] if `target` is not part of the step sequence.
    /// Nothing is cleared in that case.
    pub async fn reset(
        &self,
        target: StepId,
        error: Option<&PidKitError>,
        notify_user: bool,
    ) -> Result<(), PidKitError> {
        let cleared = self.sequencer.steps_from(target);
        if cleared.is_empty() {
            return Err(PidKitError::InvalidInput {
                attribute: "step".to_string(),
                reason: format!("{target} is not part of the sequence"),
            });
        }

        match error {
            Some(error) if error.is_invariant_violation() => {
                log::error!("resetting to {target} after a caller bug: {error}");
            }
            Some(error) => log::info!("resetting to {target} after {error}"),
            None => log::info!("resetting to {target}"),
        }

        self.machine.abandon_in_flight();
        for step in cleared {
            self.clear_slice(step);
        }
        self.machine.cancel_id_card_scanning().await;
        self.sequencer.go_to(target)?;

        if notify_user {
            let message = error
                .and_then(PidKitError::user_message)
                .unwrap_or(GENERIC_FAILURE_MESSAGE);
            self.notifier.show_toast(message);
        }
        Ok(())
    }

    fn clear_slice(&self, step: StepId) {
        match step {
            StepId::Pin => {
                self.pin.clear_wallet_pin();
                self.wallet.clear();
            }
            StepId::IdCardRequestedAttributes => self.machine.clear_auth_artifacts(),
            StepId::IdCardPin => {
                self.pin.clear_card_pin();
                self.card_scan.reset();
            }
            StepId::IdCardFetch => self.machine.clear_retrieved(),
            StepId::PinReentry
            | StepId::DataProtection
            | StepId::IdCardScan
            | StepId::BiometricsDisabled
            | StepId::Success => {}
        }
    }
}

//! The host-facing entry point of the PID acquisition.

use std::sync::atomic::AtomicBool;
use std::sync::Arc;

use secrecy::SecretString;
use tokio::sync::{broadcast, watch};

use crate::{
    acquisition::{
        AcquisitionEvent, AcquisitionState, AcquisitionStateMachine, AuthenticateOutcome,
        InitializeOutcome,
    },
    batch::BatchCredentialPool,
    card_scan::{CardScanCoordinator, CardScanState},
    config::FlowConfig,
    credential::CredentialRecord,
    error::PidKitError,
    pin::{CardPinSubmission, PinCoordinator},
    platform::{
        AccessRights, BatchRefill, CardReader, CredentialRepository, InitializeOptions,
        IssuanceClient, Notifier, SecureUnlock,
    },
    reset::ResetController,
    steps::{FlowState, StepId, StepSequencer},
    sync::InFlightGuard,
    wallet::WalletSession,
};

/// Owns every component of one PID acquisition and drives them from the host UI.
///
/// Each user-facing step has one action, run by [`PidOrchestrator::advance`] or by the PIN
/// submission methods. Failures are classified and routed to
/// [`ResetController::reset`] with the error's recovery step before they are returned, so
/// the host only has to render the step it lands on. Calls made on a step where they are not
/// available fail with [`PidKitError::InvalidInput`] and leave the flow untouched.
///
/// The orchestrator is meant to be shared behind an [`Arc`]: the card scan started by
/// [`PidOrchestrator::advance`] stays suspended while the card waits for a re-entered PIN,
/// which the host submits from another task through [`PidOrchestrator::submit_card_pin`].
pub struct PidOrchestrator<R, I> {
    config: FlowConfig,
    issuer: Arc<I>,
    sequencer: Arc<StepSequencer>,
    card_scan: Arc<CardScanCoordinator>,
    pin: Arc<PinCoordinator>,
    wallet: Arc<WalletSession>,
    machine: Arc<AcquisitionStateMachine<R, I>>,
    resets: ResetController<R, I>,
    scanning: AtomicBool,
}

fn unavailable(current: StepId, operation: &str) -> PidKitError {
    PidKitError::InvalidInput {
        attribute: "step".to_string(),
        reason: format!("{operation} is not available on {current}"),
    }
}

impl<R: CardReader, I: IssuanceClient> PidOrchestrator<R, I> {
    /// Creates the flow, positioned on the wallet PIN step.
    #[must_use]
    pub fn new(
        config: FlowConfig,
        options: InitializeOptions,
        reader: Arc<R>,
        issuer: Arc<I>,
        unlock: Arc<dyn SecureUnlock>,
        notifier: Arc<dyn Notifier>,
    ) -> Self {
        let sequencer = Arc::new(StepSequencer::pid_acquisition(config.completion_settle()));
        let card_scan = Arc::new(CardScanCoordinator::new());
        let pin = Arc::new(PinCoordinator::new(config.platform, Arc::clone(&card_scan)));
        let wallet = Arc::new(WalletSession::new(unlock));
        let machine = Arc::new(AcquisitionStateMachine::new(
            reader,
            Arc::clone(&issuer),
            options,
            Arc::clone(&card_scan),
            Arc::clone(&pin),
            config.simulator_card_allowed(),
        ));
        let resets = ResetController::new(
            Arc::clone(&sequencer),
            Arc::clone(&pin),
            Arc::clone(&card_scan),
            Arc::clone(&machine),
            Arc::clone(&wallet),
            notifier,
        );
        log::info!("PID acquisition flow created for {}", config.platform);

        Self {
            config,
            issuer,
            sequencer,
            card_scan,
            pin,
            wallet,
            machine,
            resets,
            scanning: AtomicBool::new(false),
        }
    }

    fn expect_step(&self, expected: &[StepId], operation: &str) -> Result<StepId, PidKitError> {
        let current = self.sequencer.current();
        if expected.contains(&current) {
            Ok(current)
        } else {
            Err(unavailable(current, operation))
        }
    }

    fn advance_sequencer(&self) -> StepId {
        self.sequencer
            .advance()
            .unwrap_or_else(|| self.sequencer.current())
    }

    /// Routes a failure to its recovery step, unless a reset already abandoned the operation
    /// that produced it.
    async fn recover<T>(
        &self,
        generation: u64,
        result: Result<T, PidKitError>,
    ) -> Result<T, PidKitError> {
        let error = match result {
            Ok(value) => return Ok(value),
            Err(error) => error,
        };
        if self.machine.generation() != generation {
            log::debug!("{error} after the flow was reset, not recovering again");
            return Err(error);
        }

        let recovery = error.recovery();
        if let Err(reset_error) = self
            .resets
            .reset(recovery.step, Some(&error), recovery.notify_user)
            .await
        {
            log::warn!("recovery to {} failed: {reset_error}", recovery.step);
        }
        Err(error)
    }

    /// Submits the wallet PIN on the `pin` step, or its confirmation on `pin-reentry`.
    ///
    /// A confirmed PIN sets up the secure unlock and the wallet agent. Returns the step the
    /// flow moved to.
    ///
    /// # Errors
    ///
    /// Returns [`PidKitError::InvalidInput`] for malformed PINs or outside the PIN steps.
    /// A mismatching confirmation returns [`PidKitError::PinMismatch`] after the flow was
    /// reset to `pin`.
    pub async fn submit_wallet_pin(&self, pin: SecretString) -> Result<StepId, PidKitError> {
        let generation = self.machine.generation();
        if self.expect_step(&[StepId::Pin, StepId::PinReentry], "wallet PIN entry")? == StepId::Pin
        {
            self.pin.submit_wallet_pin(pin)?;
            return Ok(self.advance_sequencer());
        }

        let result = self
            .pin
            .confirm_wallet_pin(&pin)
            .and_then(|confirmed| self.wallet.establish(confirmed));
        self.recover(generation, result).await?;
        Ok(self.advance_sequencer())
    }

    /// Submits the card PIN.
    ///
    /// On `id-card-pin` the PIN is stored for the scan and the flow moves to `id-card-scan`.
    /// While the card waits for a re-entered PIN it is handed to the card and the suspended
    /// scan resumes.
    ///
    /// # Errors
    ///
    /// Returns [`PidKitError::InvalidInput`] for malformed PINs, outside the card PIN step or
    /// before [`AcquisitionEvent::CardPinReentryRequested`] asked for the re-entry, and
    /// [`PidKitError::HardwareCancelled`] if the card stopped waiting.
    pub async fn submit_card_pin(&self, pin: SecretString) -> Result<StepId, PidKitError> {
        let generation = self.machine.generation();
        if !self.pin.card_pin_reentry_pending() {
            self.expect_step(&[StepId::IdCardPin], "card PIN entry")?;
        }

        match self.pin.submit_card_pin(pin) {
            Ok(CardPinSubmission::Stored) => Ok(self.advance_sequencer()),
            Ok(CardPinSubmission::Resumed) => Ok(self.sequencer.current()),
            Err(error @ PidKitError::InvalidInput { .. }) => Err(error),
            Err(error) => self.recover(generation, Err(error)).await,
        }
    }

    /// Runs the action of the current step and moves on. Returns the step the flow is on
    /// afterwards.
    ///
    /// | step                           | action                                        |
    /// |--------------------------------|-----------------------------------------------|
    /// | `data-protection`              | open the card session                         |
    /// | `id-card-requested-attributes` | none, the user accepted the access rights     |
    /// | `id-card-pin`                  | none, requires a submitted card PIN           |
    /// | `id-card-scan`                 | authenticate the card, exchange the token     |
    /// | `id-card-fetch`                | retrieve the credentials, complete the flow   |
    /// | `biometrics-disabled`          | return to `id-card-fetch` for another attempt |
    ///
    /// The PIN steps advance through their submit methods. While another call is still
    /// opening the card session or scanning the card this returns the current step without
    /// doing anything.
    ///
    /// # Errors
    ///
    /// Returns the classified failure after the flow was reset to its recovery step.
    pub async fn advance(&self) -> Result<StepId, PidKitError> {
        let generation = self.machine.generation();
        let current = self.sequencer.current();
        match current {
            StepId::Pin | StepId::PinReentry | StepId::Success => {
                Err(unavailable(current, "advance"))
            }
            StepId::DataProtection => {
                let result = self.machine.initialize().await;
                match self.recover(generation, result).await? {
                    InitializeOutcome::Started(_) => Ok(self.advance_sequencer()),
                    InitializeOutcome::AlreadyInitializing => Ok(current),
                }
            }
            StepId::IdCardRequestedAttributes => Ok(self.advance_sequencer()),
            StepId::IdCardPin => {
                if self.pin.has_card_pin() {
                    Ok(self.advance_sequencer())
                } else {
                    Err(unavailable(current, "advance without a card PIN"))
                }
            }
            StepId::IdCardScan => {
                let Some(_scanning) = InFlightGuard::acquire(&self.scanning) else {
                    log::debug!("card scan already running");
                    return Ok(current);
                };
                let result = self.scan().await;
                match self.recover(generation, result).await? {
                    AuthenticateOutcome::Authenticated => Ok(self.advance_sequencer()),
                    AuthenticateOutcome::AlreadyAuthenticating => Ok(current),
                }
            }
            StepId::IdCardFetch => {
                let result = self.fetch().await;
                self.recover(generation, result).await?;

                let settle = self.sequencer.complete();
                if !settle.is_zero() {
                    tokio::time::sleep(settle).await;
                }
                if self.machine.generation() != generation {
                    return Ok(self.sequencer.current());
                }
                Ok(self.advance_sequencer())
            }
            StepId::BiometricsDisabled => {
                self.resets.reset(StepId::IdCardFetch, None, false).await?;
                Ok(StepId::IdCardFetch)
            }
        }
    }

    async fn scan(&self) -> Result<AuthenticateOutcome, PidKitError> {
        let outcome = self.machine.authenticate_using_id_card().await?;
        if outcome == AuthenticateOutcome::Authenticated {
            self.machine.acquire_access_token().await?;
        }
        Ok(outcome)
    }

    async fn fetch(&self) -> Result<(), PidKitError> {
        let agent = self.wallet.agent()?;
        self.machine.retrieve_credentials(&agent).await?;
        Ok(())
    }

    /// Moves to the previous non-alternative step without clearing anything.
    pub fn back(&self) -> Option<StepId> {
        self.sequencer.back()
    }

    /// Jumps to `step` without clearing anything.
    ///
    /// # Errors
    ///
    /// Returns [`PidKitError::InvalidInput`] if `step` is not part of the flow.
    pub fn go_to(&self, step: StepId) -> Result<(), PidKitError> {
        self.sequencer.go_to(step)
    }

    /// Resets the flow to `target`, see [`ResetController::reset`].
    ///
    /// # Errors
    ///
    /// Returns [`PidKitError::InvalidInput`] if `target` is not part of the flow.
    pub async fn reset(
        &self,
        target: StepId,
        error: Option<&PidKitError>,
        notify_user: bool,
    ) -> Result<(), PidKitError> {
        self.resets.reset(target, error, notify_user).await
    }

    /// Cancels the card scan. A scan in progress fails with
    /// [`PidKitError::UserCancelled`] and the flow returns to `data-protection`.
    pub async fn cancel(&self) {
        self.machine.cancel_id_card_scanning().await;
    }

    /// Subscribes to acquisition events.
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<AcquisitionEvent> {
        self.machine.subscribe()
    }

    /// Subscribes to the card scan overlay state.
    #[must_use]
    pub fn subscribe_scan_state(&self) -> watch::Receiver<CardScanState> {
        self.card_scan.subscribe()
    }

    /// The flow configuration.
    #[must_use]
    pub const fn config(&self) -> &FlowConfig {
        &self.config
    }

    /// Current step and displayed progress.
    #[must_use]
    pub fn flow_state(&self) -> FlowState {
        self.sequencer.state()
    }

    /// The step currently shown.
    #[must_use]
    pub fn current_step(&self) -> StepId {
        self.sequencer.current()
    }

    /// The card scan overlay state.
    #[must_use]
    pub fn scan_state(&self) -> CardScanState {
        self.card_scan.state()
    }

    /// Phase of the acquisition.
    #[must_use]
    pub fn acquisition_state(&self) -> AcquisitionState {
        self.machine.state()
    }

    /// The attributes the issuer reads from the card, for the review step.
    #[must_use]
    pub fn access_rights(&self) -> Option<AccessRights> {
        self.machine.access_rights()
    }

    /// The holder's name, for the success screen.
    #[must_use]
    pub fn holder_name(&self) -> Option<String> {
        self.machine.holder_name()
    }

    /// The retrieved credential records.
    #[must_use]
    pub fn credentials(&self) -> Vec<CredentialRecord> {
        self.machine.credentials()
    }

    /// Whether a first wallet PIN entry is held.
    #[must_use]
    pub fn has_wallet_pin(&self) -> bool {
        self.pin.has_wallet_pin()
    }

    /// Whether a card PIN is held for the next scan.
    #[must_use]
    pub fn has_card_pin(&self) -> bool {
        self.pin.has_card_pin()
    }

    /// Whether the wallet agent is established.
    #[must_use]
    pub fn has_wallet_agent(&self) -> bool {
        self.wallet.has_agent()
    }
}

impl<R: CardReader, I: IssuanceClient + BatchRefill> PidOrchestrator<R, I> {
    /// A pool handing out the batch credentials of the retrieved records, refilled through
    /// the issuer.
    #[must_use]
    pub fn batch_pool(&self, repository: Arc<dyn CredentialRepository>) -> BatchCredentialPool<I> {
        BatchCredentialPool::new(&self.config, repository, Arc::clone(&self.issuer))
    }
}

//! The acquisition use case: card session, card authentication, token exchange and credential
//! retrieval.
//!
//! Operations check the phase they are legal in and fail with
//! [`PidKitError::InvariantViolation`] otherwise. Every operation records the reset
//! generation it started in; a reset while it is suspended abandons it, and its late result is
//! discarded instead of overwriting the state the reset produced.

use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::broadcast;
use tokio::time::Instant;

use crate::{
    card_scan::CardScanCoordinator,
    credential::CredentialRecord,
    error::PidKitError,
    pin::{PinCoordinator, PinRejection, PinRequestOutcome},
    platform::{
        card_event_channel, AccessRights, AccessToken, AuthenticateRequest, AuthenticatedSession,
        CardEvent, CardReader, CardReaderError, InitializeOptions, IssuanceClient, SessionStart,
    },
    sync::{lock, InFlightGuard},
    wallet::WalletAgent,
};

mod events;
pub use events::*;


const EVENT_CAPACITY: usize = 64;

#[derive(Debug)]
struct Machine {
    state: AcquisitionState,
    session: Option<SessionStart>,
    authenticated: Option<AuthenticatedSession>,
    token: Option<Arc<AccessToken>>,
    records: Vec<CredentialRecord>,
}

impl Default for Machine {
    fn default() -> Self {
        Self {
            state: AcquisitionState::Initializing,
            session: None,
            authenticated: None,
            token: None,
            records: Vec::new(),
        }
    }
}

async fn settle_elapsed(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

type PendingInterrupt<'a> = Pin<Box<dyn Future<Output = Result<(), CardReaderError>> + Send + 'a>>;

async fn interrupted<F: Future + Unpin>(interrupt: &mut Option<F>) -> F::Output {
    match interrupt {
        Some(interrupt) => interrupt.await,
        None => std::future::pending().await,
    }
}

/// Drives a single PID acquisition against the card reader and the issuer.
pub struct AcquisitionStateMachine<R, I> {
    reader: Arc<R>,
    issuer: Arc<I>,
    options: InitializeOptions,
    card_scan: Arc<CardScanCoordinator>,
    pin: Arc<PinCoordinator>,
    allow_simulator_card: bool,
    machine: Mutex<Machine>,
    initializing: AtomicBool,
    authenticating: AtomicBool,
    generation: AtomicU64,
    events: broadcast::Sender<AcquisitionEvent>,
}

impl<R: CardReader, I: IssuanceClient> AcquisitionStateMachine<R, I> {
    /// Creates a machine in [`AcquisitionState::Initializing`].
    ///
    /// `allow_simulator_card` must already account for the build features, see
    /// [`crate::FlowConfig::simulator_card_allowed`].
    #[must_use]
    pub fn new(
        reader: Arc<R>,
        issuer: Arc<I>,
        options: InitializeOptions,
        card_scan: Arc<CardScanCoordinator>,
        pin: Arc<PinCoordinator>,
        allow_simulator_card: bool,
    ) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            reader,
            issuer,
            options,
            card_scan,
            pin,
            allow_simulator_card,
            machine: Mutex::new(Machine::default()),
            initializing: AtomicBool::new(false),
            authenticating: AtomicBool::new(false),
            generation: AtomicU64::new(0),
            events,
        }
    }

    /// Subscribes to acquisition events.
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<AcquisitionEvent> {
        self.events.subscribe()
    }

    /// The current phase.
    #[must_use]
    pub fn state(&self) -> AcquisitionState {
        lock(&self.machine).state
    }

    /// The attributes the issuer reads from the card, once the session is open.
    #[must_use]
    pub fn access_rights(&self) -> Option<AccessRights> {
        lock(&self.machine)
            .session
            .as_ref()
            .map(|session| session.access_rights.clone())
    }

    /// The retrieved credential records.
    #[must_use]
    pub fn credentials(&self) -> Vec<CredentialRecord> {
        lock(&self.machine).records.clone()
    }

    /// The holder's name from the retrieved credentials.
    #[must_use]
    pub fn holder_name(&self) -> Option<String> {
        lock(&self.machine)
            .records
            .iter()
            .find_map(CredentialRecord::holder_name)
    }

    /// Reset generation. Changes whenever in-flight operations are abandoned.
    #[must_use]
    pub fn generation(&self) -> u64 {
        self.generation.load(Ordering::SeqCst)
    }

    /// Abandons every operation currently suspended on a collaborator.
    pub fn abandon_in_flight(&self) {
        self.generation.fetch_add(1, Ordering::SeqCst);
    }

    fn emit(&self, event: AcquisitionEvent) {
        // no subscribers is fine
        let _ = self.events.send(event);
    }

    fn set_state(&self, machine: &mut Machine, state: AcquisitionState) {
        if machine.state != state {
            machine.state = state;
            self.emit(AcquisitionEvent::StateChanged(state));
        }
    }

    fn fail(&self) {
        let mut machine = lock(&self.machine);
        self.set_state(&mut machine, AcquisitionState::Failed);
    }

    fn expect_state(&self, expected: AcquisitionState, operation: &str) -> Result<(), PidKitError> {
        let state = self.state();
        if state != expected {
            return Err(PidKitError::InvariantViolation(format!(
                "{operation} called in {state:?}, expected {expected:?}"
            )));
        }
        Ok(())
    }

    fn ensure_current(&self, generation: u64, operation: &str) -> Result<(), PidKitError> {
        if self.generation() != generation {
            log::debug!("{operation} finished after a reset, discarding its result");
            return Err(PidKitError::HardwareCancelled);
        }
        Ok(())
    }

    /// Opens the card session and returns the access rights.
    ///
    /// A call while another `initialize` is in flight returns
    /// [`InitializeOutcome::AlreadyInitializing`] without touching the card reader. Once the
    /// session is open, further calls return it again.
    ///
    /// # Errors
    ///
    /// Returns the classified card reader error, or [`PidKitError::InvariantViolation`] after
    /// the card was authenticated.
    pub async fn initialize(&self) -> Result<InitializeOutcome, PidKitError> {
        let Some(_in_flight) = InFlightGuard::acquire(&self.initializing) else {
            log::debug!("initialize already in flight");
            return Ok(InitializeOutcome::AlreadyInitializing);
        };

        {
            let machine = lock(&self.machine);
            match machine.state {
                AcquisitionState::Initializing | AcquisitionState::Failed => {}
                AcquisitionState::IdCardAuth if machine.authenticated.is_none() => {
                    if let Some(session) = &machine.session {
                        log::debug!("card session already open");
                        return Ok(InitializeOutcome::Started(session.clone()));
                    }
                }
                state => {
                    return Err(PidKitError::InvariantViolation(format!(
                        "initialize called in {state:?}"
                    )));
                }
            }
        }

        let generation = self.generation();
        let result = self.reader.initialize(&self.options).await;
        self.ensure_current(generation, "initialize")?;

        match result {
            Ok(start) => {
                let mut machine = lock(&self.machine);
                machine.session = Some(start.clone());
                self.set_state(&mut machine, AcquisitionState::IdCardAuth);
                log::info!(
                    "card session open, {} attributes requested",
                    start.access_rights.len()
                );
                Ok(InitializeOutcome::Started(start))
            }
            Err(error) => {
                self.fail();
                Err(error.into())
            }
        }
    }

    /// Authenticates with the card, answering its PIN requests through the
    /// [`PinCoordinator`].
    ///
    /// A rejected PIN does not fail the call: the card attempt is interrupted, the error
    /// overlay shown, and after the platform settle window a
    /// [`AcquisitionEvent::CardPinReentryRequested`] asks for a new PIN. The call stays
    /// suspended until the card accepts a PIN, the scan is cancelled, or a reset abandons it.
    /// The card PIN is cleared when the call returns, win or lose.
    ///
    /// The card reader is exclusive: a call while another authentication is running returns
    /// [`AuthenticateOutcome::AlreadyAuthenticating`] without touching the reader or the PIN.
    ///
    /// # Errors
    ///
    /// Returns [`PidKitError::UserCancelled`] or [`PidKitError::HardwareCancelled`] for
    /// cancelled scans, [`PidKitError::IdCard`] for other card failures and
    /// [`PidKitError::InvariantViolation`] outside [`AcquisitionState::IdCardAuth`].
    pub async fn authenticate_using_id_card(&self) -> Result<AuthenticateOutcome, PidKitError> {
        let Some(_in_flight) = InFlightGuard::acquire(&self.authenticating) else {
            log::debug!("card authentication already in flight");
            return Ok(AuthenticateOutcome::AlreadyAuthenticating);
        };
        let generation = self.generation();
        let session = {
            let machine = lock(&self.machine);
            if machine.state != AcquisitionState::IdCardAuth || machine.authenticated.is_some() {
                return Err(PidKitError::InvariantViolation(format!(
                    "card authentication called in {:?}",
                    machine.state
                )));
            }
            machine
                .session
                .as_ref()
                .map(|session| session.continuation.clone())
                .ok_or_else(|| PidKitError::InvariantViolation("no card session".to_string()))?
        };

        let use_simulator_card = self.pin.consume_simulator_sentinel(self.allow_simulator_card);
        if use_simulator_card {
            log::warn!("authenticating with a simulated card");
        }
        self.pin.begin_card_attempt();
        self.card_scan.begin();

        let (sender, mut receiver) = card_event_channel();
        let request = AuthenticateRequest {
            session,
            use_simulator_card,
        };
        let authentication = self.reader.authenticate(request, sender);
        tokio::pin!(authentication);

        let mut settle_deadline: Option<Instant> = None;
        let mut interrupt: Option<PendingInterrupt<'_>> = None;
        let mut settle_after_interrupt: Option<Duration> = None;
        let result = loop {
            tokio::select! {
                biased;
                Some(event) = receiver.recv() => {
                    match self.handle_card_event(event) {
                        Some(rejection) if rejection.interrupt_reader => {
                            let pending: PendingInterrupt<'_> = Box::pin(self.reader.interrupt());
                            interrupt = Some(pending);
                            settle_after_interrupt = Some(rejection.settle_window);
                        }
                        Some(rejection) => {
                            settle_deadline = Some(Instant::now() + rejection.settle_window);
                        }
                        None => {}
                    }
                }
                result = &mut authentication => break result,
                // polled next to the authentication, which may have to run for the interrupt to finish
                done = interrupted(&mut interrupt), if interrupt.is_some() => {
                    interrupt = None;
                    if let Err(error) = done {
                        log::warn!("failed to interrupt the card reader after a wrong PIN: {error}");
                    }
                    if let Some(window) = settle_after_interrupt.take() {
                        settle_deadline = Some(Instant::now() + window);
                    }
                }
                () = settle_elapsed(settle_deadline), if settle_deadline.is_some() => {
                    settle_deadline = None;
                    if let Some(attempts_remaining) = self.pin.surface_reentry() {
                        self.emit(AcquisitionEvent::CardPinReentryRequested { attempts_remaining });
                    }
                }
            }
        };

        if interrupt.take().is_some() {
            log::debug!("card attempt ended before the reader confirmed the interrupt");
        }
        // PIN requests left in the queue are dropped with their responders
        while let Ok(event) = receiver.try_recv() {
            if !matches!(event, CardEvent::EnterPin { .. }) {
                self.handle_card_event(event);
            }
        }
        self.pin.clear_card_pin();
        self.ensure_current(generation, "card authentication")?;

        match result {
            Ok(authenticated) => {
                self.card_scan.on_complete();
                lock(&self.machine).authenticated = Some(authenticated);
                log::info!("card authenticated");
                Ok(AuthenticateOutcome::Authenticated)
            }
            Err(error) => {
                let error = PidKitError::from(error);
                self.card_scan.on_error();
                if error.is_cancellation() {
                    log::info!("card scan cancelled: {error}");
                } else {
                    log::warn!("card authentication failed: {error}");
                    self.fail();
                }
                Err(error)
            }
        }
    }

    /// Projects a card event onto the scan state and the host events. Returns how to wind
    /// down the attempt when the card rejected the PIN.
    fn handle_card_event(&self, event: CardEvent) -> Option<PinRejection> {
        match event {
            CardEvent::StateChanged(state) => {
                self.emit(AcquisitionEvent::ReaderStateChanged(state));
            }
            CardEvent::CardAttachedChanged { is_card_attached } => {
                self.card_scan.on_attached_changed(is_card_attached);
                self.emit(AcquisitionEvent::CardAttachedChanged { is_card_attached });
            }
            CardEvent::StatusProgress { progress } => {
                self.card_scan.on_progress(progress);
                self.emit(AcquisitionEvent::StatusProgress { progress });
            }
            CardEvent::EnterPin { request, responder } => {
                if let PinRequestOutcome::ReentryRequired { attempts_remaining } =
                    self.pin.answer_pin_request(request, responder)
                {
                    log::info!("card rejected the PIN, {attempts_remaining:?} attempts remaining");
                    return Some(self.pin.reject_card_attempt());
                }
            }
        }
        None
    }

    /// Exchanges the authenticated card session for an access token.
    ///
    /// The authorization code is single use and consumed by this call.
    ///
    /// # Errors
    ///
    /// Returns [`PidKitError::NetworkOrIssuer`] if the exchange fails and
    /// [`PidKitError::InvariantViolation`] before a successful card authentication.
    pub async fn acquire_access_token(&self) -> Result<(), PidKitError> {
        let generation = self.generation();
        let authenticated = {
            let mut machine = lock(&self.machine);
            if machine.state != AcquisitionState::IdCardAuth {
                return Err(PidKitError::InvariantViolation(format!(
                    "access token requested in {:?}",
                    machine.state
                )));
            }
            machine.authenticated.take().ok_or_else(|| {
                PidKitError::InvariantViolation(
                    "access token requested before card authentication".to_string(),
                )
            })?
        };

        let result = self.issuer.acquire_access_token(&authenticated).await;
        self.ensure_current(generation, "access token exchange")?;

        match result {
            Ok(token) => {
                let mut machine = lock(&self.machine);
                machine.token = Some(Arc::new(token));
                self.set_state(&mut machine, AcquisitionState::RetrieveCredential);
                Ok(())
            }
            Err(error) => {
                self.fail();
                Err(error.into())
            }
        }
    }

    /// Retrieves the batch-issued credentials bound to `wallet`.
    ///
    /// # Errors
    ///
    /// Returns [`PidKitError::BiometricCancelled`] (the call can be retried),
    /// [`PidKitError::BiometricNotEnabled`], [`PidKitError::NetworkOrIssuer`], or
    /// [`PidKitError::InvariantViolation`] outside [`AcquisitionState::RetrieveCredential`].
    pub async fn retrieve_credentials(
        &self,
        wallet: &WalletAgent,
    ) -> Result<Vec<CredentialRecord>, PidKitError> {
        let generation = self.generation();
        self.expect_state(AcquisitionState::RetrieveCredential, "credential retrieval")?;
        let token = lock(&self.machine)
            .token
            .clone()
            .ok_or_else(|| PidKitError::InvariantViolation("no access token".to_string()))?;

        let result = self
            .issuer
            .retrieve_credentials(&token, wallet, &self.options.formats)
            .await;
        self.ensure_current(generation, "credential retrieval")?;

        let records = match result {
            Ok(issued) => issued
                .into_iter()
                .map(CredentialRecord::from_issued)
                .collect::<Result<Vec<_>, _>>(),
            Err(error) => Err(error.into()),
        };

        match records {
            Ok(records) => {
                let mut machine = lock(&self.machine);
                machine.records.clone_from(&records);
                self.set_state(&mut machine, AcquisitionState::Done);
                log::info!("retrieved {} credentials", records.len());
                Ok(records)
            }
            Err(PidKitError::BiometricCancelled) => {
                log::info!("biometric prompt cancelled during retrieval");
                Err(PidKitError::BiometricCancelled)
            }
            Err(error) => {
                self.fail();
                Err(error)
            }
        }
    }

    /// Cancels the card scan. Never fails: errors from the card reader are logged and
    /// dropped.
    pub async fn cancel_id_card_scanning(&self) {
        if let Err(error) = self.reader.cancel().await {
            log::debug!("ignoring card reader cancel failure: {error}");
        }
    }

    /// Drops the card session, the authentication and the access token and returns to
    /// [`AcquisitionState::Initializing`].
    pub fn clear_auth_artifacts(&self) {
        self.abandon_in_flight();
        let mut machine = lock(&self.machine);
        machine.session = None;
        machine.authenticated = None;
        machine.token = None;
        self.set_state(&mut machine, AcquisitionState::Initializing);
    }

    /// Drops the retrieved credentials. With an access token still held the machine returns
    /// to [`AcquisitionState::RetrieveCredential`] so the retrieval can be repeated.
    pub fn clear_retrieved(&self) {
        self.abandon_in_flight();
        let mut machine = lock(&self.machine);
        machine.records.clear();
        if machine.token.is_some() {
            self.set_state(&mut machine, AcquisitionState::RetrieveCredential);
        }
    }
}

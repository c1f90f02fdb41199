//! In-memory implementations of the collaborator traits.
//!
//! These implementations are NOT connected to any hardware or issuer. They are designed for
//! unit and integration testing of the orchestration and back the `pidkit simulate` command.

#![allow(clippy::missing_panics_doc)]
#![allow(clippy::missing_const_for_fn)]
#![allow(clippy::significant_drop_tightening)]

use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicU8, AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine as _};
use secrecy::{ExposeSecret, SecretString};
use serde::Serialize;
use tokio::sync::Notify;
use uuid::Uuid;
use zeroize::Zeroizing;

use crate::{
    credential::{CredentialFormat, CredentialRecord, EncodedCredential},
    credential::{FAMILY_NAME_CLAIM, GIVEN_NAME_CLAIM},
    sync::lock,
    wallet::WalletAgent,
};

use super::{
    AccessRights, AccessToken, AuthenticateRequest, AuthenticatedSession, BatchRefill,
    CardEventSender, CardReader, CardReaderError, CardSession, CredentialRepository,
    InitializeOptions, IssuanceClient, IssuanceError, IssuedCredential, Notifier, PinRequest,
    ReaderState, RepositoryError, SecureUnlock, SecureUnlockState, SessionStart, UnlockError,
    WalletKey, USER_CANCELLED_REASON,
};

// =============================================================================
// Card Reader
// =============================================================================

/// Behavior of a [`SimulatedCardReader`].
#[derive(Debug, Clone)]
pub struct CardScript {
    /// Attributes returned by `initialize`.
    pub access_rights: Vec<String>,
    /// The PIN the simulated card accepts.
    pub card_pin: String,
    /// PIN attempts before the card blocks.
    pub retry_counter: u8,
    /// When set, the scan is cancelled with this reason once the card is attached.
    pub cancel_reason: Option<String>,
    /// When set, `initialize` fails with this error.
    pub initialize_failure: Option<CardReaderError>,
    /// Time `initialize` takes.
    pub initialize_delay: Duration,
    /// When set, `cancel` returns an error.
    pub cancel_fails: bool,
}

impl Default for CardScript {
    fn default() -> Self {
        Self {
            access_rights: [
                "GivenNames",
                "FamilyName",
                "DateOfBirth",
                "PlaceOfBirth",
                "Nationality",
                "Address",
            ]
            .iter()
            .map(ToString::to_string)
            .collect(),
            card_pin: "123456".to_string(),
            retry_counter: 3,
            cancel_reason: None,
            initialize_failure: None,
            initialize_delay: Duration::ZERO,
            cancel_fails: false,
        }
    }
}

/// Number of calls a [`SimulatedCardReader`] received.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReaderCalls {
    /// `initialize` calls.
    pub initialize: usize,
    /// `authenticate` calls.
    pub authenticate: usize,
    /// `interrupt` calls.
    pub interrupt: usize,
    /// `cancel` calls.
    pub cancel: usize,
}

/// A scripted eID card and reader.
///
/// The retry counter persists across scans like on a real card.
#[derive(Debug)]
pub struct SimulatedCardReader {
    script: CardScript,
    retry_counter: AtomicU8,
    cancelled: Notify,
    initialize_calls: AtomicUsize,
    authenticate_calls: AtomicUsize,
    interrupt_calls: AtomicUsize,
    cancel_calls: AtomicUsize,
}

impl Default for SimulatedCardReader {
    fn default() -> Self {
        Self::new(CardScript::default())
    }
}

impl SimulatedCardReader {
    /// Creates a reader following `script`.
    #[must_use]
    pub fn new(script: CardScript) -> Self {
        Self {
            retry_counter: AtomicU8::new(script.retry_counter),
            script,
            cancelled: Notify::new(),
            initialize_calls: AtomicUsize::new(0),
            authenticate_calls: AtomicUsize::new(0),
            interrupt_calls: AtomicUsize::new(0),
            cancel_calls: AtomicUsize::new(0),
        }
    }

    /// Calls received so far.
    #[must_use]
    pub fn calls(&self) -> ReaderCalls {
        ReaderCalls {
            initialize: self.initialize_calls.load(Ordering::SeqCst),
            authenticate: self.authenticate_calls.load(Ordering::SeqCst),
            interrupt: self.interrupt_calls.load(Ordering::SeqCst),
            cancel: self.cancel_calls.load(Ordering::SeqCst),
        }
    }

    /// PIN attempts the card has left.
    #[must_use]
    pub fn retry_counter(&self) -> u8 {
        self.retry_counter.load(Ordering::SeqCst)
    }

    async fn run_authentication(
        &self,
        request: AuthenticateRequest,
        events: &CardEventSender,
    ) -> Result<AuthenticatedSession, CardReaderError> {
        events.state_changed(ReaderState::WaitingForCard);
        events.card_attached_changed(true);

        if let Some(reason) = &self.script.cancel_reason {
            events.card_attached_changed(false);
            return Err(CardReaderError::Cancelled {
                reason: reason.clone(),
            });
        }

        if !request.use_simulator_card {
            let mut is_retry = false;
            loop {
                let attempts_remaining = self.retry_counter();
                if attempts_remaining == 0 {
                    return Err(CardReaderError::Failed("card PIN blocked".to_string()));
                }
                events.state_changed(ReaderState::PinRequested);
                let pin = events
                    .request_pin(PinRequest {
                        attempts_remaining: Some(attempts_remaining),
                        is_retry,
                    })
                    .await?;
                if pin.expose_secret() == self.script.card_pin {
                    self.retry_counter
                        .store(self.script.retry_counter, Ordering::SeqCst);
                    break;
                }
                self.retry_counter.fetch_sub(1, Ordering::SeqCst);
                is_retry = true;
            }
        }

        events.state_changed(ReaderState::Authenticating);
        for progress in [25, 50, 75, 100] {
            events.status_progress(progress);
            tokio::task::yield_now().await;
        }
        events.state_changed(ReaderState::Completed);

        Ok(AuthenticatedSession {
            session_id: request.session.id,
            authorization_code: format!("code-{}", Uuid::new_v4().simple()),
        })
    }
}

impl CardReader for SimulatedCardReader {
    async fn initialize(
        &self,
        options: &InitializeOptions,
    ) -> Result<SessionStart, CardReaderError> {
        self.initialize_calls.fetch_add(1, Ordering::SeqCst);
        if !self.script.initialize_delay.is_zero() {
            tokio::time::sleep(self.script.initialize_delay).await;
        }
        if let Some(error) = &self.script.initialize_failure {
            return Err(error.clone());
        }

        let id = Uuid::new_v4();
        Ok(SessionStart {
            access_rights: AccessRights::new(self.script.access_rights.clone()),
            continuation: CardSession {
                id,
                continuation: format!("{}/tc-token/{id}", options.issuer_url),
            },
        })
    }

    async fn authenticate(
        &self,
        request: AuthenticateRequest,
        events: CardEventSender,
    ) -> Result<AuthenticatedSession, CardReaderError> {
        self.authenticate_calls.fetch_add(1, Ordering::SeqCst);
        tokio::select! {
            result = self.run_authentication(request, &events) => result,
            () = self.cancelled.notified() => Err(CardReaderError::Cancelled {
                reason: USER_CANCELLED_REASON.to_string(),
            }),
        }
    }

    async fn interrupt(&self) -> Result<(), CardReaderError> {
        self.interrupt_calls.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn cancel(&self) -> Result<(), CardReaderError> {
        self.cancel_calls.fetch_add(1, Ordering::SeqCst);
        self.cancelled.notify_waiters();
        if self.script.cancel_fails {
            return Err(CardReaderError::Unavailable("no scan in progress".to_string()));
        }
        Ok(())
    }
}

// =============================================================================
// Issuance Client
// =============================================================================

/// Behavior of a [`MemoryIssuanceClient`].
#[derive(Debug, Clone)]
pub struct IssuerScript {
    /// Credentials issued per format.
    pub batch_size: usize,
    /// Claims disclosed by the credentials.
    pub claims: BTreeMap<String, String>,
    /// When set, the token exchange fails with this error.
    pub token_failure: Option<IssuanceError>,
    /// Failures returned by consecutive retrievals before they succeed.
    pub retrieve_failures: VecDeque<IssuanceError>,
    /// Failures returned by consecutive refills before they succeed.
    pub refill_failures: VecDeque<IssuanceError>,
}

impl Default for IssuerScript {
    fn default() -> Self {
        Self {
            batch_size: 3,
            claims: BTreeMap::from([
                (GIVEN_NAME_CLAIM.to_string(), "ERIKA".to_string()),
                (FAMILY_NAME_CLAIM.to_string(), "MUSTERMANN".to_string()),
                ("nationality".to_string(), "DE".to_string()),
            ]),
            token_failure: None,
            retrieve_failures: VecDeque::new(),
            refill_failures: VecDeque::new(),
        }
    }
}

#[derive(Serialize)]
struct SimulatedCredential<'a> {
    format: CredentialFormat,
    holder: Option<Uuid>,
    serial: u64,
    claims: &'a BTreeMap<String, String>,
}

/// An in-memory PID issuer.
///
/// Credentials are base64url encoded JSON documents carrying the claims, the holder binding
/// and a serial number.
#[derive(Debug)]
pub struct MemoryIssuanceClient {
    batch_size: usize,
    claims: BTreeMap<String, String>,
    token_failure: Option<IssuanceError>,
    retrieve_failures: Mutex<VecDeque<IssuanceError>>,
    refill_failures: Mutex<VecDeque<IssuanceError>>,
    tokens: Mutex<HashSet<String>>,
    serial: AtomicU64,
    refill_calls: AtomicUsize,
}

impl Default for MemoryIssuanceClient {
    fn default() -> Self {
        Self::new(IssuerScript::default())
    }
}

impl MemoryIssuanceClient {
    /// Creates an issuer following `script`.
    #[must_use]
    pub fn new(script: IssuerScript) -> Self {
        Self {
            batch_size: script.batch_size,
            claims: script.claims,
            token_failure: script.token_failure,
            retrieve_failures: Mutex::new(script.retrieve_failures),
            refill_failures: Mutex::new(script.refill_failures),
            tokens: Mutex::new(HashSet::new()),
            serial: AtomicU64::new(0),
            refill_calls: AtomicUsize::new(0),
        }
    }

    /// Number of refill requests received.
    #[must_use]
    pub fn refill_calls(&self) -> usize {
        self.refill_calls.load(Ordering::SeqCst)
    }

    fn encode(&self, format: CredentialFormat, holder: Option<Uuid>) -> EncodedCredential {
        let document = SimulatedCredential {
            format,
            holder,
            serial: self.serial.fetch_add(1, Ordering::SeqCst),
            claims: &self.claims,
        };
        let json = serde_json::to_vec(&document).unwrap_or_default();
        EncodedCredential::new(URL_SAFE_NO_PAD.encode(json))
    }
}

impl IssuanceClient for MemoryIssuanceClient {
    async fn acquire_access_token(
        &self,
        session: &AuthenticatedSession,
    ) -> Result<AccessToken, IssuanceError> {
        if let Some(error) = &self.token_failure {
            return Err(error.clone());
        }
        let value = format!("at-{}-{}", session.session_id.simple(), Uuid::new_v4().simple());
        lock(&self.tokens).insert(value.clone());
        Ok(AccessToken::new(SecretString::from(value)))
    }

    async fn retrieve_credentials(
        &self,
        token: &AccessToken,
        wallet: &WalletAgent,
        formats: &[CredentialFormat],
    ) -> Result<Vec<IssuedCredential>, IssuanceError> {
        if let Some(error) = lock(&self.retrieve_failures).pop_front() {
            return Err(error);
        }
        if !lock(&self.tokens).contains(token.value().expose_secret()) {
            return Err(IssuanceError::Issuer("invalid_token".to_string()));
        }

        Ok(formats
            .iter()
            .map(|&format| IssuedCredential {
                format,
                credentials: (0..self.batch_size)
                    .map(|_| self.encode(format, Some(wallet.id())))
                    .collect(),
                claims: self.claims.clone(),
            })
            .collect())
    }
}

impl BatchRefill for MemoryIssuanceClient {
    async fn refill(
        &self,
        format: CredentialFormat,
        count: usize,
    ) -> Result<Vec<EncodedCredential>, IssuanceError> {
        self.refill_calls.fetch_add(1, Ordering::SeqCst);
        if let Some(error) = lock(&self.refill_failures).pop_front() {
            return Err(error);
        }
        Ok((0..count).map(|_| self.encode(format, None)).collect())
    }
}

// =============================================================================
// Secure Unlock
// =============================================================================

#[derive(Debug)]
struct UnlockSlot {
    state: SecureUnlockState,
    key: Option<Zeroizing<[u8; 32]>>,
}

/// In-memory secure unlock.
///
/// **FOR TESTING ONLY**: the wallet key is random and kept in plain memory.
#[derive(Debug)]
pub struct MemorySecureUnlock {
    slot: Mutex<UnlockSlot>,
}

impl Default for MemorySecureUnlock {
    fn default() -> Self {
        Self::new()
    }
}

impl MemorySecureUnlock {
    /// Creates an unconfigured store.
    #[must_use]
    pub fn new() -> Self {
        Self::with_state(SecureUnlockState::NotConfigured)
    }

    /// Creates a store in `state`, without a key.
    #[must_use]
    pub fn with_state(state: SecureUnlockState) -> Self {
        Self {
            slot: Mutex::new(UnlockSlot { state, key: None }),
        }
    }

    fn invalid(state: SecureUnlockState, expected: SecureUnlockState) -> UnlockError {
        UnlockError::InvalidState { state, expected }
    }
}

impl SecureUnlock for MemorySecureUnlock {
    fn state(&self) -> SecureUnlockState {
        lock(&self.slot).state
    }

    fn setup(&self, _pin: SecretString) -> Result<(), UnlockError> {
        let mut slot = lock(&self.slot);
        if slot.state != SecureUnlockState::NotConfigured {
            return Err(Self::invalid(slot.state, SecureUnlockState::NotConfigured));
        }
        let mut key = Zeroizing::new([0u8; 32]);
        key[..16].copy_from_slice(Uuid::new_v4().as_bytes());
        key[16..].copy_from_slice(Uuid::new_v4().as_bytes());
        slot.key = Some(key);
        slot.state = SecureUnlockState::AcquiredWalletKey;
        Ok(())
    }

    fn wallet_key(&self) -> Result<WalletKey, UnlockError> {
        let slot = lock(&self.slot);
        match (slot.state, slot.key.as_deref()) {
            (SecureUnlockState::AcquiredWalletKey | SecureUnlockState::Unlocked, Some(key)) => {
                Ok(WalletKey::new(*key))
            }
            (state, _) => Err(Self::invalid(state, SecureUnlockState::Unlocked)),
        }
    }

    fn finish_setup(&self) -> Result<(), UnlockError> {
        let mut slot = lock(&self.slot);
        if slot.state != SecureUnlockState::AcquiredWalletKey {
            return Err(Self::invalid(
                slot.state,
                SecureUnlockState::AcquiredWalletKey,
            ));
        }
        slot.state = SecureUnlockState::Unlocked;
        Ok(())
    }

    fn reset(&self) -> Result<(), UnlockError> {
        let mut slot = lock(&self.slot);
        slot.key = None;
        slot.state = SecureUnlockState::NotConfigured;
        Ok(())
    }
}

// =============================================================================
// Credential Repository
// =============================================================================

/// In-memory credential repository.
#[derive(Debug, Default)]
pub struct MemoryCredentialRepository {
    records: Mutex<HashMap<Uuid, CredentialRecord>>,
    failing: AtomicBool,
}

impl MemoryCredentialRepository {
    /// Creates an empty repository.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// The stored record with `id`.
    #[must_use]
    pub fn get(&self, id: Uuid) -> Option<CredentialRecord> {
        lock(&self.records).get(&id).cloned()
    }

    /// Makes every subsequent call fail.
    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    fn check_backend(&self) -> Result<(), RepositoryError> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(RepositoryError::Backend("storage unavailable".to_string()));
        }
        Ok(())
    }
}

impl CredentialRepository for MemoryCredentialRepository {
    fn save(&self, record: &CredentialRecord) -> Result<(), RepositoryError> {
        self.check_backend()?;
        lock(&self.records).insert(record.id, record.clone());
        Ok(())
    }

    fn append_batch(
        &self,
        record_id: Uuid,
        credentials: Vec<EncodedCredential>,
    ) -> Result<(), RepositoryError> {
        self.check_backend()?;
        let mut records = lock(&self.records);
        let record = records
            .get_mut(&record_id)
            .ok_or(RepositoryError::NotFound(record_id))?;
        record
            .batch
            .get_or_insert_with(Default::default)
            .additional_credentials
            .extend(credentials);
        Ok(())
    }
}

// =============================================================================
// Notifier
// =============================================================================

/// Notifier that records every toast.
#[derive(Debug, Default)]
pub struct RecordingNotifier {
    toasts: Mutex<Vec<String>>,
}

impl RecordingNotifier {
    /// Creates a notifier with no toasts.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Toasts shown so far, oldest first.
    #[must_use]
    pub fn toasts(&self) -> Vec<String> {
        lock(&self.toasts).clone()
    }
}

impl Notifier for RecordingNotifier {
    fn show_toast(&self, message: &str) {
        lock(&self.toasts).push(message.to_string());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::platform::{card_event_channel, CardEvent};

    #[tokio::test]
    async fn test_reader_accepts_correct_pin() {
        let reader = SimulatedCardReader::default();
        let start = reader
            .initialize(&InitializeOptions::pid("https://issuer.example"))
            .await
            .unwrap();
        assert_eq!(start.access_rights.len(), 6);

        let (sender, mut receiver) = card_event_channel();
        let request = AuthenticateRequest {
            session: start.continuation,
            use_simulator_card: false,
        };
        let authentication = tokio::spawn(async move { reader.authenticate(request, sender).await });

        while let Some(event) = receiver.recv().await {
            if let CardEvent::EnterPin { responder, .. } = event {
                responder
                    .resolve(SecretString::from("123456".to_string()))
                    .unwrap();
            }
        }
        assert!(authentication.await.unwrap().is_ok());
    }

    #[tokio::test]
    async fn test_reader_blocks_after_retry_counter() {
        let reader = SimulatedCardReader::new(CardScript {
            retry_counter: 2,
            ..CardScript::default()
        });
        let start = reader
            .initialize(&InitializeOptions::pid("https://issuer.example"))
            .await
            .unwrap();
        let (sender, mut receiver) = card_event_channel();
        let request = AuthenticateRequest {
            session: start.continuation,
            use_simulator_card: false,
        };

        let answer = async {
            while let Some(event) = receiver.recv().await {
                if let CardEvent::EnterPin { responder, .. } = event {
                    responder
                        .resolve(SecretString::from("000000".to_string()))
                        .unwrap();
                }
            }
        };
        let (result, ()) = tokio::join!(reader.authenticate(request, sender), answer);

        assert_eq!(
            result.unwrap_err(),
            CardReaderError::Failed("card PIN blocked".to_string())
        );
        assert_eq!(reader.retry_counter(), 0);
    }

    #[test]
    fn test_secure_unlock_setup() {
        let unlock = MemorySecureUnlock::new();
        assert!(unlock.wallet_key().is_err());
        unlock
            .setup(SecretString::from("135790".to_string()))
            .unwrap();
        assert_eq!(unlock.state(), SecureUnlockState::AcquiredWalletKey);
        let key = unlock.wallet_key().unwrap();
        unlock.finish_setup().unwrap();
        assert_eq!(unlock.wallet_key().unwrap().expose(), key.expose());
        assert!(unlock
            .setup(SecretString::from("135790".to_string()))
            .is_err());
    }

    #[tokio::test]
    async fn test_issuer_rejects_unknown_token() {
        let issuer = MemoryIssuanceClient::default();
        let unlock = std::sync::Arc::new(MemorySecureUnlock::new());
        let wallet = crate::wallet::WalletSession::new(unlock);
        let agent = wallet
            .establish(SecretString::from("135790".to_string()))
            .unwrap();

        let token = AccessToken::new(SecretString::from("forged".to_string()));
        let err = issuer
            .retrieve_credentials(&token, &agent, &[CredentialFormat::SdJwtVc])
            .await
            .unwrap_err();
        assert_eq!(err, IssuanceError::Issuer("invalid_token".to_string()));
    }

    #[test]
    fn test_repository_append_requires_record() {
        let repository = MemoryCredentialRepository::new();
        let id = Uuid::new_v4();
        assert_eq!(
            repository.append_batch(id, vec![]).unwrap_err(),
            RepositoryError::NotFound(id)
        );
    }
}

//! Common test utilities shared across integration tests.

use std::sync::Arc;

use pidkit_core::platform::memory::{
    CardScript, IssuerScript, MemoryIssuanceClient, MemorySecureUnlock, RecordingNotifier,
    SimulatedCardReader,
};
use pidkit_core::platform::InitializeOptions;
use pidkit_core::{AcquisitionEvent, DevicePlatform, FlowConfig, PidOrchestrator, StepId};
use secrecy::SecretString;
use tokio::sync::broadcast;

pub const WALLET_PIN: &str = "135790";
pub const CARD_PIN: &str = "123456";
pub const WRONG_CARD_PIN: &str = "654321";

pub type Orchestrator = PidOrchestrator<SimulatedCardReader, MemoryIssuanceClient>;

pub struct Flow {
    pub orchestrator: Arc<Orchestrator>,
    pub reader: Arc<SimulatedCardReader>,
    pub issuer: Arc<MemoryIssuanceClient>,
    pub unlock: Arc<MemorySecureUnlock>,
    pub notifier: Arc<RecordingNotifier>,
}

#[allow(dead_code, reason = "used in tests")]
pub fn flow_with(config: FlowConfig, card: CardScript, issuer: IssuerScript) -> Flow {
    let reader = Arc::new(SimulatedCardReader::new(card));
    let issuer = Arc::new(MemoryIssuanceClient::new(issuer));
    let unlock = Arc::new(MemorySecureUnlock::new());
    let notifier = Arc::new(RecordingNotifier::new());
    let orchestrator = Arc::new(PidOrchestrator::new(
        config,
        InitializeOptions::pid("https://issuer.example"),
        Arc::clone(&reader),
        Arc::clone(&issuer),
        unlock.clone(),
        notifier.clone(),
    ));
    Flow {
        orchestrator,
        reader,
        issuer,
        unlock,
        notifier,
    }
}

#[allow(dead_code, reason = "used in tests")]
pub fn flow(platform: DevicePlatform) -> Flow {
    flow_with(
        FlowConfig::new(platform),
        CardScript::default(),
        IssuerScript::default(),
    )
}

#[allow(dead_code, reason = "used in tests")]
pub fn secret(pin: &str) -> SecretString {
    SecretString::from(pin.to_string())
}

/// Sets up the wallet PIN, leaving the flow on `data-protection`.
#[allow(dead_code, reason = "used in tests")]
pub async fn through_wallet_pin(flow: &Flow) {
    let orchestrator = &flow.orchestrator;
    assert_eq!(
        orchestrator.submit_wallet_pin(secret(WALLET_PIN)).await.unwrap(),
        StepId::PinReentry
    );
    assert_eq!(
        orchestrator.submit_wallet_pin(secret(WALLET_PIN)).await.unwrap(),
        StepId::DataProtection
    );
}

/// Opens the card session and accepts the access rights, leaving the flow on `id-card-pin`.
#[allow(dead_code, reason = "used in tests")]
pub async fn to_card_pin(flow: &Flow) {
    through_wallet_pin(flow).await;
    let orchestrator = &flow.orchestrator;
    assert_eq!(
        orchestrator.advance().await.unwrap(),
        StepId::IdCardRequestedAttributes
    );
    assert_eq!(orchestrator.advance().await.unwrap(), StepId::IdCardPin);
}

/// Runs the whole acquisition with the correct card PIN.
#[allow(dead_code, reason = "used in tests")]
pub async fn to_success(flow: &Flow) {
    to_card_pin(flow).await;
    let orchestrator = &flow.orchestrator;
    assert_eq!(
        orchestrator.submit_card_pin(secret(CARD_PIN)).await.unwrap(),
        StepId::IdCardScan
    );
    assert_eq!(orchestrator.advance().await.unwrap(), StepId::IdCardFetch);
    assert_eq!(orchestrator.advance().await.unwrap(), StepId::Success);
}

/// Waits for the next PIN re-entry request and returns its remaining attempts.
#[allow(dead_code, reason = "used in tests")]
pub async fn next_reentry(events: &mut broadcast::Receiver<AcquisitionEvent>) -> Option<u8> {
    loop {
        if let AcquisitionEvent::CardPinReentryRequested { attempts_remaining } =
            events.recv().await.unwrap()
        {
            return attempts_remaining;
        }
    }
}

mod common;

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use common::{
    flow, flow_with, next_reentry, secret, through_wallet_pin, to_card_pin, to_success,
    CARD_PIN, WALLET_PIN, WRONG_CARD_PIN,
};
use pidkit_core::platform::memory::{CardScript, IssuerScript};
use pidkit_core::platform::{IssuanceError, SecureUnlock, SecureUnlockState};
use pidkit_core::{
    AcquisitionState, DevicePlatform, FlowConfig, PidKitError, ScanPhase, StepId,
    GENERIC_FAILURE_MESSAGE,
};
use test_case::test_case;
use tokio::time::Instant;

#[tokio::test(start_paused = true)]
async fn test_full_acquisition() {
    let flow = flow(DevicePlatform::Ios);
    let orchestrator = &flow.orchestrator;

    through_wallet_pin(&flow).await;
    assert_eq!(flow.unlock.state(), SecureUnlockState::Unlocked);
    assert!(orchestrator.has_wallet_agent());

    assert_eq!(
        orchestrator.advance().await.unwrap(),
        StepId::IdCardRequestedAttributes
    );
    assert_eq!(orchestrator.access_rights().unwrap().len(), 6);
    assert_eq!(orchestrator.advance().await.unwrap(), StepId::IdCardPin);

    assert_eq!(
        orchestrator.submit_card_pin(secret(CARD_PIN)).await.unwrap(),
        StepId::IdCardScan
    );
    assert_eq!(orchestrator.advance().await.unwrap(), StepId::IdCardFetch);
    assert!(!orchestrator.has_card_pin());
    assert_eq!(
        orchestrator.acquisition_state(),
        AcquisitionState::RetrieveCredential
    );

    let started = Instant::now();
    assert_eq!(orchestrator.advance().await.unwrap(), StepId::Success);
    assert!(started.elapsed() >= Duration::from_millis(500));

    let state = orchestrator.flow_state();
    assert_eq!(state.displayed_progress, 100);
    assert!(state.completed);
    assert_eq!(orchestrator.acquisition_state(), AcquisitionState::Done);
    assert_eq!(
        orchestrator.holder_name().as_deref(),
        Some("ERIKA MUSTERMANN")
    );
    assert_eq!(orchestrator.credentials().len(), 2);
    assert!(flow.notifier.toasts().is_empty());
}

#[tokio::test]
async fn test_wallet_pin_mismatch_restarts_setup() {
    let flow = flow(DevicePlatform::Android);
    let orchestrator = &flow.orchestrator;

    assert_eq!(
        orchestrator.submit_wallet_pin(secret("123456")).await.unwrap(),
        StepId::PinReentry
    );
    let err = orchestrator
        .submit_wallet_pin(secret("123455"))
        .await
        .unwrap_err();
    assert_eq!(err, PidKitError::PinMismatch);

    assert_eq!(orchestrator.current_step(), StepId::Pin);
    assert!(!orchestrator.has_wallet_pin());
    assert!(!orchestrator.has_wallet_agent());
    assert_eq!(flow.unlock.state(), SecureUnlockState::NotConfigured);
    assert_eq!(
        flow.notifier.toasts(),
        vec!["The PINs do not match. Please choose your PIN again.".to_string()]
    );

    through_wallet_pin(&flow).await;
    assert!(orchestrator.has_wallet_agent());
}

#[tokio::test]
async fn test_malformed_wallet_pin_is_rejected_in_place() {
    let flow = flow(DevicePlatform::Ios);
    let orchestrator = &flow.orchestrator;

    let err = orchestrator
        .submit_wallet_pin(secret("12a456"))
        .await
        .unwrap_err();
    assert!(matches!(err, PidKitError::InvalidInput { .. }));
    assert_eq!(orchestrator.current_step(), StepId::Pin);
    assert!(flow.notifier.toasts().is_empty());
}

#[tokio::test]
async fn test_operations_outside_their_step_are_rejected() {
    let flow = flow(DevicePlatform::Ios);
    let orchestrator = &flow.orchestrator;

    assert!(matches!(
        orchestrator.advance().await,
        Err(PidKitError::InvalidInput { .. })
    ));
    assert!(matches!(
        orchestrator.submit_card_pin(secret(CARD_PIN)).await,
        Err(PidKitError::InvalidInput { .. })
    ));

    to_card_pin(&flow).await;
    assert!(matches!(
        orchestrator.submit_wallet_pin(secret(WALLET_PIN)).await,
        Err(PidKitError::InvalidInput { .. })
    ));
    // the card PIN has to be submitted before the scan
    assert!(matches!(
        orchestrator.advance().await,
        Err(PidKitError::InvalidInput { .. })
    ));
    assert_eq!(orchestrator.current_step(), StepId::IdCardPin);
    assert!(flow.notifier.toasts().is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_concurrent_advance_opens_one_session() {
    let flow = flow_with(
        FlowConfig::new(DevicePlatform::Android),
        CardScript {
            initialize_delay: Duration::from_millis(200),
            ..CardScript::default()
        },
        IssuerScript::default(),
    );
    through_wallet_pin(&flow).await;
    let orchestrator = &flow.orchestrator;

    let (first, second) = tokio::join!(orchestrator.advance(), orchestrator.advance());
    let mut steps = [first.unwrap(), second.unwrap()];
    steps.sort_by_key(ToString::to_string);
    assert_eq!(
        steps,
        [StepId::DataProtection, StepId::IdCardRequestedAttributes]
    );
    assert_eq!(flow.reader.calls().initialize, 1);
    assert_eq!(orchestrator.current_step(), StepId::IdCardRequestedAttributes);
}

#[tokio::test(start_paused = true)]
async fn test_double_tap_on_scan_reads_card_once() {
    let flow = flow(DevicePlatform::Ios);
    to_card_pin(&flow).await;
    let orchestrator = &flow.orchestrator;
    orchestrator.submit_card_pin(secret(CARD_PIN)).await.unwrap();

    let (first, second) = tokio::join!(orchestrator.advance(), orchestrator.advance());
    assert_eq!(first.unwrap(), StepId::IdCardFetch);
    assert_eq!(second.unwrap(), StepId::IdCardScan);
    assert_eq!(flow.reader.calls().authenticate, 1);
    assert_eq!(flow.reader.calls().interrupt, 0);
    assert_eq!(orchestrator.current_step(), StepId::IdCardFetch);
    assert!(flow.notifier.toasts().is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_reentered_pin_waits_for_settle_window() {
    let flow = flow(DevicePlatform::Android);
    to_card_pin(&flow).await;
    let orchestrator = Arc::clone(&flow.orchestrator);
    let mut events = orchestrator.subscribe();

    orchestrator
        .submit_card_pin(secret(WRONG_CARD_PIN))
        .await
        .unwrap();
    let scan = tokio::spawn({
        let orchestrator = Arc::clone(&orchestrator);
        async move { orchestrator.advance().await }
    });

    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(matches!(
        orchestrator.submit_card_pin(secret(CARD_PIN)).await,
        Err(PidKitError::InvalidInput { .. })
    ));
    assert_eq!(orchestrator.current_step(), StepId::IdCardScan);
    assert_eq!(orchestrator.scan_state().phase, ScanPhase::Error);

    assert_eq!(next_reentry(&mut events).await, Some(2));
    assert_eq!(
        orchestrator.submit_card_pin(secret(CARD_PIN)).await.unwrap(),
        StepId::IdCardScan
    );
    assert_eq!(scan.await.unwrap().unwrap(), StepId::IdCardFetch);
    assert!(flow.notifier.toasts().is_empty());
}

#[test_case(DevicePlatform::Ios, 1, 3000 ; "ios interrupts the system sheet")]
#[test_case(DevicePlatform::Android, 0, 1500 ; "android keeps its overlay")]
#[tokio::test(start_paused = true)]
async fn test_wrong_card_pin_is_reentered(
    platform: DevicePlatform,
    interrupts: usize,
    settle_ms: u64,
) {
    let flow = flow(platform);
    to_card_pin(&flow).await;
    let orchestrator = Arc::clone(&flow.orchestrator);
    let mut events = orchestrator.subscribe();

    orchestrator
        .submit_card_pin(secret(WRONG_CARD_PIN))
        .await
        .unwrap();
    let started = Instant::now();
    let scan = tokio::spawn({
        let orchestrator = Arc::clone(&orchestrator);
        async move { orchestrator.advance().await }
    });

    assert_eq!(next_reentry(&mut events).await, Some(2));
    assert!(started.elapsed() >= Duration::from_millis(settle_ms));
    assert_eq!(flow.reader.calls().interrupt, interrupts);
    assert!(!orchestrator.scan_state().modal_visible);
    assert_eq!(orchestrator.current_step(), StepId::IdCardScan);

    assert_eq!(
        orchestrator.submit_card_pin(secret(CARD_PIN)).await.unwrap(),
        StepId::IdCardScan
    );
    assert!(orchestrator.scan_state().modal_visible);
    assert_eq!(scan.await.unwrap().unwrap(), StepId::IdCardFetch);
    assert_eq!(flow.reader.retry_counter(), 3);
    assert!(flow.notifier.toasts().is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_repeated_wrong_pins_block_the_card() {
    let flow = flow(DevicePlatform::Android);
    to_card_pin(&flow).await;
    let orchestrator = Arc::clone(&flow.orchestrator);
    let mut events = orchestrator.subscribe();

    orchestrator
        .submit_card_pin(secret(WRONG_CARD_PIN))
        .await
        .unwrap();
    let scan = tokio::spawn({
        let orchestrator = Arc::clone(&orchestrator);
        async move { orchestrator.advance().await }
    });

    for expected in [Some(2), Some(1)] {
        assert_eq!(next_reentry(&mut events).await, expected);
        orchestrator
            .submit_card_pin(secret(WRONG_CARD_PIN))
            .await
            .unwrap();
    }

    let err = scan.await.unwrap().unwrap_err();
    assert!(matches!(err, PidKitError::IdCard { .. }));
    assert_eq!(orchestrator.current_step(), StepId::DataProtection);
    assert_eq!(orchestrator.acquisition_state(), AcquisitionState::Initializing);
    assert_eq!(
        flow.notifier.toasts(),
        vec![GENERIC_FAILURE_MESSAGE.to_string()]
    );
}

#[tokio::test(start_paused = true)]
async fn test_reset_abandons_pending_reentry() {
    let flow = flow(DevicePlatform::Android);
    to_card_pin(&flow).await;
    let orchestrator = Arc::clone(&flow.orchestrator);
    let mut events = orchestrator.subscribe();

    orchestrator
        .submit_card_pin(secret(WRONG_CARD_PIN))
        .await
        .unwrap();
    let scan = tokio::spawn({
        let orchestrator = Arc::clone(&orchestrator);
        async move { orchestrator.advance().await }
    });
    next_reentry(&mut events).await;

    orchestrator
        .reset(StepId::IdCardPin, None, false)
        .await
        .unwrap();
    assert_eq!(
        scan.await.unwrap().unwrap_err(),
        PidKitError::HardwareCancelled
    );
    assert_eq!(orchestrator.current_step(), StepId::IdCardPin);
    assert!(!orchestrator.has_card_pin());
    assert!(flow.notifier.toasts().is_empty());

    // the stale scan did not trigger a second reset
    assert!(orchestrator.access_rights().is_some());
    assert_eq!(orchestrator.acquisition_state(), AcquisitionState::IdCardAuth);
}

#[tokio::test(start_paused = true)]
async fn test_biometric_cancel_keeps_token() {
    let flow = flow_with(
        FlowConfig::new(DevicePlatform::Ios),
        CardScript::default(),
        IssuerScript {
            retrieve_failures: VecDeque::from([IssuanceError::BiometricCancelled]),
            ..IssuerScript::default()
        },
    );
    to_card_pin(&flow).await;
    let orchestrator = &flow.orchestrator;
    orchestrator.submit_card_pin(secret(CARD_PIN)).await.unwrap();
    orchestrator.advance().await.unwrap();

    assert_eq!(
        orchestrator.advance().await.unwrap_err(),
        PidKitError::BiometricCancelled
    );
    assert_eq!(orchestrator.current_step(), StepId::IdCardFetch);
    assert_eq!(
        orchestrator.acquisition_state(),
        AcquisitionState::RetrieveCredential
    );
    assert_eq!(
        flow.notifier.toasts(),
        vec!["Biometric authentication was cancelled.".to_string()]
    );

    assert_eq!(orchestrator.advance().await.unwrap(), StepId::Success);
}

#[tokio::test(start_paused = true)]
async fn test_biometrics_disabled_detour() {
    let flow = flow_with(
        FlowConfig::new(DevicePlatform::Android),
        CardScript::default(),
        IssuerScript {
            retrieve_failures: VecDeque::from([IssuanceError::BiometricNotEnabled]),
            ..IssuerScript::default()
        },
    );
    to_card_pin(&flow).await;
    let orchestrator = &flow.orchestrator;
    orchestrator.submit_card_pin(secret(CARD_PIN)).await.unwrap();
    orchestrator.advance().await.unwrap();

    assert_eq!(
        orchestrator.advance().await.unwrap_err(),
        PidKitError::BiometricNotEnabled
    );
    assert_eq!(orchestrator.current_step(), StepId::BiometricsDisabled);
    assert!(flow.notifier.toasts().is_empty());

    assert_eq!(orchestrator.advance().await.unwrap(), StepId::IdCardFetch);
    assert_eq!(orchestrator.advance().await.unwrap(), StepId::Success);
}

#[tokio::test(start_paused = true)]
async fn test_issuer_failure_returns_to_data_protection() {
    let flow = flow_with(
        FlowConfig::new(DevicePlatform::Ios),
        CardScript::default(),
        IssuerScript {
            token_failure: Some(IssuanceError::Network {
                status: Some(502),
                error: "bad gateway".to_string(),
            }),
            ..IssuerScript::default()
        },
    );
    to_card_pin(&flow).await;
    let orchestrator = &flow.orchestrator;
    orchestrator.submit_card_pin(secret(CARD_PIN)).await.unwrap();

    let err = orchestrator.advance().await.unwrap_err();
    assert!(matches!(err, PidKitError::NetworkOrIssuer { .. }));
    assert_eq!(orchestrator.current_step(), StepId::DataProtection);
    assert_eq!(orchestrator.flow_state().displayed_progress, 30);
    assert!(orchestrator.has_wallet_agent());
    assert_eq!(
        flow.notifier.toasts(),
        vec![GENERIC_FAILURE_MESSAGE.to_string()]
    );
}

#[tokio::test(start_paused = true)]
async fn test_reset_is_idempotent() {
    let flow = flow(DevicePlatform::Ios);
    to_success(&flow).await;
    let orchestrator = &flow.orchestrator;

    orchestrator
        .reset(StepId::DataProtection, None, false)
        .await
        .unwrap();
    let state = orchestrator.flow_state();
    orchestrator
        .reset(StepId::DataProtection, None, false)
        .await
        .unwrap();

    assert_eq!(orchestrator.flow_state(), state);
    assert_eq!(state.current_step, StepId::DataProtection);
    assert!(!state.completed);
    assert!(orchestrator.has_wallet_agent());
    assert!(orchestrator.access_rights().is_none());
    assert!(orchestrator.credentials().is_empty());
    assert!(flow.notifier.toasts().is_empty());

    // the flow can be run again from the recovery step
    assert_eq!(
        orchestrator.advance().await.unwrap(),
        StepId::IdCardRequestedAttributes
    );
}

#[tokio::test(start_paused = true)]
async fn test_simulator_pin_reaches_the_card_when_not_allowed() {
    let flow = flow(DevicePlatform::Android);
    to_card_pin(&flow).await;
    let orchestrator = Arc::clone(&flow.orchestrator);
    let mut events = orchestrator.subscribe();

    orchestrator
        .submit_card_pin(secret(pidkit_core::SIMULATOR_CARD_PIN))
        .await
        .unwrap();
    let scan = tokio::spawn({
        let orchestrator = Arc::clone(&orchestrator);
        async move { orchestrator.advance().await }
    });

    assert_eq!(next_reentry(&mut events).await, Some(2));
    assert_eq!(flow.reader.retry_counter(), 2);

    orchestrator.cancel().await;
    assert_eq!(scan.await.unwrap().unwrap_err(), PidKitError::UserCancelled);
    assert_eq!(orchestrator.current_step(), StepId::DataProtection);
}

#[cfg(feature = "simulator-card")]
#[tokio::test(start_paused = true)]
async fn test_simulator_pin_skips_the_card_when_allowed() {
    let config = FlowConfig {
        allow_simulator_card: true,
        ..FlowConfig::new(DevicePlatform::Ios)
    };
    let flow = flow_with(config, CardScript::default(), IssuerScript::default());
    to_card_pin(&flow).await;
    let orchestrator = &flow.orchestrator;

    orchestrator
        .submit_card_pin(secret(pidkit_core::SIMULATOR_CARD_PIN))
        .await
        .unwrap();
    assert_eq!(orchestrator.advance().await.unwrap(), StepId::IdCardFetch);
    assert_eq!(flow.reader.retry_counter(), 3);
    assert_eq!(flow.reader.calls().interrupt, 0);
}

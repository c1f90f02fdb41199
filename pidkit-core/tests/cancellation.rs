mod common;

use std::sync::{Arc, Mutex, OnceLock};

use common::{flow, flow_with, secret, to_card_pin, CARD_PIN};
use pidkit_core::logger::{set_logger, LogLevel, Logger};
use pidkit_core::platform::memory::{CardScript, IssuerScript};
use pidkit_core::platform::{CANCELLED_REASON, USER_CANCELLED_REASON};
use pidkit_core::{AcquisitionState, DevicePlatform, FlowConfig, PidKitError, StepId};
use test_case::test_case;

#[derive(Default)]
struct CapturingLogger {
    records: Mutex<Vec<(LogLevel, String)>>,
}

impl Logger for CapturingLogger {
    fn log(&self, level: LogLevel, message: String) {
        self.records.lock().unwrap().push((level, message));
    }
}

fn logger() -> &'static Arc<CapturingLogger> {
    static LOGGER: OnceLock<Arc<CapturingLogger>> = OnceLock::new();
    LOGGER.get_or_init(|| {
        let logger = Arc::new(CapturingLogger::default());
        set_logger(logger.clone());
        logger
    })
}

fn errors_mentioning(needle: &str) -> Vec<String> {
    logger()
        .records
        .lock()
        .unwrap()
        .iter()
        .filter(|(level, message)| *level == LogLevel::Error && message.contains(needle))
        .map(|(_, message)| message.clone())
        .collect()
}

#[test_case(USER_CANCELLED_REASON, PidKitError::UserCancelled ; "user dismissed the scan")]
#[test_case(CANCELLED_REASON, PidKitError::HardwareCancelled ; "reader stopped the scan")]
#[tokio::test]
async fn test_cancelled_scan_returns_to_data_protection(reason: &str, expected: PidKitError) {
    logger();
    let flow = flow_with(
        FlowConfig::new(DevicePlatform::Ios),
        CardScript {
            cancel_reason: Some(reason.to_string()),
            ..CardScript::default()
        },
        IssuerScript::default(),
    );
    to_card_pin(&flow).await;
    let orchestrator = &flow.orchestrator;
    orchestrator.submit_card_pin(secret(CARD_PIN)).await.unwrap();

    assert_eq!(orchestrator.advance().await.unwrap_err(), expected);
    assert_eq!(orchestrator.current_step(), StepId::DataProtection);
    assert_eq!(
        orchestrator.acquisition_state(),
        AcquisitionState::Initializing
    );
    assert_eq!(
        flow.notifier.toasts(),
        vec!["Scanning the ID card was cancelled.".to_string()]
    );
    assert!(errors_mentioning("cancelled").is_empty());
}

#[tokio::test]
async fn test_unknown_cancel_reason_is_a_card_failure() {
    logger();
    let flow = flow_with(
        FlowConfig::new(DevicePlatform::Android),
        CardScript {
            cancel_reason: Some("nfc_tag_lost".to_string()),
            ..CardScript::default()
        },
        IssuerScript::default(),
    );
    to_card_pin(&flow).await;
    let orchestrator = &flow.orchestrator;
    orchestrator.submit_card_pin(secret(CARD_PIN)).await.unwrap();

    let err = orchestrator.advance().await.unwrap_err();
    assert!(matches!(err, PidKitError::IdCard { .. }));
    assert!(!err.is_cancellation());
    assert_eq!(orchestrator.current_step(), StepId::DataProtection);
}

#[tokio::test]
async fn test_cancel_without_scan_is_harmless() {
    logger();
    let flow = flow(DevicePlatform::Ios);
    to_card_pin(&flow).await;
    let orchestrator = &flow.orchestrator;

    orchestrator.cancel().await;
    orchestrator.cancel().await;
    assert_eq!(orchestrator.current_step(), StepId::IdCardPin);
    assert_eq!(flow.reader.calls().cancel, 2);
    assert!(flow.notifier.toasts().is_empty());
}

#[tokio::test]
async fn test_only_invariant_violations_are_logged_as_errors() {
    logger();
    let flow = flow(DevicePlatform::Android);
    to_card_pin(&flow).await;
    let orchestrator = &flow.orchestrator;

    let violation = PidKitError::InvariantViolation("wallet agent missing in test".to_string());
    orchestrator
        .reset(violation.recovery().step, Some(&violation), true)
        .await
        .unwrap();

    assert_eq!(orchestrator.current_step(), StepId::Pin);
    assert!(!orchestrator.has_wallet_agent());
    assert_eq!(errors_mentioning("wallet agent missing in test").len(), 1);
}

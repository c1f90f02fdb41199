use std::path::PathBuf;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;

use clap::{Args, ValueEnum};
use eyre::{bail, WrapErr};
use pidkit_core::platform::memory::{
    CardScript, IssuerScript, MemoryCredentialRepository, MemoryIssuanceClient,
    MemorySecureUnlock, SimulatedCardReader,
};
use pidkit_core::platform::{InitializeOptions, IssuanceError, Notifier};
use pidkit_core::{
    AcquisitionEvent, DevicePlatform, FlowConfig, PidKitError, PidOrchestrator, StepId,
    SIMULATOR_CARD_PIN,
};
use secrecy::SecretString;
use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

const ISSUER_URL: &str = "https://pid-issuer.example";
const WALLET_PIN: &str = "135790";
const CARD_PIN: &str = "123456";
const WRONG_CARD_PIN: &str = "000000";

/// Failed steps tolerated before the simulation gives up.
const MAX_FAILURES: usize = 3;

type Orchestrator = PidOrchestrator<SimulatedCardReader, MemoryIssuanceClient>;

#[derive(Args)]
pub struct SimulateArgs {
    /// Platform whose scan behavior is simulated
    #[arg(long, default_value = "ios")]
    platform: DevicePlatform,

    /// Wrong card PINs entered before the correct one
    #[arg(long, default_value_t = 0)]
    wrong_pin_attempts: u8,

    /// Reason the card reader cancels the scan with once the card is attached
    #[arg(long)]
    cancel_reason: Option<String>,

    /// Fail the first credential retrieval with a biometric error
    #[arg(long, value_enum)]
    biometric_failure: Option<BiometricFailure>,

    /// Credentials issued per format
    #[arg(long, default_value_t = 3)]
    batch_size: usize,

    /// Batch credentials to present per record after the acquisition
    #[arg(long, default_value_t = 2)]
    consume: usize,

    /// Enter the simulator card PIN instead of the card PIN
    #[arg(long)]
    simulator_card: bool,

    /// Flow configuration as JSON; overrides --platform
    #[arg(long, env = "PIDKIT_CONFIG")]
    config: Option<PathBuf>,
}

#[derive(Clone, Copy, ValueEnum)]
enum BiometricFailure {
    Cancelled,
    NotEnabled,
}

impl From<BiometricFailure> for IssuanceError {
    fn from(failure: BiometricFailure) -> Self {
        match failure {
            BiometricFailure::Cancelled => Self::BiometricCancelled,
            BiometricFailure::NotEnabled => Self::BiometricNotEnabled,
        }
    }
}

/// Prints toasts to the console.
struct ConsoleNotifier;

impl Notifier for ConsoleNotifier {
    fn show_toast(&self, message: &str) {
        println!("toast: {message}");
    }
}

/// Card PINs typed by the simulated user: the configured number of wrong ones, then the
/// right one.
struct CardPins {
    wrong_remaining: AtomicU8,
}

impl CardPins {
    fn next(&self) -> SecretString {
        let wrong = self
            .wrong_remaining
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        let pin = if wrong { WRONG_CARD_PIN } else { CARD_PIN };
        SecretString::from(pin.to_string())
    }
}

fn secret(pin: &str) -> SecretString {
    SecretString::from(pin.to_string())
}

async fn load_config(args: &SimulateArgs) -> eyre::Result<FlowConfig> {
    let mut config = match &args.config {
        Some(path) => {
            let json = tokio::fs::read_to_string(path)
                .await
                .wrap_err_with(|| format!("failed to read {}", path.display()))?;
            FlowConfig::from_json(&json)?
        }
        None => FlowConfig::new(args.platform),
    };
    config.allow_simulator_card |= args.simulator_card;
    Ok(config)
}

pub async fn run(args: SimulateArgs) -> eyre::Result<()> {
    let config = load_config(&args).await?;
    info!(platform = %config.platform, "starting simulated PID acquisition");

    let reader = Arc::new(SimulatedCardReader::new(CardScript {
        cancel_reason: args.cancel_reason.clone(),
        ..CardScript::default()
    }));
    let issuer = Arc::new(MemoryIssuanceClient::new(IssuerScript {
        batch_size: args.batch_size,
        retrieve_failures: args
            .biometric_failure
            .map(IssuanceError::from)
            .into_iter()
            .collect(),
        ..IssuerScript::default()
    }));
    let orchestrator = Arc::new(PidOrchestrator::new(
        config,
        InitializeOptions::pid(ISSUER_URL),
        reader,
        issuer,
        Arc::new(MemorySecureUnlock::new()),
        Arc::new(ConsoleNotifier),
    ));
    let pins = Arc::new(CardPins {
        wrong_remaining: AtomicU8::new(args.wrong_pin_attempts),
    });

    let watcher = watch_flow(&orchestrator, &pins);
    let outcome = drive(&orchestrator, &pins, args.simulator_card).await;
    watcher.abort();
    if !outcome? {
        return Ok(());
    }

    let holder = orchestrator.holder_name().unwrap_or_default();
    let credentials = orchestrator.credentials();
    println!(
        "PID issued to {holder}: {} credential records",
        credentials.len()
    );
    present_batches(&orchestrator, args.consume).await
}

/// Logs the acquisition events and answers PIN re-entry requests like a user would.
fn watch_flow(orchestrator: &Arc<Orchestrator>, pins: &Arc<CardPins>) -> JoinHandle<()> {
    let mut events = orchestrator.subscribe();
    let mut scan = orchestrator.subscribe_scan_state();
    let orchestrator = Arc::clone(orchestrator);
    let pins = Arc::clone(pins);

    tokio::spawn(async move {
        loop {
            tokio::select! {
                event = events.recv() => match event {
                    Ok(AcquisitionEvent::CardPinReentryRequested { attempts_remaining }) => {
                        info!(?attempts_remaining, "card asks for the PIN again");
                        if let Err(error) = orchestrator.submit_card_pin(pins.next()).await {
                            warn!(%error, "PIN re-entry failed");
                        }
                    }
                    Ok(event) => debug!(?event, "acquisition event"),
                    Err(RecvError::Lagged(skipped)) => warn!(skipped, "missed acquisition events"),
                    Err(RecvError::Closed) => break,
                },
                changed = scan.changed() => {
                    if changed.is_err() {
                        break;
                    }
                    let state = *scan.borrow_and_update();
                    debug!(?state, "scan state");
                }
            }
        }
    })
}

/// Walks the flow to the success screen. Returns `false` when the user cancelled the scan.
async fn drive(
    orchestrator: &Orchestrator,
    pins: &CardPins,
    simulator_card: bool,
) -> eyre::Result<bool> {
    orchestrator.submit_wallet_pin(secret(WALLET_PIN)).await?;
    orchestrator.submit_wallet_pin(secret(WALLET_PIN)).await?;

    let mut failures = 0;
    loop {
        let step = orchestrator.current_step();
        if step == StepId::Success {
            return Ok(true);
        }

        let result = if step == StepId::IdCardPin {
            let pin = if simulator_card {
                secret(SIMULATOR_CARD_PIN)
            } else {
                pins.next()
            };
            orchestrator.submit_card_pin(pin).await
        } else {
            orchestrator.advance().await
        };

        match result {
            Ok(next) => {
                let progress = orchestrator.flow_state().displayed_progress;
                info!(from = %step, to = %next, progress, "step done");
                if next == StepId::IdCardRequestedAttributes {
                    if let Some(rights) = orchestrator.access_rights() {
                        println!("issuer reads: {}", rights.as_slice().join(", "));
                    }
                }
            }
            Err(error) if error.is_cancellation() => {
                info!(step = %orchestrator.current_step(), "scan cancelled, flow recovered");
                return Ok(false);
            }
            Err(error) => {
                failures += 1;
                warn!(%error, step = %orchestrator.current_step(), "step failed, flow recovered");
                if failures >= MAX_FAILURES {
                    bail!("giving up after {failures} failed steps: {error}");
                }
            }
        }
    }
}

/// Presents batch credentials from every record and waits for the refills they trigger.
async fn present_batches(orchestrator: &Orchestrator, consume: usize) -> eyre::Result<()> {
    let repository = Arc::new(MemoryCredentialRepository::new());
    let pool = orchestrator.batch_pool(repository.clone());
    let mut records = orchestrator.credentials();
    pool.store(&records)?;

    for record in &mut records {
        for _ in 0..consume {
            match pool.consume(record) {
                Ok(consumed) => {
                    info!(
                        record = %record.id,
                        format = %record.format,
                        remaining = record.remaining_batch(),
                        "presented batch credential"
                    );
                    if let Some(refill) = consumed.refill {
                        refill.await.wrap_err("batch refill panicked")?;
                    }
                }
                Err(PidKitError::NoBatchAvailable) => {
                    warn!(record = %record.id, "batch exhausted");
                    break;
                }
                Err(error) => return Err(error.into()),
            }
        }

        let stored = repository
            .get(record.id)
            .map_or(0, |stored| stored.remaining_batch());
        println!("{} {}: {stored} batch credentials left", record.format, record.id);
    }
    Ok(())
}

//! Projection of the contactless hardware events into the scan state shown by the UI.

use tokio::sync::watch;

/// Phase of the contactless scan.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "ffi", derive(uniffi::Enum))]
pub enum ScanPhase {
    /// Waiting for the card to be held against the device.
    #[default]
    ReadyToScan,
    /// The card is attached and being read.
    Scanning,
    /// The card was read successfully.
    Complete,
    /// The scan failed or the PIN was rejected.
    Error,
}

/// State of the contactless scan overlay.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "ffi", derive(uniffi::Record))]
pub struct CardScanState {
    /// Whether a card is attached; `None` when unknown.
    pub attached: Option<bool>,
    /// Read progress, `0..=100`.
    pub progress: u8,
    /// Current phase.
    pub phase: ScanPhase,
    /// Whether the scan overlay is on screen.
    pub modal_visible: bool,
}

/// Event-driven owner of the [`CardScanState`].
///
/// The only automatic phase transition is `ReadyToScan → Scanning` on card attachment;
/// attachment flicker during any other phase leaves the phase alone.
#[derive(Debug)]
pub struct CardScanCoordinator {
    state: watch::Sender<CardScanState>,
}

impl Default for CardScanCoordinator {
    fn default() -> Self {
        Self::new()
    }
}

impl CardScanCoordinator {
    /// Creates a coordinator in the initial state with the overlay hidden.
    #[must_use]
    pub fn new() -> Self {
        let (state, _) = watch::channel(CardScanState::default());
        Self { state }
    }

    /// Snapshot of the current state.
    #[must_use]
    pub fn state(&self) -> CardScanState {
        *self.state.borrow()
    }

    /// Subscribes to state changes.
    #[must_use]
    pub fn subscribe(&self) -> watch::Receiver<CardScanState> {
        self.state.subscribe()
    }

    /// Opens the overlay for a new scan attempt.
    pub fn begin(&self) {
        self.state.send_replace(CardScanState {
            attached: None,
            progress: 0,
            phase: ScanPhase::ReadyToScan,
            modal_visible: true,
        });
    }

    /// Handles a card attachment change.
    pub fn on_attached_changed(&self, attached: bool) {
        self.state.send_modify(|state| {
            state.attached = Some(attached);
            if attached && state.phase == ScanPhase::ReadyToScan {
                state.phase = ScanPhase::Scanning;
            }
        });
    }

    /// Handles a read progress update. Ignored unless scanning.
    pub fn on_progress(&self, progress: u8) {
        self.state.send_if_modified(|state| {
            if state.phase != ScanPhase::Scanning {
                return false;
            }
            state.progress = progress.min(100);
            true
        });
    }

    /// Shows the error overlay.
    pub fn on_error(&self) {
        self.state.send_modify(|state| {
            state.phase = ScanPhase::Error;
            state.modal_visible = true;
            state.attached = None;
        });
    }

    /// Marks the scan as complete.
    pub fn on_complete(&self) {
        self.state.send_modify(|state| {
            state.phase = ScanPhase::Complete;
            state.progress = 100;
        });
    }

    /// Hides the overlay, keeping the phase.
    pub fn dismiss_modal(&self) {
        self.state.send_if_modified(|state| {
            let was_visible = state.modal_visible;
            state.modal_visible = false;
            was_visible
        });
    }

    /// Returns to the initial state.
    pub fn reset(&self) {
        self.state.send_replace(CardScanState::default());
    }
}

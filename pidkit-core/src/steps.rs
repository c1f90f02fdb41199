//! Ordering of the user-facing steps and the cumulative progress shown for them.

use std::collections::HashSet;
use std::sync::Mutex;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use strum::{Display, EnumString};

use crate::{error::PidKitError, sync::lock};

/// Identifier of a user-facing step.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, EnumString, Display,
)]
#[cfg_attr(feature = "ffi", derive(uniffi::Enum))]
#[serde(rename_all = "kebab-case")]
#[strum(serialize_all = "kebab-case")]
pub enum StepId {
    /// Choose the wallet PIN.
    Pin,
    /// Confirm the wallet PIN.
    PinReentry,
    /// Data protection notice; starting the card session.
    DataProtection,
    /// Review of the attributes the issuer reads from the card.
    IdCardRequestedAttributes,
    /// Entry of the card PIN.
    IdCardPin,
    /// Contactless scan of the card.
    IdCardScan,
    /// Retrieval of the credentials from the issuer.
    IdCardFetch,
    /// Recovery screen shown when biometrics are not enabled.
    BiometricsDisabled,
    /// Terminal success screen.
    Success,
}

/// A step of the flow.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Step {
    /// The step identifier.
    pub id: StepId,
    /// Cumulative progress, `0..=100`, shown when the step is reached.
    pub progress_weight: u8,
    /// Alternative steps are skipped when moving forward or backward, but can be addressed
    /// directly with [`StepSequencer::go_to`].
    pub is_alternative: bool,
}

impl Step {
    const fn main(id: StepId, progress_weight: u8) -> Self {
        Self {
            id,
            progress_weight,
            is_alternative: false,
        }
    }

    const fn alternative(id: StepId, progress_weight: u8) -> Self {
        Self {
            id,
            progress_weight,
            is_alternative: true,
        }
    }
}

/// The step sequence of the PID acquisition.
pub const PID_ACQUISITION_STEPS: [Step; 9] = [
    Step::main(StepId::Pin, 10),
    Step::main(StepId::PinReentry, 20),
    Step::main(StepId::DataProtection, 30),
    Step::main(StepId::IdCardRequestedAttributes, 45),
    Step::main(StepId::IdCardPin, 55),
    Step::main(StepId::IdCardScan, 70),
    Step::main(StepId::IdCardFetch, 85),
    Step::alternative(StepId::BiometricsDisabled, 85),
    Step::main(StepId::Success, 100),
];

/// Current position in the flow.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "ffi", derive(uniffi::Record))]
pub struct FlowState {
    /// The step currently shown.
    pub current_step: StepId,
    /// Progress shown to the user, `0..=100`.
    pub displayed_progress: u8,
    /// Whether [`StepSequencer::complete`] has been called.
    pub completed: bool,
}

/// Orders the steps and keeps the displayed progress monotonic.
///
/// `advance` and `back` never lower the displayed progress; [`StepSequencer::go_to`] is the
/// only way to regress it.
#[derive(Debug)]
pub struct StepSequencer {
    steps: Vec<Step>,
    completion_settle: Duration,
    state: Mutex<FlowState>,
}

impl StepSequencer {
    /// Creates a sequencer positioned on the first step.
    ///
    /// # Errors
    ///
    /// Returns [`PidKitError::InvalidInput`] if the sequence is empty, starts with an
    /// alternative step, repeats a step or has a weight above 100.
    pub fn new(steps: Vec<Step>, completion_settle: Duration) -> Result<Self, PidKitError> {
        let invalid = |reason: &str| PidKitError::InvalidInput {
            attribute: "steps".to_string(),
            reason: reason.to_string(),
        };

        let first = steps.first().ok_or_else(|| invalid("sequence is empty"))?;
        if first.is_alternative {
            return Err(invalid("first step must not be an alternative step"));
        }
        let mut seen = HashSet::new();
        for step in &steps {
            if step.progress_weight > 100 {
                return Err(invalid("progress weight above 100"));
            }
            if !seen.insert(step.id) {
                return Err(invalid("duplicate step"));
            }
        }

        Ok(Self::from_validated(steps, completion_settle))
    }

    /// Creates a sequencer for the PID acquisition steps.
    #[must_use]
    pub fn pid_acquisition(completion_settle: Duration) -> Self {
        Self::from_validated(PID_ACQUISITION_STEPS.to_vec(), completion_settle)
    }

    fn from_validated(steps: Vec<Step>, completion_settle: Duration) -> Self {
        let first = steps[0];
        Self {
            steps,
            completion_settle,
            state: Mutex::new(FlowState {
                current_step: first.id,
                displayed_progress: first.progress_weight,
                completed: false,
            }),
        }
    }

    /// All steps, in order.
    #[must_use]
    pub fn steps(&self) -> &[Step] {
        &self.steps
    }

    /// Snapshot of the current position.
    #[must_use]
    pub fn state(&self) -> FlowState {
        *lock(&self.state)
    }

    /// The step currently shown.
    #[must_use]
    pub fn current(&self) -> StepId {
        lock(&self.state).current_step
    }

    /// Index of `id` in the sequence.
    #[must_use]
    pub fn position(&self, id: StepId) -> Option<usize> {
        self.steps.iter().position(|step| step.id == id)
    }

    /// The steps from `id` (inclusive) to the end of the sequence, alternatives included.
    #[must_use]
    pub fn steps_from(&self, id: StepId) -> Vec<StepId> {
        self.position(id)
            .map(|index| self.steps[index..].iter().map(|step| step.id).collect())
            .unwrap_or_default()
    }

    /// Moves to the next non-alternative step. Returns `None` on the last step.
    pub fn advance(&self) -> Option<StepId> {
        let mut state = lock(&self.state);
        let index = self.position(state.current_step)?;
        let next = self.steps[index + 1..]
            .iter()
            .find(|step| !step.is_alternative)?;
        state.current_step = next.id;
        state.displayed_progress = state.displayed_progress.max(next.progress_weight);
        Some(next.id)
    }

    /// Moves to the previous non-alternative step without lowering the displayed progress.
    /// Returns `None` on the first step.
    pub fn back(&self) -> Option<StepId> {
        let mut state = lock(&self.state);
        let index = self.position(state.current_step)?;
        let previous = self.steps[..index]
            .iter()
            .rev()
            .find(|step| !step.is_alternative)?;
        state.current_step = previous.id;
        Some(previous.id)
    }

    /// Jumps directly to `id`, setting the displayed progress to its weight.
    ///
    /// # Errors
    ///
    /// Returns [`PidKitError::InvalidInput`] if `id` is not part of the sequence.
    pub fn go_to(&self, id: StepId) -> Result<(), PidKitError> {
        let step = self
            .position(id)
            .map(|index| self.steps[index])
            .ok_or_else(|| PidKitError::InvalidInput {
                attribute: "step".to_string(),
                reason: format!("{id} is not part of the sequence"),
            })?;
        let mut state = lock(&self.state);
        state.current_step = step.id;
        state.displayed_progress = step.progress_weight;
        state.completed = false;
        Ok(())
    }

    /// Forces the progress to 100 and marks the flow terminal.
    ///
    /// Returns how long the caller must wait before leaving the screen so the progress bar
    /// animation is perceptible; zero when the progress already was at 100.
    pub fn complete(&self) -> Duration {
        let mut state = lock(&self.state);
        let settle = if state.displayed_progress < 100 {
            self.completion_settle
        } else {
            Duration::ZERO
        };
        state.displayed_progress = 100;
        state.completed = true;
        settle
    }
}

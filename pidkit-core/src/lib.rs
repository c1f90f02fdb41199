#![deny(clippy::all, clippy::pedantic, clippy::nursery)]
//! Orchestration core for acquiring a PID (Person Identification Data) credential from a
//! national eID card.
//!
//! The crate wires together the wallet PIN setup, the contactless card authentication (with the
//! card PIN and its wrong-PIN re-entry loop), the access token exchange and the batch credential
//! retrieval. Hardware and protocol details stay behind the collaborator traits in [`platform`];
//! everything the host UI needs is reachable from [`PidOrchestrator`].
//!
//! ```rust,ignore
//! let orchestrator = Arc::new(PidOrchestrator::new(
//!     FlowConfig::new(DevicePlatform::Ios),
//!     InitializeOptions::pid("https://issuer.example"),
//!     reader,
//!     issuer,
//!     secure_unlock,
//!     notifier,
//! ));
//!
//! orchestrator.submit_wallet_pin("135790".to_string().into()).await?;
//! orchestrator.submit_wallet_pin("135790".to_string().into()).await?;
//! orchestrator.advance().await?; // data-protection -> id-card-requested-attributes
//! ```

use std::time::Duration;

use serde::{Deserialize, Serialize};
use strum::{Display, EnumString};

/// Settle window on iOS between the wrong-PIN error overlay and the PIN re-entry screen.
///
/// Covers the system NFC sheet dismissal after the explicit interrupt; the sheet and the
/// keyboard must never be on screen together.
pub const IOS_PIN_REENTRY_SETTLE_WINDOW: Duration = Duration::from_millis(3000);

/// Settle window on Android between the wrong-PIN error overlay and the PIN re-entry screen.
pub const ANDROID_PIN_REENTRY_SETTLE_WINDOW: Duration = Duration::from_millis(1500);

/// The device platform the host app runs on.
///
/// Contactless scanning differs between platforms: iOS shows a system sheet that has to be
/// interrupted explicitly, Android renders an in-app overlay that stays open.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, EnumString, Display,
)]
#[cfg_attr(feature = "ffi", derive(uniffi::Enum))]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum DevicePlatform {
    /// Apple iOS.
    Ios,
    /// Google Android.
    Android,
}

impl DevicePlatform {
    /// Minimum time between showing the wrong-PIN error overlay and surfacing the PIN
    /// re-entry screen.
    #[must_use]
    pub const fn pin_reentry_settle_window(self) -> Duration {
        match self {
            Self::Ios => IOS_PIN_REENTRY_SETTLE_WINDOW,
            Self::Android => ANDROID_PIN_REENTRY_SETTLE_WINDOW,
        }
    }

    /// Whether the card reader needs an explicit interrupt after a rejected PIN.
    #[must_use]
    pub const fn interrupts_on_wrong_pin(self) -> bool {
        matches!(self, Self::Ios)
    }
}

mod acquisition;
pub use acquisition::*;

mod batch;
pub use batch::*;

mod card_scan;
pub use card_scan::*;

mod config;
pub use config::*;

mod credential;
pub use credential::*;

mod error;
pub use error::*;

pub mod logger;

mod orchestrator;
pub use orchestrator::*;

mod pin;
pub use pin::*;

pub mod platform;

mod reset;
pub use reset::*;

mod steps;
pub use steps::*;

mod wallet;
pub use wallet::*;

// private modules
mod sync;

#[cfg(feature = "ffi")]
uniffi::setup_scaffolding!("pidkit_core");

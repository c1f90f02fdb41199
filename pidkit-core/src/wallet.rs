//! The wallet agent: the holder identity credentials are bound to.

use std::sync::{Arc, Mutex};

use secrecy::SecretString;
use uuid::Uuid;

use crate::{
    error::PidKitError,
    platform::{SecureUnlock, SecureUnlockState, WalletKey},
    sync::lock,
};

/// Handle to the unlocked wallet, passed to the issuer for key binding.
#[derive(Debug, Clone)]
pub struct WalletAgent {
    id: Uuid,
    key: Arc<WalletKey>,
}

impl WalletAgent {
    /// Identifier of this agent instance.
    #[must_use]
    pub const fn id(&self) -> Uuid {
        self.id
    }

    /// The wallet key used for proof of possession.
    #[must_use]
    pub fn key(&self) -> &WalletKey {
        &self.key
    }
}

/// Establishes and holds the wallet agent.
pub struct WalletSession {
    unlock: Arc<dyn SecureUnlock>,
    agent: Mutex<Option<WalletAgent>>,
}

impl WalletSession {
    /// Creates a session without an agent.
    #[must_use]
    pub fn new(unlock: Arc<dyn SecureUnlock>) -> Self {
        Self {
            unlock,
            agent: Mutex::new(None),
        }
    }

    /// Sets up the secure unlock with the confirmed wallet PIN and opens the wallet agent.
    ///
    /// If the agent cannot be opened after a successful setup, the setup is rolled back so
    /// the PIN can be chosen again.
    ///
    /// # Errors
    ///
    /// Returns [`PidKitError::InvariantViolation`] if the secure unlock is still initializing,
    /// locked, or does not reach [`SecureUnlockState::AcquiredWalletKey`] after setup.
    pub fn establish(&self, pin: SecretString) -> Result<WalletAgent, PidKitError> {
        let state = self.unlock.state();
        if matches!(
            state,
            SecureUnlockState::Initializing | SecureUnlockState::Locked
        ) {
            return Err(PidKitError::InvariantViolation(format!(
                "cannot set up the wallet while secure unlock is {state:?}"
            )));
        }

        self.unlock.setup(pin)?;
        self.open_agent().inspect_err(|_| {
            if let Err(error) = self.unlock.reset() {
                log::warn!("failed to roll back the wallet setup: {error}");
            }
        })
    }

    fn open_agent(&self) -> Result<WalletAgent, PidKitError> {
        let state = self.unlock.state();
        if state != SecureUnlockState::AcquiredWalletKey {
            return Err(PidKitError::InvariantViolation(format!(
                "secure unlock is {state:?} after setup, expected AcquiredWalletKey"
            )));
        }

        let key = self.unlock.wallet_key()?;
        self.unlock.finish_setup()?;

        let agent = WalletAgent {
            id: Uuid::new_v4(),
            key: Arc::new(key),
        };
        *lock(&self.agent) = Some(agent.clone());
        log::info!("wallet agent {} established", agent.id);
        Ok(agent)
    }

    /// The wallet agent.
    ///
    /// # Errors
    ///
    /// Returns [`PidKitError::InvariantViolation`] if no agent has been established or the
    /// secure unlock is not unlocked.
    pub fn agent(&self) -> Result<WalletAgent, PidKitError> {
        let state = self.unlock.state();
        if state != SecureUnlockState::Unlocked {
            return Err(PidKitError::InvariantViolation(format!(
                "wallet agent requested while secure unlock is {state:?}"
            )));
        }
        lock(&self.agent)
            .clone()
            .ok_or_else(|| PidKitError::InvariantViolation("no wallet agent".to_string()))
    }

    /// Whether an agent has been established.
    #[must_use]
    pub fn has_agent(&self) -> bool {
        lock(&self.agent).is_some()
    }

    /// Drops the agent. A wallet set up by this session is removed again so the PIN can be
    /// chosen anew; a wallet that existed before is left alone.
    pub fn clear(&self) {
        if lock(&self.agent).take().is_some() {
            if let Err(error) = self.unlock.reset() {
                log::warn!("failed to remove the wallet key: {error}");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicBool, Ordering};

    use super::*;
    use crate::platform::memory::MemorySecureUnlock;
    use crate::platform::UnlockError;

    /// Secure unlock whose first `finish_setup` fails.
    #[derive(Default)]
    struct FailingFinish {
        inner: MemorySecureUnlock,
        failed: AtomicBool,
    }

    impl SecureUnlock for FailingFinish {
        fn state(&self) -> SecureUnlockState {
            self.inner.state()
        }

        fn setup(&self, pin: SecretString) -> Result<(), UnlockError> {
            self.inner.setup(pin)
        }

        fn wallet_key(&self) -> Result<WalletKey, UnlockError> {
            self.inner.wallet_key()
        }

        fn finish_setup(&self) -> Result<(), UnlockError> {
            if !self.failed.swap(true, Ordering::SeqCst) {
                return Err(UnlockError::Keystore("io".to_string()));
            }
            self.inner.finish_setup()
        }

        fn reset(&self) -> Result<(), UnlockError> {
            self.inner.reset()
        }
    }

    fn pin() -> SecretString {
        SecretString::from("135790".to_string())
    }

    #[test]
    fn test_establish_unlocks() {
        let unlock = Arc::new(MemorySecureUnlock::new());
        let session = WalletSession::new(unlock.clone());

        let agent = session.establish(pin()).unwrap();
        assert_eq!(unlock.state(), SecureUnlockState::Unlocked);
        assert_eq!(session.agent().unwrap().id(), agent.id());
    }

    #[test]
    fn test_establish_rejects_locked_store() {
        let unlock = Arc::new(MemorySecureUnlock::with_state(SecureUnlockState::Locked));
        let session = WalletSession::new(unlock);

        let err = session.establish(pin()).unwrap_err();
        assert!(err.is_invariant_violation());
        assert!(!session.has_agent());
    }

    #[test]
    fn test_establish_rejects_initializing_store() {
        let unlock = Arc::new(MemorySecureUnlock::with_state(
            SecureUnlockState::Initializing,
        ));
        let session = WalletSession::new(unlock);
        assert!(session.establish(pin()).unwrap_err().is_invariant_violation());
    }

    #[test]
    fn test_agent_requires_established_session() {
        let session = WalletSession::new(Arc::new(MemorySecureUnlock::new()));
        assert!(session.agent().unwrap_err().is_invariant_violation());
    }

    #[test]
    fn test_clear() {
        let session = WalletSession::new(Arc::new(MemorySecureUnlock::new()));
        session.establish(pin()).unwrap();
        session.clear();
        assert!(!session.has_agent());
        assert!(session.agent().is_err());
        assert!(session.establish(pin()).is_ok());
    }

    #[test]
    fn test_clear_keeps_preexisting_wallet() {
        let unlock = Arc::new(MemorySecureUnlock::with_state(SecureUnlockState::Locked));
        let session = WalletSession::new(unlock.clone());
        session.clear();
        assert_eq!(unlock.state(), SecureUnlockState::Locked);
    }

    #[test]
    fn test_failed_setup_is_rolled_back() {
        let unlock = Arc::new(FailingFinish::default());
        let session = WalletSession::new(unlock.clone());

        let err = session.establish(pin()).unwrap_err();
        assert_eq!(err, PidKitError::Storage("io".to_string()));
        assert_eq!(unlock.state(), SecureUnlockState::NotConfigured);
        assert!(!session.has_agent());

        session.establish(pin()).unwrap();
        assert_eq!(unlock.state(), SecureUnlockState::Unlocked);
    }
}

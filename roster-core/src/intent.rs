//! Login events whose completion can be deferred by asynchronous checks.
//!
//! The host creates a [`LoginEvent`] per connection attempt, hands it to the
//! handlers, then awaits [`LoginEvent::completed`] before letting the client in
//! or disconnecting it. A handler that needs to finish work off the connection
//! path takes an [`IntentToken`]; the event cannot complete while any token is
//! alive, and each token releases its hold exactly once, when dropped.

use std::net::IpAddr;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::Notify;
use uuid::Uuid;

#[derive(Default)]
struct LoginState {
    cancelled: AtomicBool,
    cancel_reason: Mutex<Option<String>>,
    pending: AtomicUsize,
    released: Notify,
}

/// A connection attempt as seen by the presence handlers.
#[derive(Clone)]
pub struct LoginEvent {
    id: Uuid,
    name: String,
    address: IpAddr,
    state: Arc<LoginState>,
}

/// Final verdict once every intent has been released.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LoginOutcome {
    Allowed,
    Denied { reason: Option<String> },
}

impl LoginEvent {
    pub fn new(id: Uuid, name: impl Into<String>, address: IpAddr) -> Self {
        Self {
            id,
            name: name.into(),
            address,
            state: Arc::new(LoginState::default()),
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn address(&self) -> IpAddr {
        self.address
    }

    /// Hold the event open until the returned token is dropped.
    pub fn register_intent(&self) -> IntentToken {
        self.state.pending.fetch_add(1, Ordering::AcqRel);
        IntentToken {
            state: self.state.clone(),
        }
    }

    pub fn pending_intents(&self) -> usize {
        self.state.pending.load(Ordering::Acquire)
    }

    pub fn cancel(&self, reason: impl Into<String>) {
        if let Ok(mut slot) = self.state.cancel_reason.lock() {
            *slot = Some(reason.into());
        }
        self.state.cancelled.store(true, Ordering::Release);
    }

    pub fn is_cancelled(&self) -> bool {
        self.state.cancelled.load(Ordering::Acquire)
    }

    pub fn cancel_reason(&self) -> Option<String> {
        self.state
            .cancel_reason
            .lock()
            .ok()
            .and_then(|slot| slot.clone())
    }

    /// Wait for every registered intent to be released.
    pub async fn completed(&self) -> LoginOutcome {
        loop {
            let released = self.state.released.notified();
            if self.pending_intents() == 0 {
                break;
            }
            released.await;
        }

        if self.is_cancelled() {
            LoginOutcome::Denied {
                reason: self.cancel_reason(),
            }
        } else {
            LoginOutcome::Allowed
        }
    }
}

/// Deferral handle for a [`LoginEvent`]; releases on drop, including unwinding.
#[must_use = "dropping the token releases the login immediately"]
pub struct IntentToken {
    state: Arc<LoginState>,
}

impl Drop for IntentToken {
    fn drop(&mut self) {
        if self.state.pending.fetch_sub(1, Ordering::AcqRel) == 1 {
            self.state.released.notify_waiters();
        }
    }
}

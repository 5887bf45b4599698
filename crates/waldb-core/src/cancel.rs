//! Bridges cooperative task cancellation into engine-level statement
//! interruption.
//!
//! Three parties race here: the awaiting caller, the executor-scheduled body,
//! and the engine. A small state machine keeps them coordinated so that at
//! most one `sqlite3_interrupt` is delivered per access, an interrupt never
//! leaks into the next access on the same connection, and a cancellation
//! racing with completion resolves deterministically.

use std::sync::{Arc, Mutex};

use rusqlite::InterruptHandle;
use tracing::debug;

enum State {
    /// Access scheduled, body not yet running.
    NotConnected,
    /// Body is running on the executor; the handle can interrupt it.
    Connected(InterruptHandle),
    /// A cancel signal arrived. If a body was running it has been
    /// interrupted.
    Cancelled,
    /// The body finished before any cancel signal; late signals are no-ops.
    Expired,
}

/// One instance per awaited database access.
pub(crate) struct CancelBridge {
    state: Mutex<State>,
}

impl CancelBridge {
    pub(crate) fn new() -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(State::NotConnected),
        })
    }

    /// External cancel signal (token fired, or the awaiting future was
    /// dropped). Interrupts the engine iff a body is currently connected.
    pub(crate) fn cancel(&self) {
        let mut state = self.state.lock().unwrap();
        match &*state {
            State::Connected(handle) => {
                debug!("interrupting cancelled database access");
                handle.interrupt();
                *state = State::Cancelled;
            }
            State::NotConnected => *state = State::Cancelled,
            State::Cancelled | State::Expired => {}
        }
    }

    /// Called on the executor just before the body runs. Returns false when
    /// the access was cancelled before dispatch; the body must not run and
    /// the connection stays untouched.
    pub(crate) fn connect(&self, handle: InterruptHandle) -> bool {
        let mut state = self.state.lock().unwrap();
        match &*state {
            State::NotConnected => {
                *state = State::Connected(handle);
                true
            }
            State::Cancelled => false,
            State::Connected(_) | State::Expired => {
                unreachable!("cancel bridge connected twice")
            }
        }
    }

    /// Called on the executor after the body returns. True means the access
    /// was cancelled and the caller must see `Error::Cancelled`; the engine's
    /// interrupt flag clears itself once no statement is running, so the
    /// connection is clean for the next access.
    pub(crate) fn finish(&self) -> bool {
        let mut state = self.state.lock().unwrap();
        match &*state {
            State::Cancelled => {
                *state = State::Expired;
                true
            }
            State::Connected(_) => {
                *state = State::Expired;
                false
            }
            State::NotConnected | State::Expired => {
                unreachable!("cancel bridge finished without a connected body")
            }
        }
    }
}

/// Cancels the bridge when dropped, unless disarmed first. Held by awaiting
/// futures so that dropping the future mid-flight interrupts the engine.
pub(crate) struct CancelOnDrop {
    bridge: Option<Arc<CancelBridge>>,
}

impl CancelOnDrop {
    pub(crate) fn new(bridge: Arc<CancelBridge>) -> Self {
        Self {
            bridge: Some(bridge),
        }
    }

    pub(crate) fn disarm(&mut self) {
        self.bridge = None;
    }
}

impl Drop for CancelOnDrop {
    fn drop(&mut self) {
        if let Some(bridge) = self.bridge.take() {
            bridge.cancel();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rusqlite::Connection;

    fn handle() -> InterruptHandle {
        Connection::open_in_memory().unwrap().get_interrupt_handle()
    }

    #[test]
    fn cancel_before_dispatch_skips_body() {
        let bridge = CancelBridge::new();
        bridge.cancel();
        assert!(!bridge.connect(handle()));
    }

    #[test]
    fn cancel_mid_body_surfaces_cancelled() {
        let bridge = CancelBridge::new();
        assert!(bridge.connect(handle()));
        bridge.cancel();
        assert!(bridge.finish());
    }

    #[test]
    fn completion_before_cancel_expires() {
        let bridge = CancelBridge::new();
        assert!(bridge.connect(handle()));
        assert!(!bridge.finish());
        // A late signal must not poison the connection's next access.
        bridge.cancel();
    }

    #[test]
    fn drop_guard_cancels_unless_disarmed() {
        let bridge = CancelBridge::new();
        drop(CancelOnDrop::new(bridge.clone()));
        assert!(!bridge.connect(handle()));

        let bridge = CancelBridge::new();
        let mut guard = CancelOnDrop::new(bridge.clone());
        guard.disarm();
        drop(guard);
        assert!(bridge.connect(handle()));
    }
}

//! Connection state and its observers

use serde::Serialize;
use std::fmt;
use std::sync::Mutex;
use tokio::sync::watch;
use tracing::debug;

/// Lifecycle state of the device connection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Disconnecting,
}

impl ConnectionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Disconnected => "disconnected",
            Self::Connecting => "connecting",
            Self::Connected => "connected",
            Self::Disconnecting => "disconnecting",
        }
    }

    pub fn is_connected(&self) -> bool {
        matches!(self, Self::Connected)
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Callback invoked on every connection state transition
pub type StateCallback = Box<dyn Fn(ConnectionState) + Send + Sync>;

/// Single writer of [`ConnectionState`] plus its observer list
///
/// Transitions are compare-and-set against a set of allowed source states.
/// The observer lock is held for the whole transition, so callbacks run one
/// at a time and in transition order. Callbacks must not register further
/// observers.
pub struct ConnectionNotifier {
    state_tx: watch::Sender<ConnectionState>,
    observers: Mutex<Vec<StateCallback>>,
}

impl ConnectionNotifier {
    pub fn new() -> Self {
        let (state_tx, _) = watch::channel(ConnectionState::Disconnected);
        Self {
            state_tx,
            observers: Mutex::new(Vec::new()),
        }
    }

    pub fn current(&self) -> ConnectionState {
        *self.state_tx.borrow()
    }

    /// Receiver for async observers; sees the latest state, not every step
    pub fn watch(&self) -> watch::Receiver<ConnectionState> {
        self.state_tx.subscribe()
    }

    pub fn add_observer(&self, callback: StateCallback) {
        self.observers
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(callback);
    }

    /// Move to `to` if the current state is one of `from`
    ///
    /// Returns the previous state, or the unchanged current state when the
    /// transition is not allowed.
    pub fn transition(
        &self,
        from: &[ConnectionState],
        to: ConnectionState,
    ) -> Result<ConnectionState, ConnectionState> {
        let observers = self.observers.lock().unwrap_or_else(|e| e.into_inner());

        let mut previous = None;
        self.state_tx.send_if_modified(|state| {
            if from.contains(state) {
                previous = Some(*state);
                *state = to;
                true
            } else {
                false
            }
        });

        match previous {
            Some(previous) => {
                debug!(from = %previous, to = %to, "Connection state changed");
                for observer in observers.iter() {
                    observer(to);
                }
                Ok(previous)
            }
            None => Err(self.current()),
        }
    }
}

impl Default for ConnectionNotifier {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for ConnectionNotifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let observers = self.observers.lock().map(|o| o.len()).unwrap_or(0);
        f.debug_struct("ConnectionNotifier")
            .field("state", &self.current())
            .field("observers", &observers)
            .finish()
    }
}

use std::sync::Mutex;
use tokio::sync::watch;

/// Lifecycle of a voice session as seen by the host
#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::Display)]
pub enum SessionState {
    Inactive,
    Connecting,
    Connected,
    Reconnecting,
    Disconnected,
    Error,
}

impl SessionState {
    /// States a session does not leave on its own
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            SessionState::Inactive | SessionState::Disconnected | SessionState::Error
        )
    }
}

pub type StateCallback = Box<dyn Fn(SessionState) + Send + Sync + 'static>;

/// Single writer of the session state; fans transitions out to observers
pub(crate) struct StatePublisher {
    sender: watch::Sender<SessionState>,
    callbacks: Mutex<Vec<StateCallback>>,
}

impl StatePublisher {
    pub(crate) fn new() -> Self {
        let (sender, _) = watch::channel(SessionState::Inactive);
        Self {
            sender,
            callbacks: Mutex::new(Vec::new()),
        }
    }

    pub(crate) fn publish(&self, state: SessionState) {
        let previous = self.sender.send_replace(state);
        log::info!("📶 Session state: {} → {}", previous, state);
        match self.callbacks.lock() {
            Ok(callbacks) => callbacks.iter().for_each(|cb| cb(state)),
            Err(_) => log::error!("📶 State observers unavailable (lock poisoned)"),
        }
    }

    pub(crate) fn current(&self) -> SessionState {
        *self.sender.borrow()
    }

    pub(crate) fn subscribe(&self) -> watch::Receiver<SessionState> {
        self.sender.subscribe()
    }

    pub(crate) fn add_callback(&self, callback: StateCallback) {
        if let Ok(mut callbacks) = self.callbacks.lock() {
            callbacks.push(callback);
        }
    }
}

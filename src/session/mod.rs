//! Voice session lifecycle.
//!
//! `SessionManager` is the host-facing handle. The session itself runs as a
//! single supervisor task that owns the connection, the playback scheduler and
//! the capture path for one attempt at a time; the manager talks to it through
//! a command channel and observes it through published state.

mod state;
mod supervisor;

pub use state::{SessionState, StateCallback};

use crate::audio::{CaptureProcessor, CaptureStats, MicrophoneProvider, OutputProvider};
use crate::config::{AgentConfiguration, SpeechRateControl, DEFAULT_LIVE_MODEL};
use crate::error::{Result, SessionError};
use crate::reconnect::ReconnectionPolicy;
use crate::tools::{ToolCallResult, ToolDispatcher};
use crate::transport::Connector;
use state::StatePublisher;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use supervisor::Supervisor;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

const COMMAND_CAPACITY: usize = 16;

/// Everything a session needs from the outside world
pub struct SessionComponents {
    pub connector: Arc<dyn Connector>,
    pub microphone: Arc<dyn MicrophoneProvider>,
    pub output: Arc<dyn OutputProvider>,
    pub tools: Arc<ToolDispatcher>,
    pub speech_rate: SpeechRateControl,
    pub policy: ReconnectionPolicy,
    pub model: String,
}

impl SessionComponents {
    pub fn new(
        connector: Arc<dyn Connector>,
        microphone: Arc<dyn MicrophoneProvider>,
        output: Arc<dyn OutputProvider>,
        tools: Arc<ToolDispatcher>,
    ) -> Self {
        Self {
            connector,
            microphone,
            output,
            tools,
            speech_rate: SpeechRateControl::default(),
            policy: ReconnectionPolicy::default(),
            model: DEFAULT_LIVE_MODEL.to_string(),
        }
    }

    /// Share the rate control the speed tool writes to
    pub fn with_speech_rate(mut self, speech_rate: SpeechRateControl) -> Self {
        self.speech_rate = speech_rate;
        self
    }

    pub fn with_policy(mut self, policy: ReconnectionPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = model.into();
        self
    }
}

pub(crate) enum Command {
    StopSpeech,
    SendToolResult {
        result: ToolCallResult,
        reply: oneshot::Sender<Result<()>>,
    },
}

/// State shared between the manager and its supervisor task
pub(crate) struct Shared {
    pub(crate) components: SessionComponents,
    pub(crate) publisher: StatePublisher,
    pub(crate) muted: Arc<AtomicBool>,
    pub(crate) attempts: AtomicUsize,
    pub(crate) pending_config: Mutex<Option<AgentConfiguration>>,
    pub(crate) active_config: Mutex<AgentConfiguration>,
    pub(crate) capture: Mutex<Option<CaptureProcessor>>,
}

struct RunHandle {
    cancel: CancellationToken,
    commands: mpsc::Sender<Command>,
    task: JoinHandle<()>,
}

pub struct SessionManager {
    shared: Arc<Shared>,
    run: Option<RunHandle>,
}

impl SessionManager {
    pub fn new(components: SessionComponents) -> Self {
        Self {
            shared: Arc::new(Shared {
                components,
                publisher: StatePublisher::new(),
                muted: Arc::new(AtomicBool::new(false)),
                attempts: AtomicUsize::new(0),
                pending_config: Mutex::new(None),
                active_config: Mutex::new(AgentConfiguration::default()),
                capture: Mutex::new(None),
            }),
            run: None,
        }
    }

    /// Start a session with `config`. Progress is reported through state changes;
    /// a missing microphone ends in `Error` without retries.
    pub fn start(&mut self, config: AgentConfiguration) -> Result<()> {
        if self.is_running() {
            return Err(SessionError::AlreadyStarted);
        }

        log::info!("🚀 Starting voice session (voice: {})", config.voice);
        self.shared.components.speech_rate.set(config.speech_rate);
        if let Ok(mut active) = self.shared.active_config.lock() {
            *active = config;
        }
        // The config given here wins over anything queued before
        self.take_pending_config();
        self.shared.attempts.store(0, Ordering::Release);

        let cancel = CancellationToken::new();
        let (commands, command_rx) = mpsc::channel(COMMAND_CAPACITY);
        let supervisor = Supervisor::new(self.shared.clone(), cancel.clone(), command_rx);
        let task = tokio::spawn(supervisor.run());

        self.run = Some(RunHandle { cancel, commands, task });
        Ok(())
    }

    /// Tear everything down. Safe from any state and idempotent; always wins
    /// over a pending reconnect or an in-flight tool call.
    pub async fn stop(&mut self) {
        match self.run.take() {
            Some(run) if !run.task.is_finished() => {
                log::info!("🛑 Stopping voice session");
                run.cancel.cancel();
                if let Err(e) = run.task.await {
                    log::error!("🛑 Session task ended abnormally: {}", e);
                    self.shared.publisher.publish(SessionState::Disconnected);
                }
            }
            _ if self.state().is_terminal() => {}
            _ => self.shared.publisher.publish(SessionState::Inactive),
        }
    }

    /// Stop and start again with the queued configuration, if any
    pub async fn restart(&mut self) -> Result<()> {
        let config = self.take_pending_config().unwrap_or_else(|| self.config());
        self.stop().await;
        self.start(config)
    }

    /// Queue a configuration change for the next connection attempt
    pub fn update_config(&self, config: AgentConfiguration) {
        log::info!("⚙️  Configuration change queued for the next connection");
        if let Ok(mut pending) = self.shared.pending_config.lock() {
            *pending = Some(config);
        }
    }

    /// Configuration of the current (or last) connection attempt
    pub fn config(&self) -> AgentConfiguration {
        let mut config = self
            .shared
            .active_config
            .lock()
            .map(|c| c.clone())
            .unwrap_or_default();
        config.speech_rate = self.shared.components.speech_rate.get();
        config
    }

    fn take_pending_config(&self) -> Option<AgentConfiguration> {
        self.shared.pending_config.lock().ok().and_then(|mut p| p.take())
    }

    pub fn on_state_change<F>(&self, callback: F)
    where
        F: Fn(SessionState) + Send + Sync + 'static,
    {
        self.shared.publisher.add_callback(Box::new(callback));
    }

    pub fn subscribe(&self) -> watch::Receiver<SessionState> {
        self.shared.publisher.subscribe()
    }

    pub fn state(&self) -> SessionState {
        self.shared.publisher.current()
    }

    /// Send a tool result for a pending call. At most one result is accepted per call id.
    pub async fn send_tool_result(&self, result: ToolCallResult) -> Result<()> {
        let run = self.run.as_ref().ok_or(SessionError::NotConnected)?;
        let (reply, response) = oneshot::channel();
        run.commands
            .send(Command::SendToolResult { result, reply })
            .await
            .map_err(|_| SessionError::NotConnected)?;
        response.await.map_err(|_| SessionError::NotConnected)?
    }

    pub fn set_muted(&self, muted: bool) {
        self.shared.muted.store(muted, Ordering::Release);
        log::info!("{}", if muted { "🔇 Microphone muted" } else { "🎤 Microphone unmuted" });
    }

    pub fn is_muted(&self) -> bool {
        self.shared.muted.load(Ordering::Acquire)
    }

    /// Cut off the agent's current speech, like a server interruption
    pub fn stop_speech(&self) {
        if let Some(run) = &self.run {
            if run.commands.try_send(Command::StopSpeech).is_err() {
                log::debug!("🔇 Stop speech ignored, session busy or gone");
            }
        }
    }

    /// Consecutive failed reconnects since the last successful connection
    pub fn reconnect_attempts(&self) -> usize {
        self.shared.attempts.load(Ordering::Acquire)
    }

    /// Capture counters for the current or most recent connection attempt
    pub fn capture_stats(&self) -> CaptureStats {
        self.shared
            .capture
            .lock()
            .ok()
            .and_then(|c| c.as_ref().map(CaptureProcessor::stats))
            .unwrap_or_default()
    }

    fn is_running(&self) -> bool {
        self.run.as_ref().map(|r| !r.task.is_finished()).unwrap_or(false)
    }
}

impl Drop for SessionManager {
    fn drop(&mut self) {
        if let Some(run) = self.run.take() {
            run.cancel.cancel();
        }
    }
}

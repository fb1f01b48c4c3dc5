use super::{Command, SessionState, Shared};
use crate::audio::{CaptureProcessor, PlaybackScheduler};
use crate::config::AgentConfiguration;
use crate::error::{Result, SessionError};
use crate::instructions::build_system_instruction;
use crate::protocol::{ClientMessage, ServerMessage, SetupMessage};
use crate::tools::ToolCallResult;
use crate::transport::{Connection, TransportError, TransportEvent};
use std::collections::HashSet;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

const RESULT_CAPACITY: usize = 16;

enum AttemptOutcome {
    /// The host stopped the session
    Cancelled,
    /// The server closed normally
    CleanClose,
    /// Retrying cannot help (no microphone, rejected key)
    Fatal(SessionError),
    Transient(SessionError),
}

/// Runs connection attempts until the session ends.
///
/// Owns the scheduler and connection of the current attempt. Every attempt
/// acquires its own microphone, output and connection and releases them before
/// the next one starts.
pub(crate) struct Supervisor {
    shared: Arc<Shared>,
    cancel: CancellationToken,
    commands: mpsc::Receiver<Command>,
}

impl Supervisor {
    pub(crate) fn new(shared: Arc<Shared>, cancel: CancellationToken, commands: mpsc::Receiver<Command>) -> Self {
        Self {
            shared,
            cancel,
            commands,
        }
    }

    pub(crate) async fn run(mut self) {
        let shared = Arc::clone(&self.shared);
        let publisher = &shared.publisher;
        loop {
            publisher.publish(SessionState::Connecting);

            match self.run_attempt().await {
                AttemptOutcome::Cancelled => {
                    publisher.publish(SessionState::Disconnected);
                    return;
                }
                AttemptOutcome::CleanClose => {
                    log::info!("👋 Server ended the session");
                    publisher.publish(SessionState::Disconnected);
                    return;
                }
                AttemptOutcome::Fatal(e) => {
                    log::error!("❌ Session failed: {}", e);
                    publisher.publish(SessionState::Error);
                    return;
                }
                AttemptOutcome::Transient(e) => {
                    let policy = &shared.components.policy;
                    let attempt = shared.attempts.load(Ordering::Acquire);
                    let Some(delay) = policy.delay_for(attempt) else {
                        log::error!("❌ Giving up after {} reconnect attempts: {}", attempt, e);
                        publisher.publish(SessionState::Error);
                        return;
                    };

                    log::warn!(
                        "🔄 Connection lost ({}), reconnecting in {:?} (attempt {}/{})",
                        e,
                        delay,
                        attempt + 1,
                        policy.max_attempts()
                    );
                    publisher.publish(SessionState::Reconnecting);
                    if !self.wait_before_reconnect(delay).await {
                        publisher.publish(SessionState::Disconnected);
                        return;
                    }
                    shared.attempts.fetch_add(1, Ordering::AcqRel);
                }
            }
        }
    }

    /// Sleep out the backoff delay. Returns false if the host stopped the session meanwhile.
    async fn wait_before_reconnect(&mut self, delay: Duration) -> bool {
        let sleep = tokio::time::sleep(delay);
        tokio::pin!(sleep);
        loop {
            tokio::select! {
                biased;
                _ = self.cancel.cancelled() => return false,
                _ = &mut sleep => return true,
                Some(command) = self.commands.recv() => reject(command),
            }
        }
    }

    async fn run_attempt(&mut self) -> AttemptOutcome {
        let shared = Arc::clone(&self.shared);
        let components = &shared.components;
        let config = self.next_config();

        let mut mic = match components.microphone.open() {
            Ok(mic) => mic,
            Err(e) => return AttemptOutcome::Fatal(e.into()),
        };
        log::info!("🎤 Microphone acquired");
        let output = match components.output.open() {
            Ok(output) => output,
            Err(e) => return AttemptOutcome::Fatal(e.into()),
        };

        let setup = SetupMessage::new(
            components.model.clone(),
            config.voice,
            build_system_instruction(&config),
            components.tools.declarations(),
        );
        let connected = tokio::select! {
            biased;
            _ = self.cancel.cancelled() => return AttemptOutcome::Cancelled,
            result = components.connector.connect(setup) => result,
        };
        let mut connection = match connected {
            Ok(connection) => connection,
            Err(e) if e.is_fatal() => return AttemptOutcome::Fatal(e.into()),
            Err(e) => return AttemptOutcome::Transient(e.into()),
        };

        shared.attempts.store(0, Ordering::Release);
        shared.publisher.publish(SessionState::Connected);

        let mut scheduler = PlaybackScheduler::new(output);
        let capture = CaptureProcessor::new(shared.muted.clone(), connection.audio_sender());
        if let Err(e) = capture.attach(mic.as_mut()) {
            return AttemptOutcome::Fatal(e.into());
        }
        self.set_capture(Some(capture));

        let (results_tx, mut results_rx) = mpsc::channel::<ToolCallResult>(RESULT_CAPACITY);
        // Call ids that already got (or may no longer get) a result
        let mut answered: HashSet<String> = HashSet::new();

        let outcome = loop {
            tokio::select! {
                biased;
                _ = self.cancel.cancelled() => break AttemptOutcome::Cancelled,
                Some(command) = self.commands.recv() => match command {
                    Command::StopSpeech => {
                        log::info!("⏸️  Agent speech stopped by host");
                        scheduler.stop_all();
                    }
                    Command::SendToolResult { result, reply } => {
                        let _ = reply.send(deliver(&connection, &mut answered, result));
                    }
                },
                Some(result) = results_rx.recv() => {
                    if let Err(e) = deliver(&connection, &mut answered, result) {
                        log::debug!("🔧 Tool result discarded: {}", e);
                    }
                }
                event = connection.recv() => match event {
                    Some(TransportEvent::Message(message)) => {
                        route(&shared, message, &mut scheduler, &mut answered, &results_tx);
                    }
                    Some(event) if event.is_clean_close() => break AttemptOutcome::CleanClose,
                    Some(TransportEvent::Closed { code, reason }) => {
                        break AttemptOutcome::Transient(TransportError::AbnormalClose { code, reason }.into());
                    }
                    Some(TransportEvent::Error(e)) => break AttemptOutcome::Transient(e.into()),
                    None => break AttemptOutcome::Transient(TransportError::Closed.into()),
                },
            }
        };

        // Release in reverse order of acquisition
        mic.stop();
        drop(mic);
        scheduler.stop_all();
        drop(scheduler);
        match outcome {
            AttemptOutcome::Cancelled | AttemptOutcome::CleanClose => connection.close().await,
            _ => drop(connection),
        }
        outcome
    }

    /// Configuration for the next attempt; a queued change replaces the active one
    fn next_config(&self) -> AgentConfiguration {
        let pending = self.shared.pending_config.lock().ok().and_then(|mut p| p.take());
        let mut active = match self.shared.active_config.lock() {
            Ok(active) => active,
            Err(poisoned) => poisoned.into_inner(),
        };
        if let Some(config) = pending {
            log::info!("⚙️  Applying queued configuration");
            self.shared.components.speech_rate.set(config.speech_rate);
            *active = config;
        }
        active.clone()
    }

    fn set_capture(&self, capture: Option<CaptureProcessor>) {
        if let Ok(mut slot) = self.shared.capture.lock() {
            *slot = capture;
        }
    }
}

fn reject(command: Command) {
    if let Command::SendToolResult { reply, .. } = command {
        let _ = reply.send(Err(SessionError::NotConnected));
    }
}

/// Send one tool result, at most once per call id. Queues on the control lane
/// and returns immediately.
fn deliver(connection: &Connection, answered: &mut HashSet<String>, result: ToolCallResult) -> Result<()> {
    if !answered.insert(result.id.clone()) {
        return Err(SessionError::DuplicateResult(result.id));
    }
    log::info!(
        "🔧 Result for {} ({}){}",
        result.name,
        result.id,
        if result.is_error() { " [error]" } else { "" }
    );
    connection
        .send(ClientMessage::tool_response(&result))
        .map_err(|_| SessionError::NotConnected)
}

/// Route one inbound message to playback and tool dispatch
fn route(
    shared: &Shared,
    message: ServerMessage,
    scheduler: &mut PlaybackScheduler,
    answered: &mut HashSet<String>,
    results: &mpsc::Sender<ToolCallResult>,
) {
    if message.setup_complete.is_some() {
        log::debug!("🤝 Setup acknowledged");
    }
    if let Some(go_away) = &message.go_away {
        log::warn!("⏳ Server is going away (time left: {:?})", go_away.time_left);
    }

    if message.is_interrupted() {
        log::info!("✋ User interrupted, stopping playback");
        scheduler.stop_all();
    }

    for request in message.tool_requests() {
        if answered.contains(&request.id) {
            log::warn!("🔧 Ignoring repeated tool call {}", request.id);
            continue;
        }
        let tools = Arc::clone(&shared.components.tools);
        let results = results.clone();
        // Dispatch off the receive loop; the result is dropped if the attempt ends first
        tokio::spawn(async move {
            let result = tools.dispatch(&request).await;
            let _ = results.send(result).await;
        });
    }

    if let Some(cancellation) = &message.tool_call_cancellation {
        for id in &cancellation.ids {
            log::info!("🔧 Tool call {} cancelled by server", id);
            answered.insert(id.clone());
        }
    }

    let rate = shared.components.speech_rate.get().factor();
    for chunk in message.audio_chunks() {
        if let Err(e) = scheduler.enqueue(chunk, rate) {
            log::warn!("🔊 Skipping malformed audio chunk: {}", e);
        }
    }
}

//! # Session Tests
//!
//! Drive a `SessionManager` end to end against a scripted connector, a fake
//! microphone and a fake output device. All tests run on a paused tokio clock,
//! so backoff delays are exact and instant.
//!
//! ```bash
//! cargo test --test session_tests
//! RUST_LOG=debug cargo test --test session_tests -- --nocapture
//! ```

use async_trait::async_trait;
use live_agent_rs::audio::{
    AudioError, AudioFrameCodec, AudioOutput, MicSource, MicrophoneProvider, OutputProvider, PlaybackUnit, UnitId,
    WindowCallback,
};
use live_agent_rs::catalog::StudyCatalog;
use live_agent_rs::config::{AgentConfiguration, SpeechRate, SpeechRateControl, VoiceProfile};
use live_agent_rs::protocol::{ClientMessage, FunctionResponse, ServerMessage, SetupMessage};
use live_agent_rs::reconnect::ReconnectionPolicy;
use live_agent_rs::tools::builtin::{AdjustPlaybackSpeed, QueryData};
use live_agent_rs::tools::{
    FunctionDeclaration, ParameterSchema, ToolCallResult, ToolDispatcher, ToolError, ToolHandler, ToolOutcome,
};
use live_agent_rs::transport::{Connection, Connector, TransportError, TransportEvent, NORMAL_CLOSE};
use live_agent_rs::{SessionComponents, SessionError, SessionManager, SessionState};
use serde_json::{json, Map, Value};
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::Instant;

const WAIT: Duration = Duration::from_secs(120);

// ---------------------------------------------------------------------------
// Scripted connector
// ---------------------------------------------------------------------------

enum Step {
    /// Transient failure (timeout)
    Fail,
    /// Handshake rejected with an HTTP status
    Reject(u16),
    Accept,
}

/// The server end of an accepted connection
struct ServerSide {
    events: mpsc::Sender<TransportEvent>,
    audio: mpsc::Receiver<ClientMessage>,
    control: mpsc::UnboundedReceiver<ClientMessage>,
}

impl ServerSide {
    async fn send_json(&self, json: Value) {
        let message = ServerMessage::parse(&json.to_string()).unwrap();
        self.events.send(TransportEvent::Message(message)).await.unwrap();
    }

    async fn close(&self, code: u16) {
        self.events
            .send(TransportEvent::Closed {
                code: Some(code),
                reason: String::new(),
            })
            .await
            .unwrap();
    }

    async fn next_tool_response(&mut self) -> FunctionResponse {
        let message = tokio::time::timeout(WAIT, self.control.recv())
            .await
            .expect("timed out waiting for a tool response")
            .expect("connection closed");
        match message {
            ClientMessage::ToolResponse(mut response) => {
                assert_eq!(response.function_responses.len(), 1);
                response.function_responses.remove(0)
            }
            other => panic!("expected a tool response, got {:?}", other),
        }
    }

    fn assert_no_tool_response(&mut self) {
        if let Ok(message) = self.control.try_recv() {
            panic!("unexpected control message: {:?}", message);
        }
    }

    fn drain_audio_frames(&mut self) -> usize {
        let mut count = 0;
        while let Ok(message) = self.audio.try_recv() {
            if matches!(message, ClientMessage::RealtimeInput(_)) {
                count += 1;
            }
        }
        count
    }
}

struct ScriptedConnector {
    steps: Mutex<VecDeque<Step>>,
    attempts: Mutex<Vec<(Instant, SetupMessage)>>,
    servers: mpsc::UnboundedSender<ServerSide>,
}

impl ScriptedConnector {
    /// Steps are consumed in order; once they run out every attempt fails.
    fn new(steps: Vec<Step>) -> (Arc<Self>, mpsc::UnboundedReceiver<ServerSide>) {
        let (servers, server_rx) = mpsc::unbounded_channel();
        let connector = Arc::new(Self {
            steps: Mutex::new(steps.into()),
            attempts: Mutex::new(Vec::new()),
            servers,
        });
        (connector, server_rx)
    }

    fn attempt_count(&self) -> usize {
        self.attempts.lock().unwrap().len()
    }

    fn attempt_times(&self) -> Vec<Instant> {
        self.attempts.lock().unwrap().iter().map(|(t, _)| *t).collect()
    }

    fn voice_of_attempt(&self, index: usize) -> String {
        self.attempts.lock().unwrap()[index]
            .1
            .generation_config
            .speech_config
            .voice_config
            .prebuilt_voice_config
            .voice_name
            .clone()
    }
}

#[async_trait]
impl Connector for ScriptedConnector {
    async fn connect(&self, setup: SetupMessage) -> Result<Connection, TransportError> {
        self.attempts.lock().unwrap().push((Instant::now(), setup));
        let step = self.steps.lock().unwrap().pop_front().unwrap_or(Step::Fail);
        match step {
            Step::Fail => Err(TransportError::Timeout),
            Step::Reject(status) => Err(TransportError::HandshakeRejected { status }),
            Step::Accept => {
                let (audio_tx, audio_rx) = mpsc::channel(64);
                let (control_tx, control_rx) = mpsc::unbounded_channel();
                let (in_tx, in_rx) = mpsc::channel(64);
                let _ = self.servers.send(ServerSide {
                    events: in_tx,
                    audio: audio_rx,
                    control: control_rx,
                });
                Ok(Connection::new(audio_tx, control_tx, in_rx))
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Fake microphone
// ---------------------------------------------------------------------------

#[derive(Default)]
struct FakeMicProvider {
    fail: bool,
    opened: Mutex<usize>,
    callback: Arc<Mutex<Option<WindowCallback>>>,
}

impl FakeMicProvider {
    fn denied() -> Self {
        Self {
            fail: true,
            ..Default::default()
        }
    }

    /// Deliver one window as the audio thread would. False if nothing is listening.
    fn push_window(&self, samples: &[f32]) -> bool {
        match self.callback.lock().unwrap().as_mut() {
            Some(callback) => {
                callback(samples);
                true
            }
            None => false,
        }
    }
}

struct FakeMic {
    callback: Arc<Mutex<Option<WindowCallback>>>,
}

impl MicSource for FakeMic {
    fn start(&mut self, on_window: WindowCallback) -> Result<(), AudioError> {
        *self.callback.lock().unwrap() = Some(on_window);
        Ok(())
    }

    fn stop(&mut self) {
        self.callback.lock().unwrap().take();
    }
}

impl MicrophoneProvider for FakeMicProvider {
    fn open(&self) -> Result<Box<dyn MicSource>, AudioError> {
        if self.fail {
            return Err(AudioError::Device("Permission denied".to_string()));
        }
        *self.opened.lock().unwrap() += 1;
        Ok(Box::new(FakeMic {
            callback: self.callback.clone(),
        }))
    }
}

// ---------------------------------------------------------------------------
// Fake output
// ---------------------------------------------------------------------------

#[derive(Default)]
struct FakeOutput {
    started: Mutex<Vec<(UnitId, f32)>>,
    stopped: Mutex<Vec<UnitId>>,
}

impl FakeOutput {
    fn started_count(&self) -> usize {
        self.started.lock().unwrap().len()
    }

    fn last_rate(&self) -> Option<f32> {
        self.started.lock().unwrap().last().map(|(_, rate)| *rate)
    }

    fn stopped_ids(&self) -> Vec<UnitId> {
        let mut ids = self.stopped.lock().unwrap().clone();
        ids.sort_unstable();
        ids
    }
}

impl AudioOutput for FakeOutput {
    // The clock never advances, so nothing finishes on its own
    fn current_time(&self) -> f64 {
        0.0
    }

    fn start(&self, id: UnitId, unit: &PlaybackUnit) {
        self.started.lock().unwrap().push((id, unit.playback_rate()));
    }

    fn stop(&self, id: UnitId) {
        self.stopped.lock().unwrap().push(id);
    }
}

struct FakeOutputProvider(Arc<FakeOutput>);

impl OutputProvider for FakeOutputProvider {
    fn open(&self) -> Result<Arc<dyn AudioOutput>, AudioError> {
        Ok(self.0.clone())
    }
}

// ---------------------------------------------------------------------------
// Harness
// ---------------------------------------------------------------------------

struct Harness {
    session: SessionManager,
    connector: Arc<ScriptedConnector>,
    servers: mpsc::UnboundedReceiver<ServerSide>,
    mic: Arc<FakeMicProvider>,
    output: Arc<FakeOutput>,
    history: Arc<Mutex<Vec<SessionState>>>,
}

impl Harness {
    fn new(steps: Vec<Step>) -> Self {
        Self::build(steps, FakeMicProvider::default(), ToolDispatcher::new(), SpeechRateControl::default())
    }

    fn build(steps: Vec<Step>, mic: FakeMicProvider, tools: ToolDispatcher, speech_rate: SpeechRateControl) -> Self {
        let (connector, servers) = ScriptedConnector::new(steps);
        let mic = Arc::new(mic);
        let output = Arc::new(FakeOutput::default());

        let components = SessionComponents::new(
            connector.clone(),
            mic.clone(),
            Arc::new(FakeOutputProvider(output.clone())),
            Arc::new(tools),
        )
        .with_speech_rate(speech_rate)
        .with_policy(ReconnectionPolicy::default());

        let session = SessionManager::new(components);
        let history = Arc::new(Mutex::new(Vec::new()));
        let recorder = history.clone();
        session.on_state_change(move |state| recorder.lock().unwrap().push(state));

        Self {
            session,
            connector,
            servers,
            mic,
            output,
            history,
        }
    }

    async fn wait_for_state(&self, wanted: SessionState) {
        let mut states = self.session.subscribe();
        tokio::time::timeout(WAIT, states.wait_for(|s| *s == wanted))
            .await
            .unwrap_or_else(|_| panic!("timed out waiting for {}", wanted))
            .expect("state channel closed");
    }

    async fn next_server(&mut self) -> ServerSide {
        tokio::time::timeout(WAIT, self.servers.recv())
            .await
            .expect("timed out waiting for a connection")
            .expect("connector gone")
    }

    fn history(&self) -> Vec<SessionState> {
        self.history.lock().unwrap().clone()
    }
}

/// Poll `condition` while letting the session make progress
async fn eventually(mut condition: impl FnMut() -> bool) {
    for _ in 0..200 {
        if condition() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("condition not reached");
}

fn speech_chunk() -> String {
    AudioFrameCodec::to_wire(&AudioFrameCodec::encode_samples(&vec![0.1; 2400]))
}

fn audio_message(chunks: usize) -> Value {
    let parts: Vec<Value> = (0..chunks)
        .map(|_| json!({ "inlineData": { "mimeType": "audio/pcm;rate=24000", "data": speech_chunk() } }))
        .collect();
    json!({ "serverContent": { "modelTurn": { "parts": parts } } })
}

fn tool_call(id: &str, name: &str, args: Value) -> Value {
    json!({ "toolCall": { "functionCalls": [{ "id": id, "name": name, "args": args }] } })
}

fn result_value(response: &FunctionResponse) -> Value {
    serde_json::from_str(&response.response.result).unwrap()
}

fn assert_gap(from: Instant, to: Instant, expected: Duration) {
    let gap = to - from;
    assert!(
        gap >= expected && gap < expected + Duration::from_millis(50),
        "expected a gap of {:?}, got {:?}",
        expected,
        gap
    );
}

/// Tool that takes a while, so the server has time to cancel it
struct SlowTool;

#[async_trait]
impl ToolHandler for SlowTool {
    async fn call(&self, _arguments: &Map<String, Value>) -> Result<Value, ToolError> {
        tokio::time::sleep(Duration::from_secs(5)).await;
        Ok(json!({ "done": true }))
    }
}

// ---------------------------------------------------------------------------
// Lifecycle
// ---------------------------------------------------------------------------

#[test_log::test(tokio::test(start_paused = true))]
async fn test_connects_and_stops_cleanly() {
    let mut h = Harness::new(vec![Step::Accept]);
    assert_eq!(h.session.state(), SessionState::Inactive);

    h.session.start(AgentConfiguration::default()).unwrap();
    h.wait_for_state(SessionState::Connected).await;
    let _server = h.next_server().await;
    assert_eq!(*h.mic.opened.lock().unwrap(), 1);

    h.session.stop().await;
    assert_eq!(h.session.state(), SessionState::Disconnected);
    assert_eq!(
        h.history(),
        vec![SessionState::Connecting, SessionState::Connected, SessionState::Disconnected]
    );
    assert!(!h.mic.push_window(&[0.0; 16]), "microphone must be released");
}

#[test_log::test(tokio::test(start_paused = true))]
async fn test_start_twice_is_rejected() {
    let mut h = Harness::new(vec![Step::Accept]);
    h.session.start(AgentConfiguration::default()).unwrap();
    h.wait_for_state(SessionState::Connected).await;

    let second = h.session.start(AgentConfiguration::default());
    assert!(matches!(second, Err(SessionError::AlreadyStarted)));
    h.session.stop().await;
}

#[test_log::test(tokio::test(start_paused = true))]
async fn test_stop_when_never_started_is_inactive() {
    let mut h = Harness::new(vec![]);
    h.session.stop().await;
    assert_eq!(h.session.state(), SessionState::Inactive);
    assert_eq!(h.connector.attempt_count(), 0);
}

#[test_log::test(tokio::test(start_paused = true))]
async fn test_microphone_denied_is_fatal() {
    let h = Harness::build(
        vec![Step::Accept],
        FakeMicProvider::denied(),
        ToolDispatcher::new(),
        SpeechRateControl::default(),
    );
    let mut session = h.session;
    session.start(AgentConfiguration::default()).unwrap();

    let mut states = session.subscribe();
    tokio::time::timeout(WAIT, states.wait_for(|s| *s == SessionState::Error))
        .await
        .unwrap()
        .unwrap();
    drop(states);

    tokio::time::sleep(Duration::from_secs(30)).await;
    assert_eq!(h.connector.attempt_count(), 0, "no connection without a microphone");
    assert_eq!(session.state(), SessionState::Error);
}

#[test_log::test(tokio::test(start_paused = true))]
async fn test_rejected_key_is_fatal() {
    let h = Harness::new(vec![Step::Reject(403)]);
    let mut session = h.session;
    session.start(AgentConfiguration::default()).unwrap();

    let mut states = session.subscribe();
    tokio::time::timeout(WAIT, states.wait_for(|s| *s == SessionState::Error))
        .await
        .unwrap()
        .unwrap();
    drop(states);

    tokio::time::sleep(Duration::from_secs(30)).await;
    assert_eq!(h.connector.attempt_count(), 1);
}

#[test_log::test(tokio::test(start_paused = true))]
async fn test_server_normal_close_ends_without_retry() {
    let mut h = Harness::new(vec![Step::Accept, Step::Accept]);
    h.session.start(AgentConfiguration::default()).unwrap();
    let server = h.next_server().await;
    h.wait_for_state(SessionState::Connected).await;

    server.close(NORMAL_CLOSE).await;
    h.wait_for_state(SessionState::Disconnected).await;

    tokio::time::sleep(Duration::from_secs(30)).await;
    assert_eq!(h.connector.attempt_count(), 1);
    assert!(!h.history().contains(&SessionState::Reconnecting));
}

// ---------------------------------------------------------------------------
// Reconnection
// ---------------------------------------------------------------------------

#[test_log::test(tokio::test(start_paused = true))]
async fn test_retries_until_policy_is_exhausted() {
    let h = Harness::new(vec![]);
    let mut session = h.session;
    session.start(AgentConfiguration::default()).unwrap();

    let mut states = session.subscribe();
    tokio::time::timeout(WAIT, states.wait_for(|s| *s == SessionState::Error))
        .await
        .unwrap()
        .unwrap();

    let times = h.connector.attempt_times();
    assert_eq!(times.len(), 5, "one initial attempt plus four retries");
    for (i, secs) in [1, 2, 5, 10].into_iter().enumerate() {
        assert_gap(times[i], times[i + 1], Duration::from_secs(secs));
    }

    let history = h.history.lock().unwrap().clone();
    assert_eq!(
        history.iter().filter(|s| **s == SessionState::Reconnecting).count(),
        4
    );
    assert_eq!(history.last(), Some(&SessionState::Error));
}

#[test_log::test(tokio::test(start_paused = true))]
async fn test_backoff_resets_after_successful_connection() {
    let mut h = Harness::new(vec![Step::Fail, Step::Fail, Step::Accept, Step::Accept]);
    h.session.start(AgentConfiguration::default()).unwrap();

    let server = h.next_server().await;
    h.wait_for_state(SessionState::Connected).await;
    assert_eq!(h.session.reconnect_attempts(), 0);

    // Connection lost without a close frame
    drop(server);
    let _second = h.next_server().await;
    h.wait_for_state(SessionState::Connected).await;

    let times = h.connector.attempt_times();
    assert_eq!(times.len(), 4);
    assert_gap(times[0], times[1], Duration::from_secs(1));
    assert_gap(times[1], times[2], Duration::from_secs(2));
    assert_gap(times[2], times[3], Duration::from_secs(1));

    h.session.stop().await;
}

#[test_log::test(tokio::test(start_paused = true))]
async fn test_abnormal_close_reconnects() {
    let mut h = Harness::new(vec![Step::Accept, Step::Accept]);
    h.session.start(AgentConfiguration::default()).unwrap();

    let server = h.next_server().await;
    server.close(1011).await;
    let _second = h.next_server().await;
    h.wait_for_state(SessionState::Connected).await;

    assert_eq!(h.connector.attempt_count(), 2);
    assert!(h.history().contains(&SessionState::Reconnecting));
    h.session.stop().await;
}

#[test_log::test(tokio::test(start_paused = true))]
async fn test_stop_during_backoff_cancels_reconnect() {
    let mut h = Harness::new(vec![Step::Fail, Step::Accept]);
    h.session.start(AgentConfiguration::default()).unwrap();
    h.wait_for_state(SessionState::Reconnecting).await;

    h.session.stop().await;
    assert_eq!(h.session.state(), SessionState::Disconnected);

    tokio::time::sleep(Duration::from_secs(30)).await;
    assert_eq!(h.connector.attempt_count(), 1, "no attempt after stop");
    assert_eq!(h.session.state(), SessionState::Disconnected);
}

#[test_log::test(tokio::test(start_paused = true))]
async fn test_queued_config_applies_on_next_attempt() {
    let mut h = Harness::new(vec![Step::Accept, Step::Accept]);
    h.session.start(AgentConfiguration::default()).unwrap();
    let server = h.next_server().await;
    h.wait_for_state(SessionState::Connected).await;

    let kore = AgentConfiguration {
        voice: VoiceProfile::Kore,
        speech_rate: SpeechRate::Slow,
        ..AgentConfiguration::default()
    };
    h.session.update_config(kore);
    assert_eq!(h.session.config().voice, VoiceProfile::Fenrir, "live connection keeps its config");

    drop(server);
    let _second = h.next_server().await;
    h.wait_for_state(SessionState::Connected).await;

    assert_eq!(h.connector.voice_of_attempt(0), "Fenrir");
    assert_eq!(h.connector.voice_of_attempt(1), "Kore");
    assert_eq!(h.session.config().voice, VoiceProfile::Kore);
    assert_eq!(h.session.config().speech_rate, SpeechRate::Slow);
    h.session.stop().await;
}

// ---------------------------------------------------------------------------
// Playback
// ---------------------------------------------------------------------------

#[test_log::test(tokio::test(start_paused = true))]
async fn test_interruption_stops_all_pending_speech() {
    let mut h = Harness::new(vec![Step::Accept]);
    h.session.start(AgentConfiguration::default()).unwrap();
    let server = h.next_server().await;

    server.send_json(audio_message(3)).await;
    let output = h.output.clone();
    eventually(|| output.started_count() == 3).await;
    assert!(output.stopped_ids().is_empty());

    server
        .send_json(json!({ "serverContent": { "interrupted": true } }))
        .await;
    eventually(|| output.stopped_ids().len() == 3).await;
    assert_eq!(output.stopped_ids(), vec![0, 1, 2]);

    h.session.stop().await;
}

#[test_log::test(tokio::test(start_paused = true))]
async fn test_stop_speech_from_host() {
    let mut h = Harness::new(vec![Step::Accept]);
    h.session.start(AgentConfiguration::default()).unwrap();
    let server = h.next_server().await;

    server.send_json(audio_message(2)).await;
    let output = h.output.clone();
    eventually(|| output.started_count() == 2).await;

    h.session.stop_speech();
    eventually(|| output.stopped_ids().len() == 2).await;
    h.session.stop().await;
}

#[test_log::test(tokio::test(start_paused = true))]
async fn test_malformed_audio_chunk_is_skipped() {
    let mut h = Harness::new(vec![Step::Accept]);
    h.session.start(AgentConfiguration::default()).unwrap();
    let server = h.next_server().await;

    server
        .send_json(json!({ "serverContent": { "modelTurn": { "parts": [
            { "inlineData": { "mimeType": "audio/pcm", "data": "%%%not base64%%%" } },
            { "inlineData": { "mimeType": "audio/pcm", "data": speech_chunk() } }
        ] } } }))
        .await;

    let output = h.output.clone();
    eventually(|| output.started_count() == 1).await;
    assert_eq!(h.session.state(), SessionState::Connected);
    h.session.stop().await;
}

// ---------------------------------------------------------------------------
// Capture
// ---------------------------------------------------------------------------

#[test_log::test(tokio::test(start_paused = true))]
async fn test_mute_drops_frames_and_unmute_does_not_flush() {
    let mut h = Harness::new(vec![Step::Accept]);
    h.session.start(AgentConfiguration::default()).unwrap();
    let mut server = h.next_server().await;
    h.wait_for_state(SessionState::Connected).await;

    let window = vec![0.25f32; 4096];
    assert!(h.mic.push_window(&window));
    assert_eq!(server.drain_audio_frames(), 1);

    h.session.set_muted(true);
    assert!(h.session.is_muted());
    for _ in 0..3 {
        assert!(h.mic.push_window(&window));
    }
    assert_eq!(server.drain_audio_frames(), 0);

    h.session.set_muted(false);
    assert_eq!(server.drain_audio_frames(), 0, "nothing buffered while muted");
    assert!(h.mic.push_window(&window));
    assert_eq!(server.drain_audio_frames(), 1);

    let stats = h.session.capture_stats();
    assert_eq!(stats.frames_sent, 2);
    assert_eq!(stats.dropped_muted, 3);
    assert_eq!(stats.dropped_backpressure, 0);
    h.session.stop().await;
}

#[test_log::test(tokio::test(start_paused = true))]
async fn test_capture_drops_frames_under_backpressure() {
    let mut h = Harness::new(vec![Step::Accept]);
    h.session.start(AgentConfiguration::default()).unwrap();
    let mut server = h.next_server().await;
    h.wait_for_state(SessionState::Connected).await;

    // Nobody reads the outbound side while 100 windows arrive
    let window = vec![0.1f32; 512];
    for _ in 0..100 {
        assert!(h.mic.push_window(&window));
    }
    let stats = h.session.capture_stats();
    assert_eq!(stats.frames_sent + stats.dropped_backpressure, 100);
    assert!(stats.dropped_backpressure > 0);
    assert_eq!(server.drain_audio_frames() as u64, stats.frames_sent);
    h.session.stop().await;
}

// ---------------------------------------------------------------------------
// Tools
// ---------------------------------------------------------------------------

fn catalog_tools() -> ToolDispatcher {
    let catalog = StudyCatalog::from_json(
        r#"{ "question_notebooks": [{ "id": "nb-1", "name": "Estudos do BCB" }], "sources": [] }"#,
    )
    .unwrap();
    let mut tools = ToolDispatcher::new();
    tools.register(QueryData::declaration(), QueryData::new(Arc::new(catalog)));
    tools
}

#[test_log::test(tokio::test(start_paused = true))]
async fn test_tool_call_round_trip() {
    let mut h = Harness::build(
        vec![Step::Accept],
        FakeMicProvider::default(),
        catalog_tools(),
        SpeechRateControl::default(),
    );
    h.session.start(AgentConfiguration::default()).unwrap();
    let mut server = h.next_server().await;

    server
        .send_json(tool_call("call-1", "queryData", json!({ "tableName": "question_notebooks" })))
        .await;
    let response = server.next_tool_response().await;
    assert_eq!(response.id, "call-1");
    assert_eq!(response.name, "queryData");
    assert_eq!(result_value(&response)["items"][0]["name"], "Estudos do BCB");

    server
        .send_json(tool_call("call-2", "queryData", json!({ "tableName": "users" })))
        .await;
    let response = server.next_tool_response().await;
    assert_eq!(response.id, "call-2");
    assert!(result_value(&response)["error"].is_string());

    server.send_json(tool_call("call-3", "deleteEverything", json!({}))).await;
    let response = server.next_tool_response().await;
    assert_eq!(result_value(&response)["error"], "Unknown function: deleteEverything");

    assert_eq!(h.session.state(), SessionState::Connected);
    h.session.stop().await;
}

#[test_log::test(tokio::test(start_paused = true))]
async fn test_cancelled_tool_call_sends_no_result() {
    let mut tools = ToolDispatcher::new();
    tools.register(
        FunctionDeclaration::new("slowLookup", "Takes a while.", ParameterSchema::object()),
        SlowTool,
    );
    let mut h = Harness::build(vec![Step::Accept], FakeMicProvider::default(), tools, SpeechRateControl::default());
    h.session.start(AgentConfiguration::default()).unwrap();
    let mut server = h.next_server().await;

    server.send_json(tool_call("slow-1", "slowLookup", json!({}))).await;
    server
        .send_json(json!({ "toolCallCancellation": { "ids": ["slow-1"] } }))
        .await;

    tokio::time::sleep(Duration::from_secs(10)).await;
    server.assert_no_tool_response();
    h.session.stop().await;
}

#[test_log::test(tokio::test(start_paused = true))]
async fn test_speed_tool_changes_following_speech() {
    let speech_rate = SpeechRateControl::default();
    let mut tools = ToolDispatcher::new();
    tools.register(
        AdjustPlaybackSpeed::declaration(),
        AdjustPlaybackSpeed::new(speech_rate.clone()),
    );
    let mut h = Harness::build(vec![Step::Accept], FakeMicProvider::default(), tools, speech_rate.clone());
    h.session.start(AgentConfiguration::default()).unwrap();
    let mut server = h.next_server().await;

    server.send_json(audio_message(1)).await;
    let output = h.output.clone();
    eventually(|| output.started_count() == 1).await;
    assert_eq!(output.last_rate(), Some(1.0));

    server
        .send_json(tool_call("speed-1", "adjustPlaybackSpeed", json!({ "speed": 1.15 })))
        .await;
    let response = server.next_tool_response().await;
    assert!(result_value(&response)["success"].is_string());
    assert_eq!(speech_rate.get(), SpeechRate::Fast);

    server.send_json(audio_message(1)).await;
    eventually(|| output.started_count() == 2).await;
    assert_eq!(output.last_rate(), Some(1.15));
    assert_eq!(h.session.config().speech_rate, SpeechRate::Fast);
    h.session.stop().await;
}

#[test_log::test(tokio::test(start_paused = true))]
async fn test_host_tool_result_is_sent_at_most_once() {
    let mut h = Harness::new(vec![Step::Accept]);

    let result = ToolCallResult {
        id: "host-1".to_string(),
        name: "navigateTo".to_string(),
        outcome: ToolOutcome::Success(json!({ "success": "ok" })),
    };
    assert!(matches!(
        h.session.send_tool_result(result.clone()).await,
        Err(SessionError::NotConnected)
    ));

    h.session.start(AgentConfiguration::default()).unwrap();
    let mut server = h.next_server().await;
    h.wait_for_state(SessionState::Connected).await;

    h.session.send_tool_result(result.clone()).await.unwrap();
    let response = server.next_tool_response().await;
    assert_eq!(response.id, "host-1");

    match h.session.send_tool_result(result.clone()).await {
        Err(SessionError::DuplicateResult(id)) => assert_eq!(id, "host-1"),
        other => panic!("expected a duplicate result error, got {:?}", other),
    }

    h.session.stop().await;
    assert!(matches!(
        h.session.send_tool_result(result).await,
        Err(SessionError::NotConnected)
    ));
}

#[test_log::test(tokio::test(start_paused = true))]
async fn test_tool_result_not_held_up_by_saturated_audio() {
    let mut h = Harness::build(
        vec![Step::Accept],
        FakeMicProvider::default(),
        catalog_tools(),
        SpeechRateControl::default(),
    );
    h.session.start(AgentConfiguration::default()).unwrap();
    let mut server = h.next_server().await;
    h.wait_for_state(SessionState::Connected).await;

    // Fill the audio lane; nothing drains it
    let window = vec![0.1f32; 512];
    for _ in 0..100 {
        h.mic.push_window(&window);
    }
    assert!(h.session.capture_stats().dropped_backpressure > 0);

    server
        .send_json(tool_call("c1", "queryData", json!({ "tableName": "sources" })))
        .await;
    server.send_json(audio_message(1)).await;

    let output = h.output.clone();
    eventually(|| output.started_count() == 1).await;
    assert_eq!(server.next_tool_response().await.id, "c1");

    tokio::time::timeout(Duration::from_secs(5), h.session.stop())
        .await
        .expect("stop must not wait on the audio lane");
    assert_eq!(h.session.state(), SessionState::Disconnected);
}

#[test_log::test(tokio::test(start_paused = true))]
async fn test_slow_tool_does_not_stall_playback() {
    let mut tools = ToolDispatcher::new();
    tools.register(
        FunctionDeclaration::new("slowLookup", "Takes a while.", ParameterSchema::object()),
        SlowTool,
    );
    let mut h = Harness::build(vec![Step::Accept], FakeMicProvider::default(), tools, SpeechRateControl::default());
    h.session.start(AgentConfiguration::default()).unwrap();
    let mut server = h.next_server().await;

    server.send_json(tool_call("slow-1", "slowLookup", json!({}))).await;
    let dispatched_at = Instant::now();
    server.send_json(audio_message(2)).await;

    let output = h.output.clone();
    eventually(|| output.started_count() == 2).await;
    server
        .send_json(json!({ "serverContent": { "interrupted": true } }))
        .await;
    eventually(|| output.stopped_ids().len() == 2).await;
    assert!(
        Instant::now() - dispatched_at < Duration::from_secs(5),
        "playback waited for the tool"
    );

    let response = server.next_tool_response().await;
    assert_eq!(response.id, "slow-1");
    assert_eq!(result_value(&response)["done"], true);
    h.session.stop().await;
}

#[test_log::test(tokio::test(start_paused = true))]
async fn test_stop_during_tool_dispatch_discards_result() {
    let mut tools = ToolDispatcher::new();
    tools.register(
        FunctionDeclaration::new("slowLookup", "Takes a while.", ParameterSchema::object()),
        SlowTool,
    );
    let mut h = Harness::build(vec![Step::Accept], FakeMicProvider::default(), tools, SpeechRateControl::default());
    h.session.start(AgentConfiguration::default()).unwrap();
    let mut server = h.next_server().await;

    server.send_json(tool_call("slow-1", "slowLookup", json!({}))).await;
    tokio::time::sleep(Duration::from_millis(100)).await;

    let stop_started = Instant::now();
    tokio::time::timeout(Duration::from_secs(1), h.session.stop())
        .await
        .expect("stop must not wait for the tool");
    assert!(Instant::now() - stop_started < Duration::from_secs(1));
    assert_eq!(h.session.state(), SessionState::Disconnected);

    tokio::time::sleep(Duration::from_secs(10)).await;
    server.assert_no_tool_response();
    assert_eq!(h.session.state(), SessionState::Disconnected);
}

#[test_log::test(tokio::test(start_paused = true))]
async fn test_start_ignores_previously_queued_config() {
    let mut h = Harness::new(vec![Step::Accept]);
    h.session.update_config(AgentConfiguration {
        voice: VoiceProfile::Kore,
        ..AgentConfiguration::default()
    });

    h.session.start(AgentConfiguration::default()).unwrap();
    let _server = h.next_server().await;
    h.wait_for_state(SessionState::Connected).await;

    assert_eq!(h.connector.voice_of_attempt(0), "Fenrir");
    assert_eq!(h.session.config().voice, VoiceProfile::Fenrir);
    h.session.stop().await;
}

#[test_log::test(tokio::test(start_paused = true))]
async fn test_repeated_stop_publishes_nothing_more() {
    let mut h = Harness::new(vec![Step::Accept]);
    h.session.start(AgentConfiguration::default()).unwrap();
    let _server = h.next_server().await;
    h.wait_for_state(SessionState::Connected).await;

    h.session.stop().await;
    h.session.stop().await;
    assert_eq!(h.session.state(), SessionState::Disconnected);
    assert_eq!(
        h.history(),
        vec![SessionState::Connecting, SessionState::Connected, SessionState::Disconnected]
    );
}

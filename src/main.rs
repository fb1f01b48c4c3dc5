use anyhow::{Context, Result};
use clap::Parser;
use live_agent_rs::{
    audio::{CpalMicrophoneProvider, CpalOutputProvider},
    catalog::StudyCatalog,
    config::{views_for, AgentConfiguration, ApiConfig, SpeechRate, SpeechRateControl, UserProfile, VoiceProfile, VIEWS},
    reconnect::ReconnectionPolicy,
    tools::{
        builtin::{register_builtin_tools, BuiltinCollaborators},
        collaborators::{CollaboratorError, NavigationTarget, Navigator},
        ToolDispatcher,
    },
    transport::WebSocketConnector,
    SessionComponents, SessionManager, SessionState,
};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader};

#[derive(Parser, Debug)]
#[command(name = "live-agent", about = "Real-time voice tutor over a live speech connection")]
struct Args {
    /// Prebuilt voice (Fenrir or Kore)
    #[arg(long, default_value = "Fenrir")]
    voice: VoiceProfile,

    /// Speech speed: slow, normal, fast (or 0.85, 1.0, 1.15)
    #[arg(long, default_value = "normal")]
    speed: SpeechRate,

    /// Extra instructions appended to the system instruction
    #[arg(long, default_value = "")]
    instructions: String,

    /// File with the text currently on the user's screen
    #[arg(long)]
    screen_context: Option<PathBuf>,

    /// JSON study catalog used for content lookup and table queries
    #[arg(long)]
    catalog: Option<PathBuf>,

    /// Pseudonym of the current user
    #[arg(long, default_value = "learner")]
    user: String,

    /// Input device name (default device if omitted)
    #[arg(long)]
    input_device: Option<String>,
}

/// Navigation has no screen to drive here, so it is printed
struct ConsoleNavigator;

impl Navigator for ConsoleNavigator {
    fn navigate(&self, target: NavigationTarget) -> Result<(), CollaboratorError> {
        println!(
            "🧭 → {}{}{}{}",
            target.view,
            target.id.map(|id| format!(" #{}", id)).unwrap_or_default(),
            target.sub_id.map(|id| format!("/{}", id)).unwrap_or_default(),
            target.term.map(|t| format!(" [{}]", t)).unwrap_or_default()
        );
        Ok(())
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::init();
    log::info!("🚀 Initializing live-agent");

    let args = Args::parse();
    let api = ApiConfig::load().context("Failed to load API configuration")?;
    let model = api.model.clone();

    let catalog = match &args.catalog {
        Some(path) => StudyCatalog::load(path).with_context(|| format!("Failed to load catalog {}", path.display()))?,
        None => StudyCatalog::default(),
    };
    let catalog = Arc::new(catalog);

    let screen_context = match &args.screen_context {
        Some(path) => Some(
            std::fs::read_to_string(path).with_context(|| format!("Failed to read {}", path.display()))?,
        ),
        None => None,
    };

    let user = UserProfile {
        pseudonym: args.user.clone(),
        level: 1,
        xp: 0,
    };
    let config = AgentConfiguration {
        voice: args.voice,
        speech_rate: args.speed,
        custom_instructions: args.instructions.clone(),
        screen_context,
        available_views: views_for(Some(&user)),
        user_profile: Some(user),
    };

    let speech_rate = SpeechRateControl::new(config.speech_rate);
    let mut tools = ToolDispatcher::new();
    register_builtin_tools(
        &mut tools,
        BuiltinCollaborators {
            navigator: Arc::new(ConsoleNavigator),
            lookup: catalog.clone(),
            data: catalog,
            views: VIEWS.iter().map(|v| v.to_string()).collect(),
            speech_rate: speech_rate.clone(),
        },
    );
    log::info!("🔧 {} tools registered", tools.len());

    let components = SessionComponents::new(
        Arc::new(WebSocketConnector::new(api)),
        Arc::new(CpalMicrophoneProvider::new(args.input_device.clone())),
        Arc::new(CpalOutputProvider),
        Arc::new(tools),
    )
    .with_speech_rate(speech_rate)
    .with_policy(ReconnectionPolicy::default())
    .with_model(model);

    let mut session = SessionManager::new(components);
    session.on_state_change(|state| println!("📶 {}", state));
    let mut states = session.subscribe();
    session.start(config)?;

    println!("🎧 Talk to the tutor. Commands: m = toggle mute, p = stop agent speech, q = quit");
    let mut stdin = BufReader::new(tokio::io::stdin()).lines();

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                println!("\n🛑 Ctrl+C received");
                break;
            }
            changed = states.changed() => {
                if changed.is_err() {
                    break;
                }
                let state = *states.borrow();
                if matches!(state, SessionState::Error | SessionState::Disconnected) {
                    println!("❌ Session ended ({})", state);
                    break;
                }
            }
            line = stdin.next_line() => {
                match line.context("Failed to read stdin")?.as_deref().map(str::trim) {
                    Some("m") => {
                        let muted = !session.is_muted();
                        session.set_muted(muted);
                        println!("{}", if muted { "🔇 Muted" } else { "🎤 Unmuted" });
                    }
                    Some("p") => session.stop_speech(),
                    Some("q") | None => break,
                    Some("") => {}
                    Some(other) => println!("Unknown command: {}", other),
                }
            }
        }
    }

    session.stop().await;
    let stats = session.capture_stats();
    log::info!(
        "👋 Bye ({} frames sent, {} dropped muted, {} dropped under backpressure)",
        stats.frames_sent,
        stats.dropped_muted,
        stats.dropped_backpressure
    );
    Ok(())
}

use secrecy::{ExposeSecret, SecretBox};
use serde::{Deserialize, Serialize};
use std::env;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use thiserror::Error;

pub const DEFAULT_LIVE_URL: &str =
    "wss://generativelanguage.googleapis.com/ws/google.ai.generativelanguage.v1beta.GenerativeService.BidiGenerateContent";
pub const DEFAULT_LIVE_MODEL: &str = "models/gemini-2.5-flash-native-audio-preview-09-2025";

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Missing required environment variable: {0}")]
    MissingEnvVar(String),
    #[error("Invalid API key format for {service}: {reason}")]
    InvalidKeyFormat { service: String, reason: String },
    #[error("Invalid value for {field}: {value}")]
    InvalidValue { field: String, value: String },
    #[error("Environment error: {0}")]
    EnvError(#[from] env::VarError),
}

/// Credentials and endpoint for the live speech service
#[derive(Debug)]
pub struct ApiConfig {
    pub gemini_key: SecretBox<String>,
    pub live_url: String,
    pub model: String,
}

impl ApiConfig {
    /// Load API configuration from environment variables
    pub fn load() -> Result<Self, ConfigError> {
        // Load .env file if it exists (for development)
        dotenvy::dotenv().ok();

        let gemini_key = Self::load_api_key("GEMINI_API_KEY", "Gemini")?;
        let live_url = env::var("GEMINI_LIVE_URL").unwrap_or_else(|_| DEFAULT_LIVE_URL.to_string());
        let model = env::var("GEMINI_LIVE_MODEL").unwrap_or_else(|_| DEFAULT_LIVE_MODEL.to_string());

        Ok(Self {
            gemini_key,
            live_url,
            model,
        })
    }

    /// Build a configuration from an explicit key (tests, embedding hosts)
    pub fn with_key(key: impl Into<String>) -> Self {
        Self {
            gemini_key: SecretBox::new(Box::new(key.into())),
            live_url: DEFAULT_LIVE_URL.to_string(),
            model: DEFAULT_LIVE_MODEL.to_string(),
        }
    }

    fn load_api_key(env_var: &str, service_name: &str) -> Result<SecretBox<String>, ConfigError> {
        let key = env::var(env_var).map_err(|_| ConfigError::MissingEnvVar(env_var.to_string()))?;
        Self::validate_key_format(&key, service_name)?;
        Ok(SecretBox::new(Box::new(key)))
    }

    fn validate_key_format(key: &str, service: &str) -> Result<(), ConfigError> {
        if key.trim().is_empty() {
            return Err(ConfigError::InvalidKeyFormat {
                service: service.to_string(),
                reason: "API key cannot be empty".to_string(),
            });
        }
        if key.chars().any(char::is_whitespace) {
            return Err(ConfigError::InvalidKeyFormat {
                service: service.to_string(),
                reason: "API key must not contain whitespace".to_string(),
            });
        }
        Ok(())
    }

    /// Get the Gemini API key (use only when opening a connection)
    pub fn gemini_key(&self) -> &str {
        self.gemini_key.expose_secret()
    }
}

/// Prebuilt voice used for synthesized speech
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, strum::Display, strum::EnumString,
)]
pub enum VoiceProfile {
    /// Male voice
    #[default]
    Fenrir,
    /// Female voice
    Kore,
}

/// Playback rate of the agent's speech. Only these three rates are accepted.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub enum SpeechRate {
    Slow,
    #[default]
    Normal,
    Fast,
}

impl SpeechRate {
    pub fn factor(self) -> f32 {
        match self {
            SpeechRate::Slow => 0.85,
            SpeechRate::Normal => 1.0,
            SpeechRate::Fast => 1.15,
        }
    }

    pub fn from_factor(factor: f64) -> Option<Self> {
        const EPS: f64 = 1e-6;
        if (factor - 0.85).abs() < EPS {
            Some(SpeechRate::Slow)
        } else if (factor - 1.0).abs() < EPS {
            Some(SpeechRate::Normal)
        } else if (factor - 1.15).abs() < EPS {
            Some(SpeechRate::Fast)
        } else {
            None
        }
    }
}

impl std::str::FromStr for SpeechRate {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "slow" => Ok(SpeechRate::Slow),
            "normal" => Ok(SpeechRate::Normal),
            "fast" => Ok(SpeechRate::Fast),
            other => other
                .parse::<f64>()
                .ok()
                .and_then(SpeechRate::from_factor)
                .ok_or_else(|| ConfigError::InvalidValue {
                    field: "speech rate".to_string(),
                    value: s.to_string(),
                }),
        }
    }
}

/// Current speech rate, shared between the session and the speed tool.
///
/// Survives reconnects: the agent can change its own speed mid-conversation and
/// the change applies to every chunk enqueued afterwards.
#[derive(Debug, Clone, Default)]
pub struct SpeechRateControl {
    rate: Arc<AtomicU8>,
}

impl SpeechRateControl {
    pub fn new(rate: SpeechRate) -> Self {
        let control = Self::default();
        control.set(rate);
        control
    }

    pub fn get(&self) -> SpeechRate {
        match self.rate.load(Ordering::Acquire) {
            0 => SpeechRate::Normal,
            1 => SpeechRate::Slow,
            _ => SpeechRate::Fast,
        }
    }

    pub fn set(&self, rate: SpeechRate) {
        let encoded = match rate {
            SpeechRate::Normal => 0,
            SpeechRate::Slow => 1,
            SpeechRate::Fast => 2,
        };
        self.rate.store(encoded, Ordering::Release);
    }
}

/// The learner the tutor is talking to
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UserProfile {
    pub pseudonym: String,
    pub level: u32,
    pub xp: u64,
}

impl UserProfile {
    pub fn is_admin(&self) -> bool {
        self.pseudonym == "admin"
    }
}

/// Per-connection agent settings supplied by the host.
///
/// Immutable for the lifetime of one connection attempt; the session picks up
/// changes queued with `SessionManager::update_config` on its next attempt.
#[derive(Debug, Clone, PartialEq)]
pub struct AgentConfiguration {
    pub voice: VoiceProfile,
    pub speech_rate: SpeechRate,
    pub custom_instructions: String,
    pub screen_context: Option<String>,
    pub user_profile: Option<UserProfile>,
    pub available_views: Vec<String>,
}

impl Default for AgentConfiguration {
    fn default() -> Self {
        Self {
            voice: VoiceProfile::default(),
            speech_rate: SpeechRate::default(),
            custom_instructions: String::new(),
            screen_context: None,
            user_profile: None,
            available_views: views_for(None),
        }
    }
}

/// Views of the study platform the agent can navigate to
pub const VIEWS: [&str; 12] = [
    "Questões",
    "Links/Arquivos",
    "Mídia",
    "Flashcards",
    "Resumos",
    "Perfil",
    "Mapas Mentais",
    "Comunidade",
    "Estudo de Caso",
    "Fontes",
    "Cronograma",
    "Admin",
];

const ADMIN_ONLY_VIEWS: [&str; 1] = ["Admin"];

/// Views visible to `user`; admin-only views are hidden from everyone else.
pub fn views_for(user: Option<&UserProfile>) -> Vec<String> {
    let is_admin = user.map(UserProfile::is_admin).unwrap_or(false);
    VIEWS
        .iter()
        .filter(|v| is_admin || !ADMIN_ONLY_VIEWS.contains(*v))
        .map(|v| v.to_string())
        .collect()
}

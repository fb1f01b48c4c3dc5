//! JSON messages exchanged with the live speech service.
//!
//! Outbound messages are externally tagged (`{"setup": {...}}`,
//! `{"realtimeInput": {...}}`, `{"toolResponse": {...}}`). Inbound messages
//! carry optional top-level sections; anything we do not understand is ignored.

use crate::audio::codec::{AudioFrame, AudioFrameCodec, INPUT_MIME_TYPE};
use crate::config::VoiceProfile;
use crate::tools::{FunctionDeclaration, ToolCallRequest, ToolCallResult};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

// --- Client → server ---

#[derive(Serialize, Debug, Clone)]
#[serde(rename_all = "camelCase")]
pub enum ClientMessage {
    Setup(SetupMessage),
    RealtimeInput(RealtimeInput),
    ToolResponse(ToolResponse),
}

impl ClientMessage {
    pub fn audio(frame: &AudioFrame) -> Self {
        ClientMessage::RealtimeInput(RealtimeInput {
            media_chunks: vec![Blob {
                mime_type: INPUT_MIME_TYPE.to_string(),
                data: AudioFrameCodec::to_wire(frame),
            }],
        })
    }

    /// Wrap a tool result; the payload is sent as a JSON-encoded string
    pub fn tool_response(result: &ToolCallResult) -> Self {
        ClientMessage::ToolResponse(ToolResponse {
            function_responses: vec![FunctionResponse {
                id: result.id.clone(),
                name: result.name.clone(),
                response: FunctionResponsePayload {
                    result: result.payload().to_string(),
                },
            }],
        })
    }

    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}

/// Sent once, immediately after the socket opens
#[derive(Serialize, Debug, Clone)]
#[serde(rename_all = "camelCase")]
pub struct SetupMessage {
    pub model: String,
    pub generation_config: GenerationConfig,
    pub system_instruction: Content,
    pub tools: Vec<ToolSet>,
}

impl SetupMessage {
    pub fn new(
        model: impl Into<String>,
        voice: VoiceProfile,
        system_instruction: impl Into<String>,
        declarations: Vec<FunctionDeclaration>,
    ) -> Self {
        Self {
            model: model.into(),
            generation_config: GenerationConfig {
                response_modalities: vec![ResponseModality::Audio],
                speech_config: SpeechConfig {
                    voice_config: VoiceConfig {
                        prebuilt_voice_config: PrebuiltVoiceConfig {
                            voice_name: voice.to_string(),
                        },
                    },
                },
            },
            system_instruction: Content {
                parts: vec![TextPart {
                    text: system_instruction.into(),
                }],
            },
            tools: vec![ToolSet {
                function_declarations: declarations,
            }],
        }
    }
}

#[derive(Serialize, Debug, Clone)]
#[serde(rename_all = "camelCase")]
pub struct GenerationConfig {
    pub response_modalities: Vec<ResponseModality>,
    pub speech_config: SpeechConfig,
}

#[derive(Serialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "UPPERCASE")]
pub enum ResponseModality {
    Audio,
}

#[derive(Serialize, Debug, Clone)]
#[serde(rename_all = "camelCase")]
pub struct SpeechConfig {
    pub voice_config: VoiceConfig,
}

#[derive(Serialize, Debug, Clone)]
#[serde(rename_all = "camelCase")]
pub struct VoiceConfig {
    pub prebuilt_voice_config: PrebuiltVoiceConfig,
}

#[derive(Serialize, Debug, Clone)]
#[serde(rename_all = "camelCase")]
pub struct PrebuiltVoiceConfig {
    pub voice_name: String,
}

#[derive(Serialize, Debug, Clone)]
pub struct Content {
    pub parts: Vec<TextPart>,
}

#[derive(Serialize, Debug, Clone)]
pub struct TextPart {
    pub text: String,
}

#[derive(Serialize, Debug, Clone)]
#[serde(rename_all = "camelCase")]
pub struct ToolSet {
    pub function_declarations: Vec<FunctionDeclaration>,
}

#[derive(Serialize, Debug, Clone)]
#[serde(rename_all = "camelCase")]
pub struct RealtimeInput {
    pub media_chunks: Vec<Blob>,
}

#[derive(Serialize, Debug, Clone)]
#[serde(rename_all = "camelCase")]
pub struct Blob {
    pub mime_type: String,
    pub data: String,
}

#[derive(Serialize, Debug, Clone)]
#[serde(rename_all = "camelCase")]
pub struct ToolResponse {
    pub function_responses: Vec<FunctionResponse>,
}

#[derive(Serialize, Debug, Clone)]
pub struct FunctionResponse {
    pub id: String,
    pub name: String,
    pub response: FunctionResponsePayload,
}

#[derive(Serialize, Debug, Clone)]
pub struct FunctionResponsePayload {
    pub result: String,
}

// --- Server → client ---

#[derive(Deserialize, Debug, Clone, Default)]
#[serde(rename_all = "camelCase")]
pub struct ServerMessage {
    pub setup_complete: Option<Value>,
    pub server_content: Option<ServerContent>,
    pub tool_call: Option<ToolCall>,
    pub tool_call_cancellation: Option<ToolCallCancellation>,
    pub go_away: Option<GoAway>,
}

impl ServerMessage {
    pub fn parse(text: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(text)
    }

    /// True when the user started talking over the agent
    pub fn is_interrupted(&self) -> bool {
        self.server_content
            .as_ref()
            .and_then(|c| c.interrupted)
            .unwrap_or(false)
    }

    /// Base64 audio payloads of the model turn, in order
    pub fn audio_chunks(&self) -> impl Iterator<Item = &str> {
        self.server_content
            .iter()
            .filter_map(|c| c.model_turn.as_ref())
            .flat_map(|turn| turn.parts.iter())
            .filter_map(|part| part.inline_data.as_ref())
            .filter(|blob| {
                blob.mime_type
                    .as_deref()
                    .map(|m| m.starts_with("audio/"))
                    .unwrap_or(true)
            })
            .map(|blob| blob.data.as_str())
    }

    pub fn tool_requests(&self) -> Vec<ToolCallRequest> {
        self.tool_call
            .iter()
            .flat_map(|call| call.function_calls.iter())
            .map(|fc| ToolCallRequest {
                id: fc.id.clone(),
                name: fc.name.clone(),
                arguments: fc.args.clone(),
            })
            .collect()
    }
}

#[derive(Deserialize, Debug, Clone, Default)]
#[serde(rename_all = "camelCase")]
pub struct ServerContent {
    pub model_turn: Option<ModelTurn>,
    pub interrupted: Option<bool>,
    pub turn_complete: Option<bool>,
}

#[derive(Deserialize, Debug, Clone, Default)]
pub struct ModelTurn {
    #[serde(default)]
    pub parts: Vec<ServerPart>,
}

#[derive(Deserialize, Debug, Clone, Default)]
#[serde(rename_all = "camelCase")]
pub struct ServerPart {
    pub text: Option<String>,
    pub inline_data: Option<InlineData>,
}

#[derive(Deserialize, Debug, Clone)]
#[serde(rename_all = "camelCase")]
pub struct InlineData {
    pub mime_type: Option<String>,
    pub data: String,
}

#[derive(Deserialize, Debug, Clone, Default)]
#[serde(rename_all = "camelCase")]
pub struct ToolCall {
    #[serde(default)]
    pub function_calls: Vec<FunctionCall>,
}

#[derive(Deserialize, Debug, Clone)]
pub struct FunctionCall {
    #[serde(default)]
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub args: Map<String, Value>,
}

#[derive(Deserialize, Debug, Clone, Default)]
pub struct ToolCallCancellation {
    #[serde(default)]
    pub ids: Vec<String>,
}

#[derive(Deserialize, Debug, Clone, Default)]
#[serde(rename_all = "camelCase")]
pub struct GoAway {
    pub time_left: Option<String>,
}

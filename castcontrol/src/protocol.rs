//! Control-protocol wire frames and the permission manifest.
//!
//! Every message on the control channel is a JSON object with a `type` field
//! and optional `id`, `uri`, `payload` and `error` fields. The client speaks
//! `hello`, `register`, `request`, `subscribe` and `unsubscribe`; the device
//! answers with `hello`, `registered`, `response` and `error`.

use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::{Value, json};

pub const FRAME_HELLO: &str = "hello";
pub const FRAME_REGISTER: &str = "register";
pub const FRAME_REGISTERED: &str = "registered";
pub const FRAME_REQUEST: &str = "request";
pub const FRAME_SUBSCRIBE: &str = "subscribe";
pub const FRAME_UNSUBSCRIBE: &str = "unsubscribe";
pub const FRAME_RESPONSE: &str = "response";
pub const FRAME_ERROR: &str = "error";

/// Endpoint for submitting a pairing PIN displayed on the device.
pub const PAIRING_SET_PIN_URI: &str = "ssap://pairing/setPin";

/// One JSON message on the control channel.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Frame {
    #[serde(rename = "type")]
    pub frame_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub uri: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl Frame {
    pub fn hello(id: u64, identity: &ClientIdentity) -> Self {
        Self {
            frame_type: FRAME_HELLO.to_string(),
            id: Some(id),
            payload: serde_json::to_value(identity).ok(),
            ..Default::default()
        }
    }

    /// The registration request. Carries the persisted client key when one
    /// exists, otherwise a pairing-type hint for the first pairing.
    pub fn register(
        id: u64,
        client_key: Option<&str>,
        pairing_type: PairingType,
        manifest: &Manifest,
    ) -> Self {
        let mut payload = json!({
            "manifest": manifest,
        });
        if let Some(key) = client_key {
            payload["client-key"] = Value::String(key.to_string());
        } else if let Some(wire) = pairing_type.as_wire() {
            payload["pairingType"] = Value::String(wire.to_string());
        }
        Self {
            frame_type: FRAME_REGISTER.to_string(),
            id: Some(id),
            payload: Some(payload),
            ..Default::default()
        }
    }

    pub fn request(id: u64, uri: &str, payload: Option<Value>) -> Self {
        Self {
            frame_type: FRAME_REQUEST.to_string(),
            id: Some(id),
            uri: Some(uri.to_string()),
            payload,
            ..Default::default()
        }
    }

    pub fn unsubscribe(id: u64) -> Self {
        Self {
            frame_type: FRAME_UNSUBSCRIBE.to_string(),
            id: Some(id),
            ..Default::default()
        }
    }

    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}

/// How the device asks the user to confirm a pairing.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum PairingType {
    /// Key exchange without user interaction.
    #[default]
    None,
    /// On-screen accept/reject dialog.
    Prompt,
    /// PIN displayed on the device, submitted via [`PAIRING_SET_PIN_URI`].
    Pin,
}

impl PairingType {
    pub fn from_wire(value: &str) -> Self {
        match value.to_ascii_uppercase().as_str() {
            "PROMPT" => Self::Prompt,
            "PIN" => Self::Pin,
            _ => Self::None,
        }
    }

    /// Only the PIN hint goes on the wire; a prompt is the device default.
    pub fn as_wire(self) -> Option<&'static str> {
        match self {
            Self::Pin => Some("PIN"),
            _ => None,
        }
    }
}

/// Permission manifest sent with the `register` frame.
#[derive(Debug, Clone, Serialize)]
pub struct Manifest {
    #[serde(rename = "manifestVersion")]
    pub manifest_version: u32,
    pub permissions: Vec<String>,
}

impl Default for Manifest {
    fn default() -> Self {
        Self {
            manifest_version: 1,
            permissions: default_permissions(),
        }
    }
}

/// Permission set requested by default: enough for launch, media playback
/// and basic status reads.
pub fn default_permissions() -> Vec<String> {
    [
        "LAUNCH",
        "LAUNCH_WEBAPP",
        "APP_TO_APP",
        "CONTROL_AUDIO",
        "CONTROL_DISPLAY",
        "CONTROL_INPUT_MEDIA_PLAYBACK",
        "CONTROL_INPUT_MEDIA_RECORDING",
        "CONTROL_INPUT_TEXT",
        "CONTROL_MOUSE_AND_KEYBOARD",
        "CONTROL_POWER",
        "READ_APP_STATUS",
        "READ_CURRENT_CHANNEL",
        "READ_INPUT_DEVICE_LIST",
        "READ_INSTALLED_APPS",
        "READ_NETWORK_STATE",
        "READ_RUNNING_APPS",
        "READ_TV_CHANNEL_LIST",
        "WRITE_NOTIFICATION_TOAST",
    ]
    .iter()
    .map(|p| p.to_string())
    .collect()
}

/// Identity metadata sent in the `hello` frame.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClientIdentity {
    pub app_id: String,
    pub app_name: String,
    pub app_version: String,
    pub device_model: String,
    #[serde(rename = "OSVersion")]
    pub os_version: String,
}

impl Default for ClientIdentity {
    fn default() -> Self {
        Self {
            app_id: "com.castlink.client".to_string(),
            app_name: "CastLink".to_string(),
            app_version: env!("CARGO_PKG_VERSION").to_string(),
            device_model: String::new(),
            os_version: String::new(),
        }
    }
}

/// Application-level error returned by the device or synthesized locally.
#[derive(Debug, Clone, PartialEq)]
pub struct CommandError {
    pub code: i32,
    pub message: String,
    pub detail: Option<Value>,
}

impl CommandError {
    pub fn new(code: i32, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            detail: None,
        }
    }

    pub fn connection_lost() -> Self {
        Self::new(0, "connection lost")
    }

    /// Parse the `"<code> <description>"` format of `error` frames. A
    /// missing or non-numeric code yields code 0 with the raw text as the
    /// message.
    pub fn parse(raw: &str) -> Self {
        let raw = raw.trim();
        if let Some((code, rest)) = raw.split_once(' ') {
            if let Ok(code) = code.parse::<i32>() {
                return Self::new(code, rest.trim());
            }
        }
        if let Ok(code) = raw.parse::<i32>() {
            return Self::new(code, "");
        }
        Self::new(0, raw)
    }
}

impl fmt::Display for CommandError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] {}", self.code, self.message)
    }
}

impl std::error::Error for CommandError {}

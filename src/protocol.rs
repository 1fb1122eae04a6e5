use anyhow::Context;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::identity::Role;
use crate::player::PlayerState;
use crate::sync::ProfileSyncPayload;

/// Messages exchanged between controller and player over the session
/// transport. Command payloads are opaque to this layer and forwarded
/// verbatim to the playback engine on the receiving side.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload", rename_all = "snake_case")]
pub enum Message {
    PairRequest(PairRequest),
    PairResponse(PairResponse),
    Playback(Value),
    Audio(Value),
    Video(Value),
    Subtitle(Value),
    Window(Value),
    Shortcut(Value),
    Open(Value),
    ProfileSync(ProfileSyncPayload),
    StateUpdate(PlayerState),
}

/// Sent by the player right after the transport connects.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PairRequest {
    pub device_id: String,
    pub device_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pin: Option<String>,
}

/// Operator's pairing verdict, carrying the controller's identity on accept.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PairResponse {
    pub accepted: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub device_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub device_name: Option<String>,
}

/// Body served at `GET /api/discover` and expected from probed hosts.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DiscoverResponse {
    pub role: Role,
    pub device_id: String,
    pub device_name: String,
    pub port: u16,
    pub version: String,
}

/// Outcome of decoding an inbound frame. A well-formed envelope whose type
/// (or payload shape) this build does not understand is `Unknown`, never an
/// error, so an older peer survives a newer one.
#[derive(Debug)]
pub enum Decoded {
    Known(Message),
    Unknown(String),
}

impl Message {
    pub fn decode(text: &str) -> anyhow::Result<Decoded> {
        let value: Value = serde_json::from_str(text).context("malformed message envelope")?;
        match serde_json::from_value::<Message>(value.clone()) {
            Ok(msg) => Ok(Decoded::Known(msg)),
            Err(_) => {
                let kind = value
                    .get("type")
                    .and_then(|v| v.as_str())
                    .unwrap_or("<missing type>")
                    .to_string();
                Ok(Decoded::Unknown(kind))
            }
        }
    }

    pub fn encode(&self) -> anyhow::Result<String> {
        serde_json::to_string(self).context("failed to serialize message")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn envelope_uses_type_and_payload_keys() {
        let msg = Message::PairRequest(PairRequest {
            device_id: "dev-1".into(),
            device_name: "Living Room".into(),
            pin: None,
        });
        let value: Value = serde_json::from_str(&msg.encode().unwrap()).unwrap();
        assert_eq!(value["type"], "pair_request");
        assert_eq!(value["payload"]["deviceId"], "dev-1");
        assert_eq!(value["payload"]["deviceName"], "Living Room");
        assert!(value["payload"].get("pin").is_none());
    }

    #[test]
    fn command_payloads_stay_opaque() {
        let text = json!({
            "type": "playback",
            "payload": {"action": "seek", "time": 4213.5, "weird": [1, 2]}
        })
        .to_string();
        match Message::decode(&text).unwrap() {
            Decoded::Known(Message::Playback(options)) => {
                assert_eq!(options["action"], "seek");
                assert_eq!(options["weird"][1], 2);
            }
            other => panic!("unexpected decode: {other:?}"),
        }
    }

    #[test]
    fn unknown_type_is_tolerated() {
        let text = json!({"type": "hologram", "payload": {"x": 1}}).to_string();
        match Message::decode(&text).unwrap() {
            Decoded::Unknown(kind) => assert_eq!(kind, "hologram"),
            other => panic!("unexpected decode: {other:?}"),
        }
    }

    #[test]
    fn malformed_json_is_an_error() {
        assert!(Message::decode("{\"type\": ").is_err());
    }

    #[test]
    fn discover_response_wire_shape() {
        let body: DiscoverResponse = serde_json::from_value(json!({
            "role": "controller",
            "deviceId": "abc",
            "deviceName": "Desk",
            "port": 8901,
            "version": "1.4.0"
        }))
        .unwrap();
        assert_eq!(body.role, Role::Controller);
        assert_eq!(body.port, 8901);
    }
}

//! Wire format for the live channel.
//!
//! Every frame is a JSON object tagged by `type`. Outgoing frames are the
//! three control messages in [`ControlFrame`]; incoming frames are decoded
//! into a [`Frame`] envelope whose `data` stays opaque.

use bon::Builder;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::error::WsError;
use crate::Result;

/// Identifier of a buying group, used as the subscription topic.
pub type GroupId = i64;

/// Control frame sent from the client to the server.
#[non_exhaustive]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ControlFrame {
    /// Start receiving updates for a group
    Subscribe { group_id: GroupId },
    /// Stop receiving updates for a group
    Unsubscribe { group_id: GroupId },
    /// One-way liveness signal
    Ping,
}

impl ControlFrame {
    /// Serialize into the JSON text sent on the wire.
    pub fn encode(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }
}

/// Inbound frame envelope: `{"type": <string>, "data": <any>}`.
#[non_exhaustive]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Builder)]
pub struct Frame {
    /// Message type used to route the frame to listeners
    #[serde(rename = "type")]
    #[builder(into)]
    pub frame_type: String,
    /// Event payload, `null` when absent
    #[serde(default)]
    #[builder(default)]
    pub data: Value,
}

impl Frame {
    /// Deserialize the payload into a concrete type.
    pub fn decode<T: DeserializeOwned>(&self) -> Result<T> {
        serde_json::from_value(self.data.clone())
            .map_err(|e| WsError::MessageParse(e).into())
    }
}

/// Parse a text frame received from the server.
pub fn parse_frame(bytes: &[u8]) -> Result<Frame> {
    serde_json::from_slice(bytes).map_err(|e| WsError::MessageParse(e).into())
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::error::Kind;

    #[test]
    fn control_frames_match_wire_format() {
        assert_eq!(
            ControlFrame::Subscribe { group_id: 42 }.encode().unwrap(),
            r#"{"type":"subscribe","group_id":42}"#
        );
        assert_eq!(
            ControlFrame::Unsubscribe { group_id: 7 }.encode().unwrap(),
            r#"{"type":"unsubscribe","group_id":7}"#
        );
        assert_eq!(ControlFrame::Ping.encode().unwrap(), r#"{"type":"ping"}"#);
    }

    #[test]
    fn parse_progress_update() {
        let frame =
            parse_frame(br#"{"type":"progress_update","data":{"current_quantity":7}}"#).unwrap();

        assert_eq!(frame.frame_type, "progress_update");
        assert_eq!(frame.data, json!({"current_quantity": 7}));
    }

    #[test]
    fn missing_data_is_null() {
        let frame = parse_frame(br#"{"type":"group_closed"}"#).unwrap();

        assert_eq!(frame.frame_type, "group_closed");
        assert!(frame.data.is_null(), "absent data should decode as null");
    }

    #[test]
    fn malformed_json_is_a_websocket_error() {
        let err = parse_frame(b"not json").unwrap_err();

        assert_eq!(err.kind(), Kind::WebSocket);
        assert!(matches!(
            err.downcast_ref::<WsError>(),
            Some(WsError::MessageParse(_))
        ));
    }

    #[test]
    fn frame_without_type_is_rejected() {
        parse_frame(br#"{"data":{}}"#).unwrap_err();
        parse_frame(b"[1,2,3]").unwrap_err();
    }

    #[test]
    fn decode_typed_payload() {
        #[derive(Debug, Deserialize, PartialEq)]
        struct Progress {
            current_quantity: u32,
            participant_count: u32,
        }

        let frame = Frame::builder()
            .frame_type("progress_update")
            .data(json!({"current_quantity": 12, "participant_count": 4}))
            .build();

        let progress: Progress = frame.decode().unwrap();
        assert_eq!(
            progress,
            Progress {
                current_quantity: 12,
                participant_count: 4
            }
        );
    }
}

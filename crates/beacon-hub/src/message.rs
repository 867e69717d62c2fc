//! Wire message envelope.
//!
//! Inbound frames carry a JSON envelope `{"type", "channel"?, "data"?}`
//! decoded into an [`Envelope`]. Outbound frames are built from a pooled
//! [`Frame`], stamped by the hub at dispatch time and serialized once per
//! fan-out.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::time::{SystemTime, UNIX_EPOCH};

use crate::error::{HubError, HubResult};
use crate::pool::Poolable;

/// The kind tag of a wire message.
///
/// Unrecognized tags deserialize to [`FrameKind::Unknown`] and are ignored
/// by the hub, so forward-compatible clients can send new kinds without
/// breaking older servers.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FrameKind {
    /// Subscribe the sending client to a channel.
    Subscribe,
    /// Remove the sending client from a channel.
    Unsubscribe,
    /// Fan a payload out to a channel's subscribers.
    Publish,
    /// Fan a payload out to every connected client.
    Broadcast,
    /// Add the sending client to a room.
    JoinRoom,
    /// Remove the sending client from a room.
    LeaveRoom,
    /// A data frame delivered to a client.
    Data,
    /// Any tag this hub does not recognize.
    #[default]
    #[serde(other)]
    Unknown,
}

/// An inbound wire envelope as sent by a client.
#[derive(Debug, Clone, Deserialize)]
pub struct Envelope {
    /// The message kind tag.
    #[serde(rename = "type")]
    pub kind: FrameKind,
    /// Target channel or room id, when the kind needs one.
    #[serde(default)]
    pub channel: Option<String>,
    /// Opaque payload, typically a JSON object.
    #[serde(default)]
    pub data: Value,
}

impl Envelope {
    /// Parse an envelope from raw frame bytes.
    pub fn parse(raw: &[u8]) -> HubResult<Self> {
        serde_json::from_slice(raw).map_err(|e| HubError::decode(e.to_string()))
    }
}

/// A pooled outbound message envelope.
///
/// Acquired from the message pool before dispatch, filled in, serialized
/// with [`Frame::to_wire`], and released once the rendered text has been
/// handed to the fan-out path. Releasing zeroes every field.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Frame {
    /// The message kind.
    pub kind: FrameKind,
    /// Channel or room the payload belongs to, if any.
    pub channel: Option<String>,
    /// Opaque payload.
    pub payload: Value,
    /// Dispatch instant as epoch milliseconds; set by [`Frame::stamp`].
    pub timestamp_ms: Option<u64>,
    /// Id of the client the payload originated from. Set by the hub when
    /// dispatching, never by the sender.
    pub origin: Option<String>,
}

/// Serialized shape of an outbound frame. Optional fields are omitted.
#[derive(Serialize)]
struct WireFrame<'a> {
    #[serde(rename = "type")]
    kind: FrameKind,
    #[serde(skip_serializing_if = "Option::is_none")]
    channel: Option<&'a str>,
    data: &'a Value,
    #[serde(rename = "ts", skip_serializing_if = "Option::is_none")]
    timestamp_ms: Option<u64>,
    #[serde(rename = "from", skip_serializing_if = "Option::is_none")]
    origin: Option<&'a str>,
}

impl Frame {
    /// Record the current instant as the frame's dispatch timestamp.
    pub fn stamp(&mut self) {
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default();
        self.timestamp_ms = Some(now.as_millis() as u64);
    }

    /// Serialize the frame to its wire representation.
    pub fn to_wire(&self) -> HubResult<String> {
        let wire = WireFrame {
            kind: self.kind,
            channel: self.channel.as_deref(),
            data: &self.payload,
            timestamp_ms: self.timestamp_ms,
            origin: self.origin.as_deref(),
        };
        serde_json::to_string(&wire).map_err(|e| HubError::encode(e.to_string()))
    }
}

impl Poolable for Frame {
    fn reset(&mut self) {
        *self = Self::default();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_parse_full_envelope() {
        let raw = br#"{"type":"publish","channel":"news","data":{"headline":"x"}}"#;
        let envelope = Envelope::parse(raw).unwrap();
        assert_eq!(envelope.kind, FrameKind::Publish);
        assert_eq!(envelope.channel.as_deref(), Some("news"));
        assert_eq!(envelope.data, json!({"headline": "x"}));
    }

    #[test]
    fn test_parse_minimal_envelope() {
        let envelope = Envelope::parse(br#"{"type":"broadcast"}"#).unwrap();
        assert_eq!(envelope.kind, FrameKind::Broadcast);
        assert!(envelope.channel.is_none());
        assert_eq!(envelope.data, Value::Null);
    }

    #[test]
    fn test_unrecognized_type_is_tolerated() {
        let envelope = Envelope::parse(br#"{"type":"telemetry_v9"}"#).unwrap();
        assert_eq!(envelope.kind, FrameKind::Unknown);
    }

    #[test]
    fn test_parse_rejects_malformed_json() {
        let err = Envelope::parse(b"{not json").unwrap_err();
        assert!(matches!(err, HubError::Decode(_)));
    }

    #[test]
    fn test_frame_kind_wire_names() {
        assert_eq!(
            serde_json::to_string(&FrameKind::JoinRoom).unwrap(),
            "\"join_room\""
        );
        assert_eq!(serde_json::to_string(&FrameKind::Data).unwrap(), "\"data\"");
    }

    #[test]
    fn test_to_wire_omits_absent_fields() {
        let frame = Frame {
            kind: FrameKind::Data,
            payload: json!({"n": 1}),
            ..Frame::default()
        };
        let text = frame.to_wire().unwrap();
        assert_eq!(text, r#"{"type":"data","data":{"n":1}}"#);
    }

    #[test]
    fn test_to_wire_full() {
        let mut frame = Frame {
            kind: FrameKind::Data,
            channel: Some("news".to_string()),
            payload: json!({"headline": "x"}),
            origin: Some("c1".to_string()),
            ..Frame::default()
        };
        frame.stamp();

        let parsed: Value = serde_json::from_str(&frame.to_wire().unwrap()).unwrap();
        assert_eq!(parsed["type"], "data");
        assert_eq!(parsed["channel"], "news");
        assert_eq!(parsed["data"], json!({"headline": "x"}));
        assert_eq!(parsed["from"], "c1");
        assert!(parsed["ts"].as_u64().unwrap() > 0);
    }

    #[test]
    fn test_reset_zeroes_every_field() {
        let mut frame = Frame {
            kind: FrameKind::Publish,
            channel: Some("ch".to_string()),
            payload: json!([1, 2, 3]),
            timestamp_ms: Some(42),
            origin: Some("c9".to_string()),
        };
        frame.reset();
        assert_eq!(frame, Frame::default());
        assert_eq!(frame.kind, FrameKind::Unknown);
        assert_eq!(frame.payload, Value::Null);
    }
}

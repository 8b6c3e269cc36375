//! WebSocket wire protocol: tagged client/server messages plus the
//! schema validation applied to every inbound frame.
//!
//! Inbound frames are JSON text with a required `type` tag drawn from a
//! closed set. Anything else is a `VALIDATION_ERROR`; frames that fail to
//! parse at all are `INVALID_JSON`. Neither closes the socket.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use lattice_types::{AnchorType, ColocalizationMethod, CoordinateSystem, Quat, TrackingState};

use crate::anchors::SpatialAnchor;

/// Maximum serialized metadata size (bytes)
pub const MAX_METADATA_BYTES: usize = 5 * 1024;
/// Accepted clock skew for message timestamps (ms)
pub const MAX_TIMESTAMP_SKEW_MS: i64 = 60_000;
/// Coordinate magnitude bound (meters)
pub const MAX_COORDINATE: f64 = 1000.0;

// ── Client → Server ───────────────────────────────────────────────────────────

/// Pose payload carried by `pose_update`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PoseData {
    pub position: [f64; 3],
    /// Quaternion [x, y, z, w]
    pub rotation: [f64; 4],
    pub confidence: f64,
    #[serde(default)]
    pub tracking_state: TrackingState,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    PoseUpdate {
        timestamp: i64,
        pose: PoseData,
    },
    AnchorCreate {
        timestamp: i64,
        anchor_id: String,
        position: [f64; 3],
        rotation: [f64; 4],
        #[serde(default)]
        anchor_type: AnchorType,
        #[serde(default)]
        metadata: Option<Value>,
        #[serde(default)]
        lifetime_hours: Option<f64>,
    },
    AnchorUpdate {
        timestamp: i64,
        anchor_id: String,
        #[serde(default)]
        position: Option<[f64; 3]>,
        #[serde(default)]
        rotation: Option<[f64; 4]>,
        #[serde(default)]
        confidence: Option<f64>,
        #[serde(default)]
        tracking_state: Option<TrackingState>,
        #[serde(default)]
        metadata: Option<Value>,
    },
    AnchorDelete {
        timestamp: i64,
        anchor_id: String,
    },
    ColocalizationData {
        timestamp: i64,
        #[serde(default)]
        colocalized: Option<bool>,
        #[serde(default)]
        method: Option<ColocalizationMethod>,
        #[serde(default)]
        coordinate_system: Option<CoordinateSystem>,
    },
    ChatMessage {
        timestamp: i64,
        message: String,
    },
    Ping {
        timestamp: i64,
    },
    Pong {
        timestamp: i64,
        #[serde(default)]
        client_timestamp: Option<i64>,
    },
    SubscribeAnchor {
        timestamp: i64,
        anchor_id: String,
    },
    UnsubscribeAnchor {
        timestamp: i64,
        anchor_id: String,
    },
}

impl ClientMessage {
    pub fn timestamp(&self) -> i64 {
        match self {
            Self::PoseUpdate { timestamp, .. }
            | Self::AnchorCreate { timestamp, .. }
            | Self::AnchorUpdate { timestamp, .. }
            | Self::AnchorDelete { timestamp, .. }
            | Self::ColocalizationData { timestamp, .. }
            | Self::ChatMessage { timestamp, .. }
            | Self::Ping { timestamp }
            | Self::Pong { timestamp, .. }
            | Self::SubscribeAnchor { timestamp, .. }
            | Self::UnsubscribeAnchor { timestamp, .. } => *timestamp,
        }
    }
}

// ── Server → Client ───────────────────────────────────────────────────────────

/// Roster entry inside `session_state` and presence events.
#[derive(Debug, Clone, Serialize)]
pub struct PlayerInfo {
    pub user_id: String,
    pub display_name: String,
    pub is_host: bool,
    pub is_anonymous: bool,
    pub colocalized: bool,
    pub join_time: f64,
}

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    SessionState {
        session_id: String,
        coordinate_system: Option<CoordinateSystem>,
        colocalization_method: ColocalizationMethod,
        is_colocalized: bool,
        anchors: Vec<SpatialAnchor>,
        players: Vec<PlayerInfo>,
        timestamp: i64,
    },
    UserJoined {
        user_id: String,
        display_name: String,
        is_host: bool,
        is_anonymous: bool,
        #[serde(skip_serializing_if = "Option::is_none")]
        colocalized: Option<bool>,
        timestamp: i64,
    },
    UserLeft {
        user_id: String,
        timestamp: i64,
    },
    PoseUpdate {
        user_id: String,
        pose: PoseData,
        timestamp: i64,
    },
    AnchorCreated {
        anchor: SpatialAnchor,
        timestamp: i64,
    },
    AnchorUpdated {
        anchor: SpatialAnchor,
        timestamp: i64,
    },
    AnchorDeleted {
        anchor_id: String,
        timestamp: i64,
    },
    InitialAnchors {
        anchors: Vec<SpatialAnchor>,
        batch_index: usize,
        total_batches: usize,
        total_anchors: usize,
        timestamp: i64,
    },
    AnchorState {
        anchor: SpatialAnchor,
        timestamp: i64,
    },
    #[serde(rename = "coordinate_system")]
    CoordinateSystemUpdate {
        coordinate_system: CoordinateSystem,
        colocalization_method: ColocalizationMethod,
        is_colocalized: bool,
        timestamp: i64,
    },
    ChatMessage {
        user_id: String,
        display_name: String,
        message: String,
        timestamp: i64,
    },
    Pong {
        timestamp: i64,
        client_timestamp: Option<i64>,
    },
    Error {
        error: bool,
        code: &'static str,
        message: String,
        timestamp: i64,
    },
}

impl ServerMessage {
    pub fn error(code: &'static str, message: impl Into<String>) -> Self {
        Self::Error {
            error: true,
            code,
            message: message.into(),
            timestamp: crate::util::now_ms(),
        }
    }
}

// ── Validation ────────────────────────────────────────────────────────────────

#[derive(Debug)]
pub enum MessageError {
    InvalidJson,
    Validation(String),
}

impl MessageError {
    pub fn to_frame(&self) -> ServerMessage {
        match self {
            Self::InvalidJson => ServerMessage::error("INVALID_JSON", "invalid JSON format"),
            Self::Validation(detail) => {
                ServerMessage::error("VALIDATION_ERROR", format!("validation error: {detail}"))
            }
        }
    }
}

/// Parse and validate one inbound frame against the closed message set.
pub fn parse_client_message(text: &str, now_ms: i64) -> Result<ClientMessage, MessageError> {
    let value: Value = serde_json::from_str(text).map_err(|_| MessageError::InvalidJson)?;
    let message: ClientMessage = serde_json::from_value(value)
        .map_err(|e| MessageError::Validation(e.to_string()))?;
    validate(&message, now_ms)?;
    Ok(message)
}

fn validate(message: &ClientMessage, now_ms: i64) -> Result<(), MessageError> {
    check_timestamp(message.timestamp(), now_ms)?;

    match message {
        ClientMessage::PoseUpdate { pose, .. } => {
            check_position(&pose.position)?;
            check_rotation(&pose.rotation)?;
            check_confidence(pose.confidence)?;
        }
        ClientMessage::AnchorCreate {
            anchor_id,
            position,
            rotation,
            metadata,
            lifetime_hours,
            ..
        } => {
            check_anchor_id(anchor_id)?;
            check_position(position)?;
            check_rotation(rotation)?;
            check_metadata(metadata.as_ref())?;
            if let Some(hours) = lifetime_hours {
                if !hours.is_finite() || *hours <= 0.0 {
                    return Err(MessageError::Validation(
                        "lifetime_hours must be positive".into(),
                    ));
                }
            }
        }
        ClientMessage::AnchorUpdate {
            anchor_id,
            position,
            rotation,
            confidence,
            tracking_state,
            metadata,
            ..
        } => {
            check_anchor_id(anchor_id)?;
            if let Some(p) = position {
                check_position(p)?;
            }
            if let Some(r) = rotation {
                check_rotation(r)?;
            }
            if let Some(c) = confidence {
                check_confidence(*c)?;
            }
            if let Some(state) = tracking_state {
                if !state.is_anchor_state() {
                    return Err(MessageError::Validation(format!(
                        "tracking_state {state:?} is not valid for anchors"
                    )));
                }
            }
            check_metadata(metadata.as_ref())?;
        }
        ClientMessage::AnchorDelete { anchor_id, .. }
        | ClientMessage::SubscribeAnchor { anchor_id, .. }
        | ClientMessage::UnsubscribeAnchor { anchor_id, .. } => {
            check_anchor_id(anchor_id)?;
        }
        ClientMessage::ChatMessage { message, .. } => {
            check_chat_message(message)?;
        }
        ClientMessage::ColocalizationData { coordinate_system, .. } => {
            if let Some(cs) = coordinate_system {
                check_position(&cs.origin.to_array())?;
                check_rotation(&cs.rotation.to_array())?;
            }
        }
        ClientMessage::Ping { .. } | ClientMessage::Pong { .. } => {}
    }

    Ok(())
}

fn check_timestamp(timestamp: i64, now_ms: i64) -> Result<(), MessageError> {
    if timestamp <= 0 {
        return Err(MessageError::Validation("timestamp must be positive".into()));
    }
    if (timestamp - now_ms).abs() > MAX_TIMESTAMP_SKEW_MS {
        return Err(MessageError::Validation(
            "timestamp is too far from server time".into(),
        ));
    }
    Ok(())
}

pub(crate) fn check_position(position: &[f64; 3]) -> Result<(), MessageError> {
    for c in position {
        if !c.is_finite() || c.abs() > MAX_COORDINATE {
            return Err(MessageError::Validation(format!(
                "coordinate {c} out of bounds (±{MAX_COORDINATE})"
            )));
        }
    }
    Ok(())
}

pub(crate) fn check_rotation(rotation: &[f64; 4]) -> Result<(), MessageError> {
    for c in rotation {
        if !c.is_finite() || c.abs() > 1.0 {
            return Err(MessageError::Validation(format!(
                "quaternion component {c} out of [-1, 1]"
            )));
        }
    }
    let q = Quat::from(*rotation);
    if !q.is_normalized() {
        return Err(MessageError::Validation(format!(
            "quaternion is not normalized (norm {:.4})",
            q.norm()
        )));
    }
    Ok(())
}

fn check_confidence(confidence: f64) -> Result<(), MessageError> {
    if !confidence.is_finite() || !(0.0..=1.0).contains(&confidence) {
        return Err(MessageError::Validation(format!(
            "confidence {confidence} out of [0, 1]"
        )));
    }
    Ok(())
}

fn check_anchor_id(anchor_id: &str) -> Result<(), MessageError> {
    let valid_len = !anchor_id.is_empty() && anchor_id.len() <= 50;
    let valid_chars = anchor_id
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-');
    if !valid_len || !valid_chars {
        return Err(MessageError::Validation(
            "anchor_id must match [A-Za-z0-9_-]{1,50}".into(),
        ));
    }
    Ok(())
}

pub(crate) fn check_metadata(metadata: Option<&Value>) -> Result<(), MessageError> {
    let Some(metadata) = metadata else {
        return Ok(());
    };
    if !metadata.is_object() && !metadata.is_null() {
        return Err(MessageError::Validation("metadata must be an object".into()));
    }
    let serialized = serde_json::to_string(metadata)
        .map_err(|_| MessageError::Validation("metadata is not serializable".into()))?;
    if serialized.len() > MAX_METADATA_BYTES {
        return Err(MessageError::Validation(format!(
            "metadata too large ({} > {MAX_METADATA_BYTES} bytes)",
            serialized.len()
        )));
    }
    Ok(())
}

fn check_chat_message(message: &str) -> Result<(), MessageError> {
    let trimmed = message.trim();
    if trimmed.is_empty() {
        return Err(MessageError::Validation("message cannot be empty".into()));
    }
    if trimmed.chars().count() > 500 {
        return Err(MessageError::Validation("message exceeds 500 characters".into()));
    }
    // Spam heuristic: long messages made of almost nothing
    let unique: std::collections::HashSet<char> = trimmed.chars().collect();
    if trimmed.chars().count() > 10 && unique.len() < 3 {
        return Err(MessageError::Validation("message appears to be spam".into()));
    }
    Ok(())
}

/// How many `initial_anchors` batches a snapshot of `total` anchors needs.
pub fn batch_count(total: usize, batch_size: usize) -> usize {
    if total == 0 {
        0
    } else {
        (total + batch_size - 1) / batch_size
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const NOW: i64 = 1_700_000_000_000;

    fn parse(json: &str) -> Result<ClientMessage, MessageError> {
        parse_client_message(json, NOW)
    }

    #[test]
    fn valid_pose_update_parses() {
        let msg = parse(&format!(
            r#"{{"type":"pose_update","timestamp":{NOW},"pose":{{"position":[1.0,0.5,-2.0],"rotation":[0,0,0,1],"confidence":0.95,"tracking_state":"tracking"}}}}"#
        ))
        .unwrap();
        assert!(matches!(msg, ClientMessage::PoseUpdate { .. }));
    }

    #[test]
    fn broken_json_is_invalid_json() {
        assert!(matches!(parse("{nope"), Err(MessageError::InvalidJson)));
    }

    #[test]
    fn unknown_type_is_validation_error() {
        let err = parse(&format!(r#"{{"type":"teleport","timestamp":{NOW}}}"#)).unwrap_err();
        assert!(matches!(err, MessageError::Validation(_)));
    }

    #[test]
    fn missing_type_is_validation_error() {
        let err = parse(&format!(r#"{{"timestamp":{NOW}}}"#)).unwrap_err();
        assert!(matches!(err, MessageError::Validation(_)));
    }

    #[test]
    fn out_of_bounds_coordinate_rejected() {
        let err = parse(&format!(
            r#"{{"type":"pose_update","timestamp":{NOW},"pose":{{"position":[1500.0,0,0],"rotation":[0,0,0,1],"confidence":1.0}}}}"#
        ))
        .unwrap_err();
        assert!(matches!(err, MessageError::Validation(_)));
    }

    #[test]
    fn non_finite_coordinate_rejected() {
        // JSON has no NaN literal; a null coordinate fails shape validation
        let err = parse(&format!(
            r#"{{"type":"pose_update","timestamp":{NOW},"pose":{{"position":[null,0,0],"rotation":[0,0,0,1],"confidence":1.0}}}}"#
        ))
        .unwrap_err();
        assert!(matches!(err, MessageError::Validation(_)));
    }

    #[test]
    fn denormalized_quaternion_rejected() {
        // [0.5,0.5,0.5,0.5] has norm exactly 1.0 — valid
        let unit = parse(&format!(
            r#"{{"type":"pose_update","timestamp":{NOW},"pose":{{"position":[0,0,0],"rotation":[0.5,0.5,0.5,0.5],"confidence":1.0}}}}"#
        ));
        assert!(unit.is_ok());

        let err = parse(&format!(
            r#"{{"type":"pose_update","timestamp":{NOW},"pose":{{"position":[0,0,0],"rotation":[0.2,0.2,0.2,0.2],"confidence":1.0}}}}"#
        ))
        .unwrap_err();
        assert!(matches!(err, MessageError::Validation(_)));
    }

    #[test]
    fn confidence_out_of_range_rejected() {
        let err = parse(&format!(
            r#"{{"type":"pose_update","timestamp":{NOW},"pose":{{"position":[0,0,0],"rotation":[0,0,0,1],"confidence":1.5}}}}"#
        ))
        .unwrap_err();
        assert!(matches!(err, MessageError::Validation(_)));
    }

    #[test]
    fn stale_timestamp_rejected() {
        let stale = NOW - 120_000;
        let err = parse(&format!(r#"{{"type":"ping","timestamp":{stale}}}"#)).unwrap_err();
        assert!(matches!(err, MessageError::Validation(_)));
    }

    #[test]
    fn future_timestamp_rejected() {
        let future = NOW + 120_000;
        let err = parse(&format!(r#"{{"type":"ping","timestamp":{future}}}"#)).unwrap_err();
        assert!(matches!(err, MessageError::Validation(_)));
    }

    #[test]
    fn anchor_create_with_array_payload() {
        let msg = parse(&format!(
            r#"{{"type":"anchor_create","timestamp":{NOW},"anchor_id":"a1","position":[1,2,3],"rotation":[0,0,0,1]}}"#
        ))
        .unwrap();
        match msg {
            ClientMessage::AnchorCreate { anchor_id, position, .. } => {
                assert_eq!(anchor_id, "a1");
                assert_eq!(position, [1.0, 2.0, 3.0]);
            }
            other => panic!("unexpected message {other:?}"),
        }
    }

    #[test]
    fn bad_anchor_id_rejected() {
        for bad in ["", "has space", "way!", &"x".repeat(51)] {
            let err = parse(&format!(
                r#"{{"type":"anchor_delete","timestamp":{NOW},"anchor_id":"{bad}"}}"#
            ))
            .unwrap_err();
            assert!(matches!(err, MessageError::Validation(_)), "accepted {bad:?}");
        }
    }

    #[test]
    fn oversized_metadata_rejected() {
        let blob = "x".repeat(MAX_METADATA_BYTES);
        let err = parse(&format!(
            r#"{{"type":"anchor_create","timestamp":{NOW},"anchor_id":"a1","position":[0,0,0],"rotation":[0,0,0,1],"metadata":{{"blob":"{blob}"}}}}"#
        ))
        .unwrap_err();
        assert!(matches!(err, MessageError::Validation(_)));
    }

    #[test]
    fn negative_lifetime_rejected() {
        let err = parse(&format!(
            r#"{{"type":"anchor_create","timestamp":{NOW},"anchor_id":"a1","position":[0,0,0],"rotation":[0,0,0,1],"lifetime_hours":-1.0}}"#
        ))
        .unwrap_err();
        assert!(matches!(err, MessageError::Validation(_)));
    }

    #[test]
    fn chat_spam_heuristic() {
        let ok = parse(&format!(
            r#"{{"type":"chat_message","timestamp":{NOW},"message":"hello everyone"}}"#
        ));
        assert!(ok.is_ok());

        let spam = parse(&format!(
            r#"{{"type":"chat_message","timestamp":{NOW},"message":"aaaaaaaaaaaaaaaa"}}"#
        ))
        .unwrap_err();
        assert!(matches!(spam, MessageError::Validation(_)));

        // Short repetition is allowed
        let short = parse(&format!(
            r#"{{"type":"chat_message","timestamp":{NOW},"message":"aaaa"}}"#
        ));
        assert!(short.is_ok());
    }

    #[test]
    fn empty_chat_rejected() {
        let err = parse(&format!(
            r#"{{"type":"chat_message","timestamp":{NOW},"message":"   "}}"#
        ))
        .unwrap_err();
        assert!(matches!(err, MessageError::Validation(_)));
    }

    #[test]
    fn long_chat_rejected() {
        let long = "y".repeat(501);
        let err = parse(&format!(
            r#"{{"type":"chat_message","timestamp":{NOW},"message":"{long}"}}"#
        ))
        .unwrap_err();
        assert!(matches!(err, MessageError::Validation(_)));
    }

    #[test]
    fn anchor_update_rejects_filter_only_states() {
        let err = parse(&format!(
            r#"{{"type":"anchor_update","timestamp":{NOW},"anchor_id":"a1","tracking_state":"lost"}}"#
        ))
        .unwrap_err();
        assert!(matches!(err, MessageError::Validation(_)));

        let ok = parse(&format!(
            r#"{{"type":"anchor_update","timestamp":{NOW},"anchor_id":"a1","tracking_state":"paused"}}"#
        ));
        assert!(ok.is_ok());
    }

    #[test]
    fn batch_count_arithmetic() {
        assert_eq!(batch_count(0, 100), 0);
        assert_eq!(batch_count(1, 100), 1);
        assert_eq!(batch_count(100, 100), 1);
        assert_eq!(batch_count(101, 100), 2);
        assert_eq!(batch_count(250, 100), 3);
    }

    #[test]
    fn error_frames_serialize_with_code() {
        let frame = ServerMessage::error("RATE_LIMIT_EXCEEDED", "rate limit exceeded");
        let json = serde_json::to_value(&frame).unwrap();
        assert_eq!(json["type"], "error");
        assert_eq!(json["code"], "RATE_LIMIT_EXCEEDED");
        assert_eq!(json["error"], true);
        assert!(json["timestamp"].as_i64().unwrap() > 0);
    }
}

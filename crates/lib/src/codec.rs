//! Binary codec for the legacy push protocol.
//!
//! Notification frame (big-endian):
//! `[u8 command=0][u32 sequence id][u32 expiry][u16 token len][token][u16 payload len][payload]`.
//!
//! Feedback stream: `[u32 epoch seconds][u16 token len][token]` repeated until the backend
//! closes the connection. Records carry no delimiter, so decoding is resumable: whatever
//! does not form a complete record is handed back to the caller for the next read.

use crate::error::{PushError, Result};
use bytes::{Buf, BufMut, Bytes, BytesMut};
use chrono::{DateTime, Utc};
use std::fmt;

pub const NOTIFICATION_COMMAND: u8 = 0;
pub const ERROR_RESPONSE_COMMAND: u8 = 8;
/// Payload ceiling of the legacy frame format.
pub const DEFAULT_MAX_PAYLOAD: usize = 256;
/// Length of tokens issued by the backend. Not enforced; the frame carries the length.
pub const DEVICE_TOKEN_LEN: usize = 32;

const FEEDBACK_HEADER_LEN: usize = 6;
const ERROR_RESPONSE_LEN: usize = 6;
const PAYLOAD_ROOT: &str = "aps";
const PAYLOAD_FIELDS: [&str; 3] = ["alert", "badge", "sound"];

/// Opaque binary device token, exchanged with callers as hex.
#[derive(Clone, PartialEq, Eq, Hash)]
pub struct DeviceToken(Vec<u8>);

impl DeviceToken {
    pub fn from_hex(s: &str) -> Result<Self> {
        let s = s.trim();
        if s.is_empty() {
            return Err(PushError::invalid("device token is empty"));
        }
        if s.len() % 2 != 0 {
            return Err(PushError::invalid(format!(
                "device token {:?} has odd hex length",
                s
            )));
        }
        let bytes = hex::decode(s)
            .map_err(|e| PushError::invalid(format!("device token {:?}: {}", s, e)))?;
        if bytes.len() > u16::MAX as usize {
            return Err(PushError::invalid("device token too long"));
        }
        Ok(Self(bytes))
    }

    pub fn from_bytes(bytes: impl Into<Vec<u8>>) -> Self {
        Self(bytes.into())
    }

    pub fn to_hex(&self) -> String {
        hex::encode(&self.0)
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }
}

impl fmt::Debug for DeviceToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "DeviceToken({})", self.to_hex())
    }
}

/// One entry of the feedback stream: a token the backend gave up on, and when.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FeedbackRecord {
    /// Epoch seconds as sent on the wire.
    pub timestamp: u32,
    pub token: DeviceToken,
}

impl FeedbackRecord {
    pub fn expired_at(&self) -> DateTime<Utc> {
        DateTime::from_timestamp(i64::from(self.timestamp), 0).unwrap_or_default()
    }
}

/// Check the payload shape and serialize it compactly, enforcing the size ceiling.
pub fn encode_payload(payload: &serde_json::Value, max_payload: usize) -> Result<Vec<u8>> {
    let aps = payload
        .as_object()
        .ok_or_else(|| PushError::invalid("notification must be an object"))?
        .get(PAYLOAD_ROOT)
        .and_then(|v| v.as_object())
        .ok_or_else(|| PushError::invalid("notification must contain an \"aps\" object"))?;
    if !PAYLOAD_FIELDS.iter().any(|f| aps.contains_key(*f)) {
        return Err(PushError::invalid(
            "\"aps\" must contain at least one of alert, badge, sound",
        ));
    }
    let encoded = serde_json::to_vec(payload)
        .map_err(|e| PushError::invalid(format!("notification is not serializable: {}", e)))?;
    if encoded.len() > max_payload {
        return Err(PushError::PayloadTooLarge {
            size: encoded.len(),
            limit: max_payload,
        });
    }
    Ok(encoded)
}

/// Encode one notification frame. `expiry` is absolute epoch seconds, 0 for none.
pub fn encode_notification(
    token: &DeviceToken,
    payload: &serde_json::Value,
    sequence_id: u32,
    expiry: u32,
    max_payload: usize,
) -> Result<Bytes> {
    let body = encode_payload(payload, max_payload)?;
    let body_len = u16::try_from(body.len()).map_err(|_| PushError::PayloadTooLarge {
        size: body.len(),
        limit: max_payload.min(u16::MAX as usize),
    })?;
    let token = token.as_bytes();
    let token_len = u16::try_from(token.len())
        .map_err(|_| PushError::invalid("device token too long"))?;
    let mut buf = BytesMut::with_capacity(1 + 4 + 4 + 2 + token.len() + 2 + body.len());
    buf.put_u8(NOTIFICATION_COMMAND);
    buf.put_u32(sequence_id);
    buf.put_u32(expiry);
    buf.put_u16(token_len);
    buf.put_slice(token);
    buf.put_u16(body_len);
    buf.put_slice(&body);
    Ok(buf.freeze())
}

/// Notification frame as read back by a backend (used by the local simulator and tests).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NotificationFrame {
    pub sequence_id: u32,
    pub expiry: u32,
    pub token: DeviceToken,
    pub payload: Bytes,
}

/// Decode one notification frame from the front of `buf`, advancing it.
/// Returns `None` when `buf` does not yet hold a complete frame or the command byte is unknown.
pub fn decode_notification(buf: &mut BytesMut) -> Option<NotificationFrame> {
    if buf.len() < 11 || buf[0] != NOTIFICATION_COMMAND {
        return None;
    }
    let token_len = u16::from_be_bytes([buf[9], buf[10]]) as usize;
    let payload_len_at = 11 + token_len;
    if buf.len() < payload_len_at + 2 {
        return None;
    }
    let payload_len = u16::from_be_bytes([buf[payload_len_at], buf[payload_len_at + 1]]) as usize;
    if buf.len() < payload_len_at + 2 + payload_len {
        return None;
    }
    buf.advance(1);
    let sequence_id = buf.get_u32();
    let expiry = buf.get_u32();
    buf.advance(2);
    let token = DeviceToken(buf.split_to(token_len).to_vec());
    buf.advance(2);
    let payload = buf.split_to(payload_len).freeze();
    Some(NotificationFrame {
        sequence_id,
        expiry,
        token,
        payload,
    })
}

/// Decode as many complete feedback records as `buf` holds.
/// Returns the records and the undecoded tail, which is empty or shorter than one record.
pub fn decode_feedback_stream(buf: &[u8]) -> (Vec<FeedbackRecord>, &[u8]) {
    let mut records = Vec::new();
    let mut rest = buf;
    while rest.len() >= FEEDBACK_HEADER_LEN {
        let token_len = u16::from_be_bytes([rest[4], rest[5]]) as usize;
        if rest.len() < FEEDBACK_HEADER_LEN + token_len {
            break;
        }
        let timestamp = u32::from_be_bytes([rest[0], rest[1], rest[2], rest[3]]);
        let token = DeviceToken(rest[FEEDBACK_HEADER_LEN..FEEDBACK_HEADER_LEN + token_len].to_vec());
        records.push(FeedbackRecord { timestamp, token });
        rest = &rest[FEEDBACK_HEADER_LEN + token_len..];
    }
    (records, rest)
}

pub fn encode_feedback_record(record: &FeedbackRecord, buf: &mut BytesMut) {
    let token = record.token.as_bytes();
    buf.reserve(FEEDBACK_HEADER_LEN + token.len());
    buf.put_u32(record.timestamp);
    buf.put_u16(token.len() as u16);
    buf.put_slice(token);
}

/// Incremental feedback decoder: push bytes as they arrive, drain complete records.
#[derive(Debug, Default)]
pub struct FeedbackDecoder {
    pending: BytesMut,
}

impl FeedbackDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, chunk: &[u8]) -> Vec<FeedbackRecord> {
        self.pending.extend_from_slice(chunk);
        let (records, rest) = decode_feedback_stream(&self.pending);
        let consumed = self.pending.len() - rest.len();
        self.pending.advance(consumed);
        records
    }

    /// Bytes held back because they do not yet form a full record.
    pub fn pending(&self) -> &[u8] {
        &self.pending
    }
}

/// Rejection the backend writes right before dropping the connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ErrorResponse {
    pub status: u8,
    pub sequence_id: u32,
}

impl ErrorResponse {
    pub fn description(&self) -> &'static str {
        match self.status {
            0 => "no errors encountered",
            1 => "processing error",
            2 => "missing device token",
            3 => "missing topic",
            4 => "missing payload",
            5 => "invalid token size",
            6 => "invalid topic size",
            7 => "invalid payload size",
            8 => "invalid token",
            10 => "shutdown",
            _ => "unknown",
        }
    }
}

pub fn decode_error_response(buf: &[u8]) -> Option<ErrorResponse> {
    if buf.len() < ERROR_RESPONSE_LEN || buf[0] != ERROR_RESPONSE_COMMAND {
        return None;
    }
    Some(ErrorResponse {
        status: buf[1],
        sequence_id: u32::from_be_bytes([buf[2], buf[3], buf[4], buf[5]]),
    })
}

pub fn encode_error_response(response: ErrorResponse) -> [u8; ERROR_RESPONSE_LEN] {
    let id = response.sequence_id.to_be_bytes();
    [ERROR_RESPONSE_COMMAND, response.status, id[0], id[1], id[2], id[3]]
}

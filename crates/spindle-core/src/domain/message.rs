//! RPC message envelope.
//!
//! Every message, whatever carries it, has a task code (handler dispatch key)
//! and a correlation id (request/response pairing). The envelope is
//! serialized with serde_json before it reaches the transport.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use super::{CorrelationId, EndPoint, TaskCode};
use crate::error::{SpindleError, SpindleResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MessageKind {
    Request,
    OneWay,
    Response,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageHeader {
    pub code: TaskCode,
    pub correlation_id: CorrelationId,
    pub kind: MessageKind,
    /// Filled in by the sending dispatcher.
    pub from: Option<EndPoint>,
    pub to: Option<EndPoint>,
    /// Per-request budget; `None` falls back to the dispatcher default.
    pub timeout_ms: Option<u64>,
    /// Dispatch-level failure reported by the remote dispatcher itself
    /// (e.g. no handler bound), as opposed to an application payload.
    pub error: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    header: MessageHeader,
    payload: Vec<u8>,
}

impl Message {
    /// New request; correlation id and end points are assigned at send time.
    pub fn request(code: impl Into<TaskCode>, payload: impl Into<Vec<u8>>) -> Self {
        Self {
            header: MessageHeader {
                code: code.into(),
                correlation_id: CorrelationId::new(0),
                kind: MessageKind::Request,
                from: None,
                to: None,
                timeout_ms: None,
                error: None,
            },
            payload: payload.into(),
        }
    }

    /// Request whose payload is `value` encoded as JSON.
    pub fn json_request<T: Serialize>(code: impl Into<TaskCode>, value: &T) -> SpindleResult<Self> {
        Ok(Self::request(code, serde_json::to_vec(value)?))
    }

    pub fn with_timeout_ms(mut self, timeout_ms: u64) -> Self {
        self.header.timeout_ms = Some(timeout_ms);
        self
    }

    /// Response skeleton for a received request: same code and correlation
    /// id, end points swapped, empty payload.
    pub fn create_response(&self) -> Self {
        Self {
            header: MessageHeader {
                code: self.header.code.clone(),
                correlation_id: self.header.correlation_id,
                kind: MessageKind::Response,
                from: self.header.to.clone(),
                to: self.header.from.clone(),
                timeout_ms: None,
                error: None,
            },
            payload: Vec::new(),
        }
    }

    pub fn with_payload(mut self, payload: impl Into<Vec<u8>>) -> Self {
        self.payload = payload.into();
        self
    }

    pub fn with_json<T: Serialize>(self, value: &T) -> SpindleResult<Self> {
        let bytes = serde_json::to_vec(value)?;
        Ok(self.with_payload(bytes))
    }

    pub(crate) fn with_error(mut self, error: impl Into<String>) -> Self {
        self.header.error = Some(error.into());
        self
    }

    pub fn header(&self) -> &MessageHeader {
        &self.header
    }

    pub(crate) fn header_mut(&mut self) -> &mut MessageHeader {
        &mut self.header
    }

    pub fn code(&self) -> &TaskCode {
        &self.header.code
    }

    pub fn correlation_id(&self) -> CorrelationId {
        self.header.correlation_id
    }

    pub fn from(&self) -> Option<&EndPoint> {
        self.header.from.as_ref()
    }

    pub fn to(&self) -> Option<&EndPoint> {
        self.header.to.as_ref()
    }

    pub fn kind(&self) -> MessageKind {
        self.header.kind
    }

    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    pub fn into_payload(self) -> Vec<u8> {
        self.payload
    }

    pub fn decode_json<T: DeserializeOwned>(&self) -> SpindleResult<T> {
        Ok(serde_json::from_slice(&self.payload)?)
    }

    pub(crate) fn encode(&self) -> SpindleResult<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }

    pub(crate) fn decode(bytes: &[u8]) -> SpindleResult<Self> {
        serde_json::from_slice(bytes).map_err(SpindleError::from)
    }
}

//! Session-level RPC envelope, task codes, and the negotiation whitelist

use crate::message::NegotiationMessage;
use bytes::Bytes;
use std::fmt;
use std::sync::Arc;

/// RPC task code
pub type RpcCode = u16;

pub const RPC_NEGOTIATION: RpcCode = 0x0010;
pub const RPC_NEGOTIATION_ACK: RpcCode = 0x0011;
pub const RPC_FD_FAILURE_DETECTOR_PING: RpcCode = 0x0020;
pub const RPC_FD_FAILURE_DETECTOR_PING_ACK: RpcCode = 0x0021;
pub const RPC_HTTP_SERVICE: RpcCode = 0x0030;
pub const RPC_HTTP_SERVICE_ACK: RpcCode = 0x0031;

/// Get a readable name for well-known codes
pub fn rpc_code_name(code: RpcCode) -> &'static str {
    match code {
        RPC_NEGOTIATION => "RPC_NEGOTIATION",
        RPC_NEGOTIATION_ACK => "RPC_NEGOTIATION_ACK",
        RPC_FD_FAILURE_DETECTOR_PING => "RPC_FD_FAILURE_DETECTOR_PING",
        RPC_FD_FAILURE_DETECTOR_PING_ACK => "RPC_FD_FAILURE_DETECTOR_PING_ACK",
        RPC_HTTP_SERVICE => "RPC_HTTP_SERVICE",
        RPC_HTTP_SERVICE_ACK => "RPC_HTTP_SERVICE_ACK",
        _ => "RPC_APPLICATION",
    }
}

/// Response status of an RPC
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RpcStatus {
    Ok,
    /// The receiver has no handler for the request code
    HandlerNotFound,
    /// The receiver refused the request before dispatch
    Rejected,
    Failed,
}

/// A message exchanged on a session
#[derive(Clone, PartialEq, Eq)]
pub struct RpcMessage {
    pub code: RpcCode,
    pub seq: u64,
    pub is_response: bool,
    pub status: RpcStatus,
    pub body: Bytes,
    /// Authenticated user of the session the message arrived on
    pub user_name: Option<String>,
}

impl RpcMessage {
    pub fn request(code: RpcCode, body: impl Into<Bytes>) -> Self {
        Self {
            code,
            seq: 0,
            is_response: false,
            status: RpcStatus::Ok,
            body: body.into(),
            user_name: None,
        }
    }

    /// Build the response to `self` with the given code
    pub fn response(&self, code: RpcCode, status: RpcStatus, body: impl Into<Bytes>) -> Self {
        Self {
            code,
            seq: self.seq,
            is_response: true,
            status,
            body: body.into(),
            user_name: None,
        }
    }

    pub fn negotiation_request(msg: &NegotiationMessage) -> Self {
        Self::request(RPC_NEGOTIATION, msg.encode())
    }

    pub fn negotiation_response(&self, msg: &NegotiationMessage) -> Self {
        self.response(RPC_NEGOTIATION_ACK, RpcStatus::Ok, msg.encode())
    }
}

impl fmt::Debug for RpcMessage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RpcMessage")
            .field("code", &rpc_code_name(self.code))
            .field("raw_code", &self.code)
            .field("seq", &self.seq)
            .field("is_response", &self.is_response)
            .field("status", &self.status)
            .field("body_len", &self.body.len())
            .field("user_name", &self.user_name)
            .finish()
    }
}

/// Predicate deciding which codes may cross a session before it is
/// authenticated
#[derive(Clone)]
pub struct Whitelist {
    predicate: Arc<dyn Fn(RpcCode) -> bool + Send + Sync>,
}

impl Whitelist {
    pub fn new(predicate: impl Fn(RpcCode) -> bool + Send + Sync + 'static) -> Self {
        Self {
            predicate: Arc::new(predicate),
        }
    }

    /// Only the negotiation RPCs themselves
    pub fn negotiation_only() -> Self {
        Self::new(|code| matches!(code, RPC_NEGOTIATION | RPC_NEGOTIATION_ACK))
    }

    pub fn allows(&self, code: RpcCode) -> bool {
        (self.predicate)(code)
    }
}

impl Default for Whitelist {
    /// Negotiation, failure-detector heartbeats, and HTTP admin traffic
    fn default() -> Self {
        Self::new(|code| {
            matches!(
                code,
                RPC_NEGOTIATION
                    | RPC_NEGOTIATION_ACK
                    | RPC_FD_FAILURE_DETECTOR_PING
                    | RPC_FD_FAILURE_DETECTOR_PING_ACK
                    | RPC_HTTP_SERVICE
                    | RPC_HTTP_SERVICE_ACK
            )
        })
    }
}

impl fmt::Debug for Whitelist {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Whitelist").finish_non_exhaustive()
    }
}

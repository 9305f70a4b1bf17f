//! Transport port - ノード間のメッセージ配送
//!
//! The transport only moves bytes. Framing of the envelope, correlation and
//! handler dispatch all live in the dispatcher.

use std::sync::Weak;

use crate::domain::EndPoint;
use crate::error::SpindleResult;

/// Receiving side of a node.
pub trait Inbox: Send + Sync {
    /// Called by the transport for every delivered message. Must not block.
    fn on_message(&self, bytes: Vec<u8>);
}

pub trait Transport: Send + Sync {
    /// Route messages addressed to `address` into `inbox`.
    ///
    /// Fails if the address is already bound.
    fn bind(&self, address: &EndPoint, inbox: Weak<dyn Inbox>) -> SpindleResult<()>;

    fn unbind(&self, address: &EndPoint);

    /// Hand `bytes` over for delivery. Returns once the transport accepted
    /// them; delivery itself happens asynchronously. An unreachable `to` is
    /// reported here as `SpindleError::Network`.
    fn send(&self, from: &EndPoint, to: &EndPoint, bytes: Vec<u8>) -> SpindleResult<()>;
}

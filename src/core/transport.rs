//! Purpose: Define the boundary between sessions and whatever moves data between peers.
//! Exports: `Transport`, `QueryRequest`, `SessionId`, `NetworkId`, `EntityId`.
//! Role: Sessions call outward through this trait; transports call back through handlers.
//! Invariants: Absence of matching subscribers or queryables is never an error.
//! Invariants: A `QueryRequest`'s reply sender is dropped once every matching queryable is done.
use crate::core::attachment::Attachment;
use crate::core::error::Error;
use crate::core::fifo::FifoSender;
use crate::core::handler::{QueryHandler, SampleHandler};
use crate::core::keyexpr::KeyExpr;
use crate::core::liveness::Liveness;
use crate::core::sample::{Encoding, Reply, Sample};
use bytes::Bytes;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

static NEXT_SESSION_ID: AtomicU64 = AtomicU64::new(1);

#[derive(Clone, Copy, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub struct SessionId(u64);

impl SessionId {
    pub(crate) fn next() -> Self {
        Self(NEXT_SESSION_ID.fetch_add(1, Ordering::Relaxed))
    }

    pub fn from_raw(raw: u64) -> Self {
        Self(raw)
    }

    pub fn get(self) -> u64 {
        self.0
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:016x}", self.0)
    }
}

/// Transport-side handle of a declared key expression.
pub type NetworkId = u64;

/// Transport-side handle of a declared subscriber or queryable.
pub type EntityId = u64;

/// Who declared a subscriber or queryable, and whether it is still live.
#[derive(Clone, Debug)]
pub struct Owner {
    pub session: SessionId,
    pub liveness: Liveness,
}

pub struct QueryRequest {
    pub key_expr: KeyExpr,
    pub parameters: String,
    pub payload: Option<Bytes>,
    pub encoding: Option<Encoding>,
    pub attachment: Option<Attachment>,
    pub replies: FifoSender<Reply>,
}

pub trait Transport: Send + Sync {
    fn declare_resource(&self, expr: &KeyExpr) -> Result<NetworkId, Error>;

    fn undeclare_resource(&self, id: NetworkId) -> Result<(), Error>;

    /// Hands a sample to every subscriber matching the expression bound to
    /// `resource`; no subscriber is success. The sample's key expression is
    /// replaced by the declared one. Fails with `UnknownId` once `resource`
    /// is undeclared.
    fn publish(&self, resource: NetworkId, sample: Sample) -> Result<(), Error>;

    /// Publishes on the sample's own key expression, with no declared resource.
    fn publish_expr(&self, sample: Sample) -> Result<(), Error>;

    fn declare_subscriber(
        &self,
        owner: Owner,
        expr: &KeyExpr,
        handler: Arc<dyn SampleHandler>,
    ) -> Result<EntityId, Error>;

    fn declare_queryable(
        &self,
        owner: Owner,
        expr: &KeyExpr,
        handler: Arc<dyn QueryHandler>,
    ) -> Result<EntityId, Error>;

    fn undeclare_entity(&self, id: EntityId) -> Result<(), Error>;

    /// Dispatches a query; replies flow into `request.replies`.
    fn send_query(&self, request: QueryRequest) -> Result<(), Error>;

    fn matching_subscribers(&self, expr: &KeyExpr) -> usize;

    fn close(&self) -> Result<(), Error>;
}

#[cfg(test)]
mod tests {
    use super::SessionId;

    #[test]
    fn session_ids_are_unique_and_render_as_hex() {
        let a = SessionId::next();
        let b = SessionId::next();
        assert_ne!(a, b);
        assert_eq!(SessionId::from_raw(255).to_string(), "00000000000000ff");
    }
}

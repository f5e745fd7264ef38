//! Purpose: Public client API: sessions and the handles they declare.
//! Exports: Session, declaration handles, options, config, and the core value types they use.
//! Role: Stable surface for the CLI and library users; hides the memory hub internals.
//! Invariants: Every handle holds its session alive and fails with `StaleHandle` after close.
//! Invariants: Reply channels are bounded; capacity is chosen per `get`.
#![allow(clippy::result_large_err)]

pub mod config;
mod publication;
mod queryable;
mod session;
mod subscriber;

pub use crate::core::attachment::{Attachment, ExpectedPairs, PairConsumer, Pairs};
#[doc(hidden)]
pub use crate::core::error::to_exit_code;
pub use crate::core::error::{Error, ErrorKind};
pub use crate::core::fifo::{FifoCloser, FifoReceiver, FifoSender, FullPolicy, TryRecv, bounded};
pub use crate::core::handler::{QueryHandler, SampleHandler};
pub use crate::core::keyexpr::{KeyExpr, KeyExprRef};
pub use crate::core::query::{Query, ReplyOptions};
pub use crate::core::sample::{
    CongestionControl, Encoding, Priority, Qos, Reply, ReplyError, Sample, SampleKind,
};
pub use crate::core::table::ExprId;
pub use crate::core::transport::{SessionId, Transport};
pub use config::Config;
pub use publication::{MatchingStatus, Publication, PublicationOptions};
pub use queryable::Queryable;
pub use session::{GetOptions, PutOptions, Session, SessionState};
pub use subscriber::Subscriber;

pub type ReplySender = FifoSender<Reply>;
pub type ReplyReceiver = FifoReceiver<Reply>;

/// Builds a channel suitable for `Session::get_with_channel`.
pub fn reply_channel(
    capacity: usize,
    policy: FullPolicy,
) -> Result<(ReplySender, ReplyReceiver), Error> {
    crate::core::fifo::bounded(capacity, policy)
}

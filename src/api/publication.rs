//! Purpose: Repeated puts and deletes on one pre-declared key expression.
//! Exports: `Publication`, `PublicationOptions`, `MatchingStatus`.
//! Role: Handle returned by `Session::declare_publication`.
//! Invariants: Every operation fails with `StaleHandle` after undeclare, id undeclare or session close.
//! Invariants: Publishing with no matching subscriber is success.
#![allow(clippy::result_large_err)]

use super::session::{PutOptions, SessionInner};
use crate::core::error::{Error, ErrorKind};
use crate::core::keyexpr::KeyExpr;
use crate::core::liveness::Liveness;
use crate::core::sample::{CongestionControl, Priority, Qos, Sample};
use crate::core::table::ExprId;
use crate::core::transport::NetworkId;
use bytes::Bytes;
use std::fmt;
use std::sync::Arc;

#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct PublicationOptions {
    pub congestion_control: CongestionControl,
    /// Stamped on every sample's `qos`. The memory transport delivers in
    /// queue order and does not reorder by priority.
    pub priority: Priority,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct MatchingStatus {
    pub matching: bool,
}

pub struct Publication {
    session: Arc<SessionInner>,
    token: u64,
    expr_id: ExprId,
    resource: NetworkId,
    key_expr: KeyExpr,
    qos: Qos,
    liveness: Liveness,
}

impl Publication {
    pub(crate) fn new(
        session: Arc<SessionInner>,
        token: u64,
        expr_id: ExprId,
        resource: NetworkId,
        key_expr: KeyExpr,
        options: PublicationOptions,
        liveness: Liveness,
    ) -> Self {
        Self {
            session,
            token,
            expr_id,
            resource,
            key_expr,
            qos: Qos {
                priority: options.priority,
                congestion_control: options.congestion_control,
            },
            liveness,
        }
    }

    pub fn key_expr(&self) -> &KeyExpr {
        &self.key_expr
    }

    pub fn expr_id(&self) -> ExprId {
        self.expr_id
    }

    pub fn put(&self, payload: impl Into<Bytes>, options: PutOptions) -> Result<(), Error> {
        self.ensure_live()?;
        let mut sample = Sample::put(self.key_expr.clone(), payload);
        if let Some(encoding) = options.encoding {
            sample.encoding = encoding;
        }
        sample.attachment = options.attachment;
        self.send(sample)
    }

    pub fn delete(&self) -> Result<(), Error> {
        self.ensure_live()?;
        self.send(Sample::delete(self.key_expr.clone()))
    }

    // An id undeclared between the liveness check and the send surfaces as stale.
    fn send(&self, sample: Sample) -> Result<(), Error> {
        self.session
            .publish_resource(self.resource, sample, self.qos)
            .map_err(|err| match err.kind() {
                ErrorKind::UnknownId => stale(&self.key_expr).with_id(self.expr_id.get()),
                _ => err,
            })
    }

    pub fn matching_status(&self) -> Result<MatchingStatus, Error> {
        self.ensure_live()?;
        let count = self.session.matching_subscribers(&self.key_expr)?;
        Ok(MatchingStatus {
            matching: count > 0,
        })
    }

    pub fn undeclare(self) -> Result<(), Error> {
        self.release()
    }

    fn release(&self) -> Result<(), Error> {
        if !self.liveness.revoke() {
            return Err(stale(&self.key_expr));
        }
        self.session.forget_publication(self.token);
        tracing::debug!(session = %self.session.id(), key_expr = %self.key_expr, "undeclared publication");
        Ok(())
    }

    fn ensure_live(&self) -> Result<(), Error> {
        if !self.liveness.is_alive() {
            return Err(stale(&self.key_expr));
        }
        self.session
            .ensure_expr(self.expr_id)
            .map_err(|err| err.with_key_expr(self.key_expr.as_str()))
    }
}

fn stale(key_expr: &KeyExpr) -> Error {
    Error::new(ErrorKind::StaleHandle)
        .with_message("publication was undeclared")
        .with_key_expr(key_expr.as_str())
}

impl Drop for Publication {
    fn drop(&mut self) {
        if self.liveness.is_alive() {
            let _ = self.release();
        }
    }
}

impl fmt::Debug for Publication {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Publication")
            .field("expr_id", &self.expr_id)
            .field("resource", &self.resource)
            .field("key_expr", &self.key_expr)
            .field("qos", &self.qos)
            .field("live", &self.liveness.is_alive())
            .finish()
    }
}

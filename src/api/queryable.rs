// Handle for a declared queryable; `Query` values it receives stop accepting replies once it is gone.
#![allow(clippy::result_large_err)]

use super::session::SessionInner;
use crate::core::error::{Error, ErrorKind};
use crate::core::keyexpr::KeyExpr;
use crate::core::liveness::Liveness;
use crate::core::transport::EntityId;
use std::fmt;
use std::sync::Arc;

pub struct Queryable {
    session: Arc<SessionInner>,
    entity: EntityId,
    key_expr: KeyExpr,
    liveness: Liveness,
}

impl Queryable {
    pub(crate) fn new(
        session: Arc<SessionInner>,
        entity: EntityId,
        key_expr: KeyExpr,
        liveness: Liveness,
    ) -> Self {
        Self {
            session,
            entity,
            key_expr,
            liveness,
        }
    }

    pub fn key_expr(&self) -> &KeyExpr {
        &self.key_expr
    }

    pub fn is_live(&self) -> bool {
        self.liveness.is_alive()
    }

    pub fn undeclare(self) -> Result<(), Error> {
        self.release()
    }

    fn release(&self) -> Result<(), Error> {
        if !self.liveness.revoke() {
            return Err(Error::new(ErrorKind::StaleHandle)
                .with_message("queryable was undeclared or its session closed")
                .with_key_expr(self.key_expr.as_str()));
        }
        tracing::debug!(session = %self.session.id(), entity = self.entity, "undeclaring queryable");
        self.session.undeclare_entity(self.entity)
    }
}

impl Drop for Queryable {
    fn drop(&mut self) {
        if self.liveness.is_alive() {
            if let Err(err) = self.release() {
                tracing::warn!(entity = self.entity, "queryable undeclare on drop failed: {err}");
            }
        }
    }
}

impl fmt::Debug for Queryable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Queryable")
            .field("entity", &self.entity)
            .field("key_expr", &self.key_expr)
            .field("live", &self.liveness.is_alive())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use crate::api::config::{Config, PEER};
    use crate::api::session::{GetOptions, Session};
    use crate::core::error::ErrorKind;
    use crate::core::query::{Query, ReplyOptions};

    #[test]
    fn undeclared_queryable_no_longer_answers() {
        let config = Config::new()
            .with(PEER, "mem/queryable-undeclare")
            .expect("config");
        let session = Session::open(config).expect("open");
        let queryable = session
            .declare_queryable("svc/echo", |query: Query| {
                let _ = query.reply("svc/echo", query.parameters().to_string(), ReplyOptions::default());
            })
            .expect("queryable");

        let replies = session
            .get("svc/echo", "ping", GetOptions::default())
            .expect("get");
        let reply = replies.recv().expect("reply");
        assert_eq!(reply.sample().expect("ok").payload, "ping");
        assert!(replies.recv().is_none());

        queryable.undeclare().expect("undeclare");
        let replies = session
            .get("svc/echo", "ping", GetOptions::default())
            .expect("get");
        assert!(replies.recv().is_none());
    }

    #[test]
    fn second_undeclare_is_stale() {
        let session = Session::open(Config::new().with(PEER, "mem/queryable-twice").expect("config"))
            .expect("open");
        let queryable = session
            .declare_queryable("svc/x", |_: Query| {})
            .expect("queryable");
        session.close().expect("close");
        assert_eq!(
            queryable.undeclare().expect_err("stale").kind(),
            ErrorKind::StaleHandle
        );
    }
}

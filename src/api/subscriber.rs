// Handle for a declared subscriber; its handler runs on transport worker threads.
#![allow(clippy::result_large_err)]

use super::session::SessionInner;
use crate::core::error::{Error, ErrorKind};
use crate::core::keyexpr::KeyExpr;
use crate::core::liveness::Liveness;
use crate::core::transport::EntityId;
use std::fmt;
use std::sync::Arc;

pub struct Subscriber {
    session: Arc<SessionInner>,
    entity: EntityId,
    key_expr: KeyExpr,
    liveness: Liveness,
}

impl Subscriber {
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

    /// Stops deliveries; fails with `StaleHandle` if already undeclared or the session closed.
    pub fn undeclare(self) -> Result<(), Error> {
        self.release()
    }

    fn release(&self) -> Result<(), Error> {
        if !self.liveness.revoke() {
            return Err(Error::new(ErrorKind::StaleHandle)
                .with_message("subscriber was undeclared or its session closed")
                .with_key_expr(self.key_expr.as_str()));
        }
        tracing::debug!(session = %self.session.id(), entity = self.entity, "undeclaring subscriber");
        self.session.undeclare_entity(self.entity)
    }
}

impl Drop for Subscriber {
    fn drop(&mut self) {
        if self.liveness.is_alive() {
            if let Err(err) = self.release() {
                tracing::warn!(entity = self.entity, "subscriber undeclare on drop failed: {err}");
            }
        }
    }
}

impl fmt::Debug for Subscriber {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscriber")
            .field("entity", &self.entity)
            .field("key_expr", &self.key_expr)
            .field("live", &self.liveness.is_alive())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use crate::api::config::{Config, PEER, WORKERS};
    use crate::api::session::{PutOptions, Session};
    use crate::core::fifo::{FullPolicy, TryRecv, bounded};
    use std::time::Duration;

    #[test]
    fn single_worker_delivers_in_publish_order_until_undeclared() {
        let config = Config::new()
            .with(PEER, "mem/subscriber-order")
            .and_then(|config| config.with(WORKERS, "1"))
            .expect("config");
        let session = Session::open(config).expect("open");
        let (sender, receiver) = bounded(16, FullPolicy::Block).expect("channel");
        let subscriber = session
            .declare_subscriber("order/**", sender)
            .expect("subscriber");
        assert!(subscriber.is_live());

        for n in 0..5 {
            session
                .put("order/n", format!("{n}"), PutOptions::default())
                .expect("put");
        }
        let received: Vec<String> = (0..5)
            .map(|_| match receiver.recv_timeout(Duration::from_secs(5)) {
                TryRecv::Item(sample) => sample.payload_str().unwrap_or_default().to_string(),
                other => panic!("missing sample: {other:?}"),
            })
            .collect();
        assert_eq!(received, ["0", "1", "2", "3", "4"]);

        subscriber.undeclare().expect("undeclare");
        session
            .put("order/n", "late", PutOptions::default())
            .expect("put");
        // Dropping the handler released the last sender.
        assert!(receiver.recv().is_none());
    }
}

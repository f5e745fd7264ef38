//! Purpose: Own one transport link plus everything declared through it.
//! Exports: `Session`, `SessionState`, `PutOptions`, `GetOptions`.
//! Role: Entry point of the client API; hands out publications, subscribers and queryables.
//! Invariants: Declarations, puts and gets are accepted only while the session is `Open`.
//! Invariants: `close` revokes every handle, ends outstanding gets and runs at most once.
//! Invariants: Key-expression ids are never reused within one session.
#![allow(clippy::result_large_err)]

use super::config::Config;
use super::publication::{Publication, PublicationOptions};
use super::queryable::Queryable;
use super::subscriber::Subscriber;
use super::{ReplyReceiver, ReplySender, reply_channel};
use crate::core::attachment::Attachment;
use crate::core::error::{Error, ErrorKind};
use crate::core::fifo::{FifoCloser, FullPolicy};
use crate::core::handler::{QueryHandler, SampleHandler};
use crate::core::hub;
use crate::core::keyexpr::KeyExpr;
use crate::core::liveness::Liveness;
use crate::core::sample::{Encoding, Qos, Reply, Sample};
use crate::core::table::{ExprId, KeyExprTable};
use crate::core::transport::{EntityId, NetworkId, Owner, QueryRequest, SessionId, Transport};
use bytes::Bytes;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum SessionState {
    Created,
    Open,
    Closing,
    Closed,
}

impl SessionState {
    pub fn as_str(self) -> &'static str {
        match self {
            SessionState::Created => "created",
            SessionState::Open => "open",
            SessionState::Closing => "closing",
            SessionState::Closed => "closed",
        }
    }
}

#[derive(Clone, Debug, Default)]
pub struct PutOptions {
    pub encoding: Option<Encoding>,
    pub attachment: Option<Attachment>,
}

/// Unset fields fall back to the session's config.
#[derive(Clone, Debug, Default)]
pub struct GetOptions {
    pub payload: Option<Bytes>,
    pub encoding: Option<Encoding>,
    pub attachment: Option<Attachment>,
    pub timeout: Option<Duration>,
    pub capacity: Option<usize>,
    pub full_policy: Option<FullPolicy>,
}

struct Declarations {
    state: SessionState,
    table: KeyExprTable,
    resources: HashMap<ExprId, NetworkId>,
    publications: HashMap<u64, Liveness>,
    next_publication: u64,
    entities: HashMap<EntityId, Liveness>,
    pending_gets: Vec<FifoCloser<Reply>>,
}

pub(crate) struct SessionInner {
    id: SessionId,
    config: Config,
    transport: Arc<dyn Transport>,
    declarations: Mutex<Declarations>,
}

pub struct Session {
    inner: Arc<SessionInner>,
}

impl Session {
    /// Connects to the `peer` endpoint named by `config`.
    pub fn open(config: Config) -> Result<Self, Error> {
        let link = hub::connect(config.peer(), config.hub_options())?;
        Ok(Self::open_with_transport(config, Arc::new(link)))
    }

    pub fn open_with_transport(config: Config, transport: Arc<dyn Transport>) -> Self {
        let inner = Arc::new(SessionInner {
            id: SessionId::next(),
            config,
            transport,
            declarations: Mutex::new(Declarations {
                state: SessionState::Created,
                table: KeyExprTable::new(),
                resources: HashMap::new(),
                publications: HashMap::new(),
                next_publication: 0,
                entities: HashMap::new(),
                pending_gets: Vec::new(),
            }),
        });
        inner.lock().state = SessionState::Open;
        tracing::info!(session = %inner.id, peer = inner.config.peer(), "session open");
        Self { inner }
    }

    pub fn id(&self) -> SessionId {
        self.inner.id
    }

    pub fn config(&self) -> &Config {
        &self.inner.config
    }

    pub fn state(&self) -> SessionState {
        self.inner.lock().state
    }

    pub fn declare_keyexpr(&self, expr: &str) -> Result<ExprId, Error> {
        let key_expr = KeyExpr::new(expr)?;
        let mut declarations = self.inner.lock_open()?;
        let id = declarations.table.declare_expr(key_expr.clone())?;
        match self.inner.transport.declare_resource(&key_expr) {
            Ok(network_id) => {
                declarations.resources.insert(id, network_id);
                tracing::debug!(session = %self.inner.id, %id, key_expr = %key_expr, "declared key expression");
                Ok(id)
            }
            Err(err) => {
                let _ = declarations.table.undeclare(id);
                Err(err.with_key_expr(key_expr.as_str()))
            }
        }
    }

    /// The transport resource is released first; on failure the id stays declared.
    pub fn undeclare_keyexpr(&self, id: ExprId) -> Result<(), Error> {
        let mut declarations = self.inner.lock_open()?;
        declarations.table.resolve(id)?;
        if let Some(&network_id) = declarations.resources.get(&id) {
            self.inner.transport.undeclare_resource(network_id)?;
            declarations.resources.remove(&id);
        }
        let key_expr = declarations.table.undeclare(id)?;
        tracing::debug!(session = %self.inner.id, %id, key_expr = %key_expr, "undeclared key expression");
        Ok(())
    }

    pub fn resolve_keyexpr(&self, id: ExprId) -> Result<KeyExpr, Error> {
        self.inner.lock().table.resolve(id).cloned()
    }

    pub fn declare_publication(
        &self,
        id: ExprId,
        options: PublicationOptions,
    ) -> Result<Publication, Error> {
        let mut declarations = self.inner.lock_open()?;
        let key_expr = declarations.table.resolve(id)?.clone();
        let Some(&resource) = declarations.resources.get(&id) else {
            return Err(Error::new(ErrorKind::UnknownId)
                .with_message("key expression id has no transport resource")
                .with_id(id.get())
                .with_key_expr(key_expr.as_str()));
        };
        declarations.next_publication += 1;
        let token = declarations.next_publication;
        let liveness = Liveness::new();
        declarations.publications.insert(token, liveness.clone());
        tracing::debug!(session = %self.inner.id, %id, key_expr = %key_expr, "declared publication");
        Ok(Publication::new(
            self.inner.clone(),
            token,
            id,
            resource,
            key_expr,
            options,
            liveness,
        ))
    }

    pub fn declare_subscriber<H: SampleHandler>(
        &self,
        key_expr: &str,
        handler: H,
    ) -> Result<Subscriber, Error> {
        let key_expr = KeyExpr::new(key_expr)?;
        let mut declarations = self.inner.lock_open()?;
        let owner = self.inner.owner();
        let entity =
            self.inner
                .transport
                .declare_subscriber(owner.clone(), &key_expr, Arc::new(handler))?;
        declarations.entities.insert(entity, owner.liveness.clone());
        tracing::debug!(session = %self.inner.id, entity, key_expr = %key_expr, "declared subscriber");
        Ok(Subscriber::new(
            self.inner.clone(),
            entity,
            key_expr,
            owner.liveness,
        ))
    }

    pub fn declare_queryable<H: QueryHandler>(
        &self,
        key_expr: &str,
        handler: H,
    ) -> Result<Queryable, Error> {
        let key_expr = KeyExpr::new(key_expr)?;
        let mut declarations = self.inner.lock_open()?;
        let owner = self.inner.owner();
        let entity =
            self.inner
                .transport
                .declare_queryable(owner.clone(), &key_expr, Arc::new(handler))?;
        declarations.entities.insert(entity, owner.liveness.clone());
        tracing::debug!(session = %self.inner.id, entity, key_expr = %key_expr, "declared queryable");
        Ok(Queryable::new(
            self.inner.clone(),
            entity,
            key_expr,
            owner.liveness,
        ))
    }

    pub fn put(
        &self,
        key_expr: &str,
        payload: impl Into<Bytes>,
        options: PutOptions,
    ) -> Result<(), Error> {
        let mut sample = Sample::put(KeyExpr::new(key_expr)?, payload);
        if let Some(encoding) = options.encoding {
            sample.encoding = encoding;
        }
        sample.attachment = options.attachment;
        self.inner.publish(sample, Qos::default())
    }

    pub fn delete(&self, key_expr: &str) -> Result<(), Error> {
        self.inner
            .publish(Sample::delete(KeyExpr::new(key_expr)?), Qos::default())
    }

    /// Sends a query and returns the stream of its replies without waiting for any.
    pub fn get(
        &self,
        key_expr: &str,
        parameters: &str,
        options: GetOptions,
    ) -> Result<ReplyReceiver, Error> {
        let capacity = options
            .capacity
            .unwrap_or_else(|| self.inner.config.reply_capacity());
        let policy = options
            .full_policy
            .unwrap_or_else(|| self.inner.config.reply_full_policy());
        let (sender, receiver) = reply_channel(capacity, policy)?;
        self.get_with_channel(key_expr, parameters, options, sender)?;
        Ok(receiver)
    }

    /// Like `get`, but replies flow into a caller-built channel.
    pub fn get_with_channel(
        &self,
        key_expr: &str,
        parameters: &str,
        options: GetOptions,
        replies: ReplySender,
    ) -> Result<(), Error> {
        let key_expr = KeyExpr::new(key_expr)?;
        let timeout = options
            .timeout
            .unwrap_or_else(|| self.inner.config.query_timeout());
        replies.set_deadline(Instant::now() + timeout);
        {
            let mut declarations = self.inner.lock_open()?;
            declarations
                .pending_gets
                .retain(|closer| !closer.is_released());
            declarations.pending_gets.push(replies.closer());
        }
        tracing::debug!(session = %self.inner.id, key_expr = %key_expr, parameters, "sending query");
        self.inner.transport.send_query(QueryRequest {
            key_expr,
            parameters: parameters.to_string(),
            payload: options.payload,
            encoding: options.encoding,
            attachment: options.attachment,
            replies,
        })
    }

    /// Idempotent; later calls return `Ok(())` without doing anything.
    pub fn close(&self) -> Result<(), Error> {
        self.inner.close()
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        if let Err(err) = self.inner.close() {
            tracing::warn!(session = %self.inner.id, "close on drop failed: {err}");
        }
    }
}

impl SessionInner {
    fn lock(&self) -> MutexGuard<'_, Declarations> {
        self.declarations
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    fn lock_open(&self) -> Result<MutexGuard<'_, Declarations>, Error> {
        let declarations = self.lock();
        if declarations.state != SessionState::Open {
            return Err(Error::new(ErrorKind::StaleHandle).with_message(format!(
                "session is {}",
                declarations.state.as_str()
            )));
        }
        Ok(declarations)
    }

    fn owner(&self) -> Owner {
        Owner {
            session: self.id,
            liveness: Liveness::new(),
        }
    }

    pub(crate) fn id(&self) -> SessionId {
        self.id
    }

    /// Fails with `StaleHandle` once the session is closing or `id` was undeclared.
    pub(crate) fn ensure_expr(&self, id: ExprId) -> Result<(), Error> {
        let declarations = self.lock_open()?;
        if !declarations.table.contains(id) {
            return Err(Error::new(ErrorKind::StaleHandle)
                .with_message("key expression id was undeclared")
                .with_id(id.get()));
        }
        Ok(())
    }

    fn publish(&self, mut sample: Sample, qos: Qos) -> Result<(), Error> {
        drop(self.lock_open()?);
        sample.qos = qos;
        sample.source = Some(self.id);
        self.transport.publish_expr(sample)
    }

    pub(crate) fn publish_resource(
        &self,
        resource: NetworkId,
        mut sample: Sample,
        qos: Qos,
    ) -> Result<(), Error> {
        drop(self.lock_open()?);
        sample.qos = qos;
        sample.source = Some(self.id);
        self.transport.publish(resource, sample)
    }

    pub(crate) fn matching_subscribers(&self, key_expr: &KeyExpr) -> Result<usize, Error> {
        drop(self.lock_open()?);
        Ok(self.transport.matching_subscribers(key_expr))
    }

    pub(crate) fn forget_publication(&self, token: u64) {
        self.lock().publications.remove(&token);
    }

    pub(crate) fn undeclare_entity(&self, entity: EntityId) -> Result<(), Error> {
        let removed = self.lock().entities.remove(&entity);
        match removed {
            Some(_) => self.transport.undeclare_entity(entity),
            None => Ok(()),
        }
    }

    fn close(&self) -> Result<(), Error> {
        let (publications, entities, resources, pending_gets) = {
            let mut declarations = self.lock();
            match declarations.state {
                SessionState::Closing | SessionState::Closed => return Ok(()),
                SessionState::Created | SessionState::Open => {}
            }
            declarations.state = SessionState::Closing;
            declarations.table.drain();
            (
                std::mem::take(&mut declarations.publications),
                std::mem::take(&mut declarations.entities),
                std::mem::take(&mut declarations.resources),
                std::mem::take(&mut declarations.pending_gets),
            )
        };

        for liveness in publications.values() {
            liveness.revoke();
        }
        for (entity, liveness) in entities {
            liveness.revoke();
            if let Err(err) = self.transport.undeclare_entity(entity) {
                tracing::warn!(session = %self.id, entity, "undeclare during close failed: {err}");
            }
        }
        for closer in pending_gets {
            closer.close();
        }
        for network_id in resources.into_values() {
            if let Err(err) = self.transport.undeclare_resource(network_id) {
                tracing::warn!(session = %self.id, network_id, "resource release during close failed: {err}");
            }
        }

        let result = self.transport.close();
        self.lock().state = SessionState::Closed;
        tracing::info!(session = %self.id, "session closed");
        result
    }
}

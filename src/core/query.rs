// Incoming query as seen by a queryable, and the reply path back to the querier.
use crate::core::attachment::Attachment;
use crate::core::error::{Error, ErrorKind};
use crate::core::fifo::FifoSender;
use crate::core::keyexpr::KeyExpr;
use crate::core::sample::{Encoding, Reply, ReplyError, Sample};
use crate::core::transport::{Owner, QueryRequest};
use bytes::Bytes;
use std::fmt;
use std::sync::Arc;

#[derive(Clone, Debug, Default)]
pub struct ReplyOptions {
    pub encoding: Option<Encoding>,
    pub attachment: Option<Attachment>,
}

/// Shared by every `Query` built from one request; dropping the last one
/// releases the reply sender, which ends the querier's stream.
struct ReplyRoute {
    replies: FifoSender<Reply>,
}

/// A query delivered to one queryable.
///
/// Replies may be sent any number of times until the value is dropped.
pub struct Query {
    key_expr: KeyExpr,
    parameters: String,
    payload: Option<Bytes>,
    encoding: Option<Encoding>,
    attachment: Option<Attachment>,
    route: Arc<ReplyRoute>,
    replier: Owner,
}

/// Splits one request into per-queryable `Query` values.
pub(crate) struct QueryFanout {
    key_expr: KeyExpr,
    parameters: String,
    payload: Option<Bytes>,
    encoding: Option<Encoding>,
    attachment: Option<Attachment>,
    route: Arc<ReplyRoute>,
}

impl QueryFanout {
    pub(crate) fn new(request: QueryRequest) -> Self {
        Self {
            key_expr: request.key_expr,
            parameters: request.parameters,
            payload: request.payload,
            encoding: request.encoding,
            attachment: request.attachment,
            route: Arc::new(ReplyRoute {
                replies: request.replies,
            }),
        }
    }

    pub(crate) fn key_expr(&self) -> &KeyExpr {
        &self.key_expr
    }

    pub(crate) fn query_for(&self, replier: Owner) -> Query {
        Query {
            key_expr: self.key_expr.clone(),
            parameters: self.parameters.clone(),
            payload: self.payload.clone(),
            encoding: self.encoding.clone(),
            attachment: self.attachment.clone(),
            route: self.route.clone(),
            replier,
        }
    }
}

impl Query {
    pub fn key_expr(&self) -> &KeyExpr {
        &self.key_expr
    }

    pub fn parameters(&self) -> &str {
        &self.parameters
    }

    pub fn payload(&self) -> Option<&Bytes> {
        self.payload.as_ref()
    }

    pub fn encoding(&self) -> Option<&Encoding> {
        self.encoding.as_ref()
    }

    pub fn attachment(&self) -> Option<&Attachment> {
        self.attachment.as_ref()
    }

    pub fn reply(
        &self,
        key_expr: &str,
        payload: impl Into<Bytes>,
        options: ReplyOptions,
    ) -> Result<(), Error> {
        let mut sample = Sample::put(self.reply_key(key_expr)?, payload);
        if let Some(encoding) = options.encoding {
            sample.encoding = encoding;
        }
        sample.attachment = options.attachment;
        self.send(sample)
    }

    pub fn reply_delete(&self, key_expr: &str, options: ReplyOptions) -> Result<(), Error> {
        let mut sample = Sample::delete(self.reply_key(key_expr)?);
        sample.attachment = options.attachment;
        self.send(sample)
    }

    pub fn reply_err(&self, payload: impl Into<Bytes>, encoding: Option<Encoding>) -> Result<(), Error> {
        self.ensure_live()?;
        let error = ReplyError {
            payload: payload.into(),
            encoding: encoding.unwrap_or_default(),
        };
        self.route
            .replies
            .send(Reply::err(error, self.replier.session))
    }

    fn reply_key(&self, key_expr: &str) -> Result<KeyExpr, Error> {
        self.ensure_live()?;
        let key_expr = KeyExpr::new(key_expr)?;
        if !key_expr.intersects(&self.key_expr) {
            return Err(Error::new(ErrorKind::Usage)
                .with_message(format!(
                    "reply key expression does not intersect query '{}'",
                    self.key_expr
                ))
                .with_key_expr(key_expr.as_str()));
        }
        Ok(key_expr)
    }

    fn send(&self, mut sample: Sample) -> Result<(), Error> {
        sample.source = Some(self.replier.session);
        self.route
            .replies
            .send(Reply::ok(sample, self.replier.session))
    }

    fn ensure_live(&self) -> Result<(), Error> {
        if !self.replier.liveness.is_alive() {
            return Err(Error::new(ErrorKind::StaleHandle)
                .with_message("queryable was undeclared or its session closed")
                .with_key_expr(self.key_expr.as_str()));
        }
        Ok(())
    }
}

impl fmt::Debug for Query {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Query")
            .field("key_expr", &self.key_expr)
            .field("parameters", &self.parameters)
            .field("payload_len", &self.payload.as_ref().map(Bytes::len))
            .field("attachment", &self.attachment)
            .field("replier", &self.replier.session)
            .finish()
    }
}

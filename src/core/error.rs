// Error kinds shared by the key-expression table, codecs, channels and sessions.
use std::error::Error as StdError;
use std::fmt;

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ErrorKind {
    Internal,
    Usage,
    InvalidExpression,
    UnknownId,
    StaleHandle,
    Connection,
    Transport,
    CorruptAttachment,
    AttachmentMismatch,
    ChannelFull,
    ChannelClosed,
}

impl ErrorKind {
    pub fn as_str(self) -> &'static str {
        match self {
            ErrorKind::Internal => "internal",
            ErrorKind::Usage => "usage",
            ErrorKind::InvalidExpression => "invalid_expression",
            ErrorKind::UnknownId => "unknown_id",
            ErrorKind::StaleHandle => "stale_handle",
            ErrorKind::Connection => "connection",
            ErrorKind::Transport => "transport",
            ErrorKind::CorruptAttachment => "corrupt_attachment",
            ErrorKind::AttachmentMismatch => "attachment_mismatch",
            ErrorKind::ChannelFull => "channel_full",
            ErrorKind::ChannelClosed => "channel_closed",
        }
    }
}

#[derive(Debug)]
pub struct Error {
    kind: ErrorKind,
    message: Option<String>,
    hint: Option<String>,
    key_expr: Option<String>,
    id: Option<u64>,
    source: Option<Box<dyn StdError + Send + Sync>>,
}

impl Error {
    pub fn new(kind: ErrorKind) -> Self {
        Self {
            kind,
            message: None,
            hint: None,
            key_expr: None,
            id: None,
            source: None,
        }
    }

    pub fn kind(&self) -> ErrorKind {
        self.kind
    }

    pub fn message(&self) -> Option<&str> {
        self.message.as_deref()
    }

    pub fn hint(&self) -> Option<&str> {
        self.hint.as_deref()
    }

    pub fn key_expr(&self) -> Option<&str> {
        self.key_expr.as_deref()
    }

    pub fn id(&self) -> Option<u64> {
        self.id
    }

    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        self.message = Some(message.into());
        self
    }

    pub fn with_hint(mut self, hint: impl Into<String>) -> Self {
        self.hint = Some(hint.into());
        self
    }

    pub fn with_key_expr(mut self, key_expr: impl Into<String>) -> Self {
        self.key_expr = Some(key_expr.into());
        self
    }

    pub fn with_id(mut self, id: u64) -> Self {
        self.id = Some(id);
        self
    }

    pub fn with_source(mut self, source: impl StdError + Send + Sync + 'static) -> Self {
        self.source = Some(Box::new(source));
        self
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self.kind)?;
        if let Some(message) = &self.message {
            write!(f, ": {message}")?;
        }
        if let Some(key_expr) = &self.key_expr {
            write!(f, " (key_expr: {key_expr})")?;
        }
        if let Some(id) = self.id {
            write!(f, " (id: {id})")?;
        }
        Ok(())
    }
}

impl StdError for Error {
    fn source(&self) -> Option<&(dyn StdError + 'static)> {
        self.source
            .as_ref()
            .map(|source| source.as_ref() as &(dyn StdError + 'static))
    }
}

pub fn to_exit_code(kind: ErrorKind) -> i32 {
    match kind {
        ErrorKind::Internal => 1,
        ErrorKind::Usage => 2,
        ErrorKind::InvalidExpression => 3,
        ErrorKind::UnknownId => 4,
        ErrorKind::StaleHandle => 5,
        ErrorKind::Connection => 6,
        ErrorKind::Transport => 7,
        ErrorKind::CorruptAttachment => 8,
        ErrorKind::AttachmentMismatch => 9,
        ErrorKind::ChannelFull => 10,
        ErrorKind::ChannelClosed => 11,
    }
}

// Data carried by puts, deletes and replies.
use crate::core::attachment::Attachment;
use crate::core::error::{Error, ErrorKind};
use crate::core::keyexpr::KeyExpr;
use crate::core::transport::SessionId;
use bytes::Bytes;
use std::fmt;
use std::time::SystemTime;

#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub enum SampleKind {
    #[default]
    Put,
    Delete,
}

impl SampleKind {
    pub fn as_str(self) -> &'static str {
        match self {
            SampleKind::Put => "put",
            SampleKind::Delete => "delete",
        }
    }
}

/// Free-form content type label; defaults to raw bytes.
#[derive(Clone, Debug, Eq, Hash, PartialEq)]
pub struct Encoding(String);

impl Encoding {
    pub const OCTET_STREAM: &'static str = "application/octet-stream";
    pub const TEXT_PLAIN: &'static str = "text/plain";

    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    pub fn text_plain() -> Self {
        Self::new(Self::TEXT_PLAIN)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for Encoding {
    fn default() -> Self {
        Self::new(Self::OCTET_STREAM)
    }
}

impl fmt::Display for Encoding {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub enum CongestionControl {
    #[default]
    Block,
    Drop,
}

#[derive(Clone, Copy, Debug, Default, Eq, Ord, PartialEq, PartialOrd)]
pub enum Priority {
    RealTime = 1,
    InteractiveHigh = 2,
    InteractiveLow = 3,
    DataHigh = 4,
    #[default]
    Data = 5,
    DataLow = 6,
    Background = 7,
}

impl TryFrom<u8> for Priority {
    type Error = Error;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            1 => Ok(Priority::RealTime),
            2 => Ok(Priority::InteractiveHigh),
            3 => Ok(Priority::InteractiveLow),
            4 => Ok(Priority::DataHigh),
            5 => Ok(Priority::Data),
            6 => Ok(Priority::DataLow),
            7 => Ok(Priority::Background),
            _ => Err(Error::new(ErrorKind::Usage)
                .with_message(format!("priority must be within 1..=7, got {value}"))),
        }
    }
}

#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct Qos {
    pub priority: Priority,
    pub congestion_control: CongestionControl,
}

#[derive(Clone, Debug)]
pub struct Sample {
    pub key_expr: KeyExpr,
    pub payload: Bytes,
    pub kind: SampleKind,
    pub encoding: Encoding,
    pub timestamp: SystemTime,
    pub qos: Qos,
    pub attachment: Option<Attachment>,
    pub source: Option<SessionId>,
}

impl Sample {
    pub fn put(key_expr: KeyExpr, payload: impl Into<Bytes>) -> Self {
        Self {
            key_expr,
            payload: payload.into(),
            kind: SampleKind::Put,
            encoding: Encoding::default(),
            timestamp: SystemTime::now(),
            qos: Qos::default(),
            attachment: None,
            source: None,
        }
    }

    pub fn delete(key_expr: KeyExpr) -> Self {
        Self {
            kind: SampleKind::Delete,
            ..Self::put(key_expr, Bytes::new())
        }
    }

    pub fn payload_str(&self) -> Option<&str> {
        std::str::from_utf8(&self.payload).ok()
    }
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct ReplyError {
    pub payload: Bytes,
    pub encoding: Encoding,
}

#[derive(Clone, Debug)]
pub struct Reply {
    result: Result<Sample, ReplyError>,
    replier: SessionId,
}

impl Reply {
    pub(crate) fn ok(sample: Sample, replier: SessionId) -> Self {
        Self {
            result: Ok(sample),
            replier,
        }
    }

    pub(crate) fn err(error: ReplyError, replier: SessionId) -> Self {
        Self {
            result: Err(error),
            replier,
        }
    }

    pub fn is_ok(&self) -> bool {
        self.result.is_ok()
    }

    pub fn sample(&self) -> Option<&Sample> {
        self.result.as_ref().ok()
    }

    pub fn error(&self) -> Option<&ReplyError> {
        self.result.as_ref().err()
    }

    pub fn replier(&self) -> SessionId {
        self.replier
    }

    pub fn into_result(self) -> Result<Sample, ReplyError> {
        self.result
    }
}

//! Purpose: String-keyed session configuration with typed accessors.
//! Exports: `Config` and the known key names.
//! Role: Single source of defaults for sessions, the memory hub and the CLI.
//! Invariants: Only known keys are stored, and every stored value parses for its key.
//! Invariants: Unset keys fall back to documented defaults at read time.
#![allow(clippy::result_large_err)]

use crate::core::error::{Error, ErrorKind};
use crate::core::fifo::FullPolicy;
use crate::core::hub::HubOptions;
use serde::Deserialize;
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;

pub const PEER: &str = "peer";
pub const QUERY_TIMEOUT_MS: &str = "query_timeout_ms";
pub const WORKERS: &str = "workers";
pub const QUEUE_DEPTH: &str = "queue_depth";
pub const REPLY_CAPACITY: &str = "reply_capacity";
pub const REPLY_FULL_POLICY: &str = "reply_full_policy";

pub const DEFAULT_PEER: &str = "mem/default";
const DEFAULT_QUERY_TIMEOUT_MS: u64 = 10_000;
const DEFAULT_WORKERS: usize = 2;
const DEFAULT_QUEUE_DEPTH: usize = 1024;
const DEFAULT_REPLY_CAPACITY: usize = 16;

const KNOWN_KEYS: [&str; 6] = [
    PEER,
    QUERY_TIMEOUT_MS,
    WORKERS,
    QUEUE_DEPTH,
    REPLY_CAPACITY,
    REPLY_FULL_POLICY,
];

#[derive(Deserialize)]
#[serde(untagged)]
enum RawValue {
    Text(String),
    Number(u64),
}

impl RawValue {
    fn into_string(self) -> String {
        match self {
            RawValue::Text(text) => text,
            RawValue::Number(number) => number.to_string(),
        }
    }
}

#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct Config {
    values: BTreeMap<String, String>,
}

impl Config {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, key: &str, value: impl Into<String>) -> Result<Self, Error> {
        self.insert(key, value)?;
        Ok(self)
    }

    pub fn insert(&mut self, key: &str, value: impl Into<String>) -> Result<(), Error> {
        let value = value.into();
        validate_entry(key, &value)?;
        self.values.insert(key.to_string(), value);
        Ok(())
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.values.get(key).map(String::as_str)
    }

    pub fn peer(&self) -> &str {
        self.get(PEER).unwrap_or(DEFAULT_PEER)
    }

    pub fn query_timeout(&self) -> Duration {
        Duration::from_millis(self.number(QUERY_TIMEOUT_MS).unwrap_or(DEFAULT_QUERY_TIMEOUT_MS))
    }

    pub fn workers(&self) -> usize {
        self.count(WORKERS).unwrap_or(DEFAULT_WORKERS)
    }

    pub fn queue_depth(&self) -> usize {
        self.count(QUEUE_DEPTH).unwrap_or(DEFAULT_QUEUE_DEPTH)
    }

    pub fn reply_capacity(&self) -> usize {
        self.count(REPLY_CAPACITY).unwrap_or(DEFAULT_REPLY_CAPACITY)
    }

    pub fn reply_full_policy(&self) -> FullPolicy {
        self.get(REPLY_FULL_POLICY)
            .and_then(FullPolicy::parse)
            .unwrap_or_default()
    }

    pub fn hub_options(&self) -> HubOptions {
        HubOptions {
            workers: self.workers(),
            queue_depth: self.queue_depth(),
        }
    }

    /// Accepts a flat JSON object whose values are strings or non-negative integers.
    pub fn from_json_str(text: &str) -> Result<Self, Error> {
        let raw: BTreeMap<String, RawValue> = serde_json::from_str(text).map_err(|err| {
            Error::new(ErrorKind::Usage)
                .with_message("config must be a flat JSON object of strings or integers")
                .with_source(err)
        })?;
        let mut config = Self::new();
        for (key, value) in raw {
            config.insert(&key, value.into_string())?;
        }
        Ok(config)
    }

    pub fn from_json_file(path: &Path) -> Result<Self, Error> {
        let text = std::fs::read_to_string(path).map_err(|err| {
            Error::new(ErrorKind::Usage)
                .with_message(format!("failed to read config '{}'", path.display()))
                .with_source(err)
        })?;
        Self::from_json_str(&text)
    }

    /// Effective values, defaults included.
    pub fn to_json(&self) -> Value {
        let mut map = Map::new();
        map.insert(PEER.to_string(), Value::from(self.peer()));
        map.insert(
            QUERY_TIMEOUT_MS.to_string(),
            Value::from(self.query_timeout().as_millis() as u64),
        );
        map.insert(WORKERS.to_string(), Value::from(self.workers()));
        map.insert(QUEUE_DEPTH.to_string(), Value::from(self.queue_depth()));
        map.insert(REPLY_CAPACITY.to_string(), Value::from(self.reply_capacity()));
        map.insert(
            REPLY_FULL_POLICY.to_string(),
            Value::from(self.reply_full_policy().as_str()),
        );
        Value::Object(map)
    }

    fn number(&self, key: &str) -> Option<u64> {
        self.get(key).and_then(|value| value.parse().ok())
    }

    fn count(&self, key: &str) -> Option<usize> {
        self.get(key).and_then(|value| value.parse().ok())
    }
}

fn validate_entry(key: &str, value: &str) -> Result<(), Error> {
    match key {
        PEER => {
            if value.trim().is_empty() {
                return Err(invalid(key, value, "peer endpoint must not be empty"));
            }
        }
        QUERY_TIMEOUT_MS => {
            value
                .parse::<u64>()
                .map_err(|_| invalid(key, value, "expected milliseconds as an integer"))?;
        }
        WORKERS | QUEUE_DEPTH | REPLY_CAPACITY => match value.parse::<usize>() {
            Ok(count) if count > 0 => {}
            _ => return Err(invalid(key, value, "expected a positive integer")),
        },
        REPLY_FULL_POLICY => {
            if FullPolicy::parse(value).is_none() {
                return Err(invalid(key, value, "expected 'block' or 'fail'"));
            }
        }
        _ => {
            return Err(Error::new(ErrorKind::Usage)
                .with_message(format!("unknown config key '{key}'"))
                .with_hint(format!("known keys: {}", KNOWN_KEYS.join(", "))));
        }
    }
    Ok(())
}

fn invalid(key: &str, value: &str, hint: &str) -> Error {
    Error::new(ErrorKind::Usage)
        .with_message(format!("invalid value '{value}' for config key '{key}'"))
        .with_hint(hint)
}

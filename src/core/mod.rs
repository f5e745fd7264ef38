// Core modules: key expressions, attachments, reply channels, transport and errors.
pub mod attachment;
pub mod error;
pub mod fifo;
pub mod handler;
pub mod hub;
pub mod keyexpr;
pub mod liveness;
pub mod query;
pub mod sample;
pub mod table;
pub mod transport;

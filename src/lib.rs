//! Purpose: Client library for a key-expression addressed pub/sub and query/reply data plane.
//! Exports: `api` (sessions, declarations, config) and `core` (codecs, channels, transport).
//! Role: Backs the `keyplane` CLI and the integration tests.
//! Invariants: Sessions talk to peers only through `core::transport::Transport`.
//! Invariants: Core modules prefer explicit inputs/outputs over hidden state.
pub mod api;
pub mod core;

//! Request/reply over a partitioned log.
//!
//! A caller appends a request keyed by a fresh correlation id and waits;
//! a worker consumes it, evaluates the arithmetic expression it carries,
//! and appends a reply under the same key; the caller's broker routes that
//! reply back to the one waiting call. Scans and topic introspection read
//! the same log directly.

pub mod banner;
pub mod broker;
pub mod commands;
pub mod config;
pub mod consts;
pub mod evaluator;
pub mod events;
pub mod introspect;
pub mod registry;
pub mod scanner;
pub mod service;
pub mod spinner;
pub mod telemetry;
pub mod transport;
pub mod wire;
pub mod worker;

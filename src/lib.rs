//! Longpoll Pubsub - HTTP long-poll event broker
//!
//! Publishers push `(category, body)` events to a configured publish path;
//! subscribers long-poll a subscribe path and return as soon as a matching
//! event arrives or their timeout elapses. Each configured rule owns an
//! independent broker.

pub mod broker;
pub mod config;
pub mod handlers;
pub mod utils;

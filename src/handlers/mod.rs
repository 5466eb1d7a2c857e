//! HTTP handlers mounting brokers on configured paths.

pub mod errmsg;
pub mod router;

pub use router::{Endpoint, Rule, RuleRouter};

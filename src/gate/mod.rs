//! The Access Gate: who is asking, what they asked for, and where they go.

pub mod middleware;
pub mod policy;
pub mod session;

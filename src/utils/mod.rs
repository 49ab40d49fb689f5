//! Shared helpers: logging setup and scope guards.

pub mod guard;
pub mod logger;

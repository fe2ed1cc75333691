//! Reference adapters for the core's injected ports. Nothing in here is
//! required: every adapter is a thin, swappable implementation of a
//! trait in [`crate::ports`]; a host application is free to bring its
//! own instead.

#[cfg(feature = "http-adapters")]
pub mod http;

//! # lib-types
//!
//! Core type definitions shared across the SinkCall workspace.
//!
//! This crate provides the plain data types that both sides of a
//! cross-domain invocation agree on:
//! - Library lifecycle states
//! - Word-sized argument values and their bit reinterpretation
//! - Device, stream and proxy identifiers
//! - Protocol limits
//! - Runtime configuration

pub mod limits;
pub mod state;
pub mod word;
pub mod ids;
pub mod config;

pub use limits::*;
pub use state::*;
pub use word::*;
pub use ids::*;
pub use config::*;

//! Wire types for nsm session events.
//!
//! This crate contains the serde-serializable types a session emits toward
//! presentation layers (terminal dashboards, headless loggers, editors) and
//! the port descriptor written into the project directory.
//!
//! Everything here is plain data: statuses and sources are closed enums,
//! and the JSON shape only changes when a consumer-visible field does.
//!
//! The engine that produces these events lives in `nsm-rs`.

pub mod descriptor;
pub mod event;

pub use descriptor::*;
pub use event::*;

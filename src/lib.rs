//! Core library for oscilloscope test automation.
//!
//! This library runs measurement sequences and user scripts against a remote
//! instrument, evaluates compound trigger conditions on captured records, and keeps
//! multi-channel acquisitions time-aligned. The instrument itself is reached only
//! through the [`InstrumentDriver`](instrument::InstrumentDriver) trait; a single
//! [`SharedDriver`](instrument::SharedDriver) lease serializes every command.
//!
//! The main entry points are:
//!
//! - [`engine::SequenceEngine`]: queue, pause, resume and cancel runs.
//! - [`script::ScriptRuntime`]: validate, compile and run Rhai scripts on the engine.
//! - [`sync::SyncCoordinator`]: channel groups, ordered arming and sync quality.
//! - [`trigger`]: trigger condition trees and their evaluation.
//! - [`persistence`]: versioned JSON documents for all of the above.

pub mod analysis;
pub mod config;
pub mod engine;
pub mod error;
pub mod error_recovery;
pub mod instrument;
pub mod logging;
pub mod persistence;
pub mod script;
pub mod sequence;
pub mod sync;
pub mod trigger;

pub use error::{AppResult, AutomationError, ErrorKind};

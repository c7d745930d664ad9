//! vcrplay - record/replay HTTP proxy for deterministic tests against a
//! remote HTTP dependency.
//!
//! The [`player`] module owns the state machine and proxy loop; [`cassette`]
//! and [`record`] provide the on-disk and in-memory persistence; [`mock`]
//! canonicalizes HTTP exchanges and decides replay matches.

#![deny(unsafe_op_in_unsafe_fn)]
#![warn(missing_docs, clippy::all, clippy::pedantic, clippy::cargo)]
#![allow(
    clippy::module_name_repetitions,
    clippy::must_use_candidate,
    clippy::cast_possible_truncation,
    clippy::cast_precision_loss,
    clippy::field_reassign_with_default,
    clippy::multiple_crate_versions
)]

pub mod cassette;
pub mod config;
pub mod error;
pub mod mock;
pub mod player;
pub mod record;

pub use error::{PlayerError, Result};

//! lockwrap-lib: packaging pipeline for lockwrap
//!
//! This crate turns an executable into generated source that embeds it and
//! compiles that source into a wrapped artifact:
//! - `Payload` / `BuildRequest`: the input and everything derived from it
//! - `template`: fills the placeholder markers of the source skeleton
//! - `icon`: picks or extracts the icon handed to the compiler
//! - `compile`: runs the external compiler and classifies its output
//! - `promote`: moves the result into place and records it for reuse
//! - `Packager`: drives the stages under a per-digest lock

pub mod compile;
pub mod config;
pub mod consts;
pub mod digest_lock;
pub mod icon;
pub mod pipeline;
pub mod placeholder;
pub mod platform;
pub mod promote;
pub mod template;
pub mod util;
pub mod workspace;

pub use config::PackConfig;
pub use pipeline::{BuildRequest, PackError, PackOptions, PackOutcome, Packager, Payload};

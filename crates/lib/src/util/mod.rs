//! Shared utilities.
//!
//! Hashing and test helpers used across the crate.

pub mod hash;

#[cfg(test)]
pub mod testutil;

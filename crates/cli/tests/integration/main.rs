//! CLI integration tests. They drive the real binary against a `/bin/sh`
//! stand-in for the compiler, so they only run on Unix.

#![cfg(unix)]

mod common;
mod pack_tests;

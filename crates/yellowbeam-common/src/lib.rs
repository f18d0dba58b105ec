//! # yellowbeam-common
//!
//! Configuration shared by the Yellowbeam crates.

pub mod config;

//! Shared core types

pub mod errors;

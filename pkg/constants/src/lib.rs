//! Centralized constants for the commander API.
//!
//! All project-wide constant values live here.
//! Change a value in one place and it applies everywhere.

pub mod lease;
pub mod network;
pub mod paths;
pub mod state;

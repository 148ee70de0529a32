//! Shared utility functions for the wicket-rs gateway.

pub mod path;

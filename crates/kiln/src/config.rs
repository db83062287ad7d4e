//! Re-export of the environment-driven configuration layer.
//!
//! Kept as its own module (rather than importing `kiln_config` directly
//! throughout the crate) so call sites read `config::Config` alongside
//! `state_store`, `lock`, and the other coordination modules.

pub use kiln_config::{AlwaysRerun, Config};

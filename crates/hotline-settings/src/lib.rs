//! # hotline-settings
//!
//! Configuration for the hotline call broker.
//!
//! Settings are loaded from three layers (in priority order):
//! 1. **Compiled defaults**: [`HotlineSettings::default()`]
//! 2. **Settings file**: a JSON file passed on the command line, deep-merged
//!    over the defaults
//! 3. **Environment variables**: `HOTLINE_*` overrides (highest priority)
//!
//! The merged result is validated before it is handed to the server.

#![deny(unsafe_code)]

pub mod errors;
pub mod loader;
pub mod types;

pub use errors::{Result, SettingsError};
pub use loader::{apply_env_overrides, deep_merge, load_settings, validate};
pub use types::*;

//! Worker configuration for the Kiln build worker.
//!
//! This crate handles:
//! - Built-in defaults for every worker tunable
//! - Parsing the KDL worker configuration file
//! - Duration strings (`90`, `90s`, `15m`, `2h`)
//! - Validation

pub mod duration;
pub mod error;
pub mod worker;

pub use duration::{format_duration, parse_duration};
pub use error::{ConfigError, ConfigResult};
pub use worker::{
    BuildSettings, CallbackSettings, ImageSettings, RegistrySettings, SbomSettings,
    SigningMode, SigningSettings, WorkerConfig, WorkerSettings,
};

//! Shared plumbing for the refly workspace.
//!
//! - `error`: error taxonomy and stable server error codes
//! - `envelope`: the `{success, errCode, errMsg}` response envelope
//! - `config`: KDL/JSON configuration with environment overrides
//! - `telemetry`: tracing subscriber setup
//! - `auth`: bearer token sources and refresh requests
//! - `emitter`: multi-subscriber event broadcast

pub mod auth;
pub mod config;
pub mod emitter;
pub mod envelope;
pub mod error;
pub mod telemetry;

pub use crate::auth::{
    AuthError, SharedToken, SpawnRefresh, StaticToken, TokenRefresher, TokenSource,
};
pub use crate::config::{Config, ConfigError};
pub use crate::emitter::{Emitter, Subscriber};
pub use crate::envelope::BaseResponse;
pub use crate::error::{ErrorCode, SerDeError};

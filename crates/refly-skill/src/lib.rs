//! Streaming skill invocation.
//!
//! [`SkillClient::invoke`] posts an [`InvokeSkillRequest`], checks the
//! response envelope, then decodes the `data: {...}` line stream into
//! [`StreamEvent`]s and hands each one to a [`SkillHandler`].

pub mod client;
pub mod decoder;
pub mod demux;
pub mod error;
pub mod event;
pub mod handler;
pub mod request;

pub use client::{InvokeOutcome, STREAM_INVOKE_PATH, SkillClient, pump};
pub use decoder::LineDecoder;
pub use demux::{EventDemux, StreamDecoder};
pub use error::SkillError;
pub use event::{EventKind, EventMeta, SkillEvent, StreamEvent};
pub use handler::SkillHandler;
pub use request::{InvokeSkillRequest, SkillInput};

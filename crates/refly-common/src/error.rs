//! Error types shared across refly crates.

use miette::Diagnostic;
use serde::{Deserialize, Serialize};

/// Stable error codes understood by the refly server and its clients.
///
/// Codes travel as strings (`"E0001"`) inside [`crate::BaseResponse::err_code`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum ErrorCode {
    Unknown,
    Connection,
    Unauthorized,
    Params,
}

impl ErrorCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Unknown => "E0000",
            Self::Connection => "E0001",
            Self::Unauthorized => "E0002",
            Self::Params => "E0003",
        }
    }

    /// Human-readable fallback when the server sent no `errMsg`.
    pub fn default_message(&self) -> &'static str {
        match self {
            Self::Unknown => "An unknown error has occurred. Please try again later.",
            Self::Connection => "Cannot connect to the Refly server, please try again later.",
            Self::Unauthorized => "Unauthorized, please login",
            Self::Params => "System parameter error. Please try again later.",
        }
    }

    pub fn from_code(code: &str) -> Option<Self> {
        match code {
            "E0000" => Some(Self::Unknown),
            "E0001" => Some(Self::Connection),
            "E0002" => Some(Self::Unauthorized),
            "E0003" => Some(Self::Params),
            _ => None,
        }
    }
}

impl std::fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl TryFrom<String> for ErrorCode {
    type Error = String;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::from_code(&value).ok_or(value)
    }
}

impl From<ErrorCode> for String {
    fn from(code: ErrorCode) -> Self {
        code.as_str().to_owned()
    }
}

/// Serialization/deserialization errors
#[derive(thiserror::Error, Debug, Diagnostic)]
#[non_exhaustive]
pub enum SerDeError {
    #[error(transparent)]
    Json(#[from] serde_json::Error),

    #[error(transparent)]
    Kdl(#[from] kdl::KdlError),
}

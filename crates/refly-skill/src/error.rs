use miette::Diagnostic;
use refly_common::{AuthError, BaseResponse, ErrorCode};
use thiserror::Error;

#[derive(Error, Debug, Diagnostic)]
#[non_exhaustive]
pub enum SkillError {
    #[error("invalid server origin: {0}")]
    #[diagnostic(code(refly::skill::origin))]
    InvalidOrigin(#[from] url::ParseError),

    #[error("request failed: {0}")]
    #[diagnostic(code(refly::skill::connection))]
    Http(#[from] reqwest::Error),

    #[error(transparent)]
    #[diagnostic(code(refly::skill::unauthorized))]
    Auth(#[from] AuthError),

    #[error("server answered {status}: {body}")]
    #[diagnostic(code(refly::skill::status))]
    Status { status: u16, body: String },
}

impl SkillError {
    pub fn code(&self) -> ErrorCode {
        match self {
            SkillError::InvalidOrigin(_) => ErrorCode::Params,
            SkillError::Http(_) => ErrorCode::Connection,
            SkillError::Auth(_) => ErrorCode::Unauthorized,
            SkillError::Status { status: 401, .. } => ErrorCode::Unauthorized,
            SkillError::Status {
                status: 400 | 422, ..
            } => ErrorCode::Params,
            SkillError::Status { .. } => ErrorCode::Unknown,
        }
    }

    /// Failure envelope handed to `on_error`.
    pub fn to_response(&self) -> BaseResponse {
        BaseResponse::failure(self.code(), self.to_string())
    }
}

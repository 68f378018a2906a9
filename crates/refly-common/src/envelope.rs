//! The `{success, errCode, errMsg}` envelope every refly endpoint answers with.

use serde::{Deserialize, Serialize};
use smol_str::SmolStr;

use crate::error::ErrorCode;

/// Base response envelope.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BaseResponse {
    #[serde(default)]
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub err_code: Option<SmolStr>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub err_msg: Option<String>,
}

impl Default for BaseResponse {
    fn default() -> Self {
        Self::ok()
    }
}

impl BaseResponse {
    pub fn ok() -> Self {
        Self {
            success: true,
            err_code: None,
            err_msg: None,
        }
    }

    pub fn failure(code: ErrorCode, msg: impl Into<String>) -> Self {
        Self {
            success: false,
            err_code: Some(SmolStr::new_static(code.as_str())),
            err_msg: Some(msg.into()),
        }
    }

    /// Failure with a code this client does not classify.
    pub fn failure_raw(code: impl Into<SmolStr>, msg: impl Into<String>) -> Self {
        Self {
            success: false,
            err_code: Some(code.into()),
            err_msg: Some(msg.into()),
        }
    }

    /// Failure carrying only a code, message left to the default table.
    pub fn from_code(code: ErrorCode) -> Self {
        Self {
            success: false,
            err_code: Some(SmolStr::new_static(code.as_str())),
            err_msg: None,
        }
    }

    pub fn code(&self) -> Option<ErrorCode> {
        self.err_code.as_deref().and_then(ErrorCode::from_code)
    }

    /// The message to show a user: `errMsg`, else the default for the code.
    pub fn message(&self) -> &str {
        match (&self.err_msg, self.code()) {
            (Some(msg), _) if !msg.is_empty() => msg,
            (_, Some(code)) => code.default_message(),
            _ => ErrorCode::Unknown.default_message(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_envelope_parses_camel_case() {
        let resp: BaseResponse =
            serde_json::from_str(r#"{"success":false,"errCode":"E1","errMsg":"bad request"}"#)
                .unwrap();
        assert_eq!(resp, BaseResponse::failure_raw("E1", "bad request"));
        assert_eq!(resp.message(), "bad request");
    }

    #[test]
    fn test_envelope_missing_fields() {
        let resp: BaseResponse = serde_json::from_str(r#"{"success":true}"#).unwrap();
        assert_eq!(resp, BaseResponse::ok());
    }

    #[test]
    fn test_envelope_without_success_is_failure() {
        let resp: BaseResponse =
            serde_json::from_str(r#"{"errCode":"E0002","errMsg":"expired"}"#).unwrap();
        assert!(!resp.success);
        assert_eq!(resp.code(), Some(ErrorCode::Unauthorized));
        assert_eq!(resp.message(), "expired");
    }

    #[test]
    fn test_message_falls_back_to_code_table() {
        let resp = BaseResponse::from_code(ErrorCode::Connection);
        assert_eq!(resp.message(), ErrorCode::Connection.default_message());
        let json = serde_json::to_string(&resp).unwrap();
        assert_eq!(json, r#"{"success":false,"errCode":"E0001"}"#);
    }
}

//! Uniform success/failure envelope for every tool.
//!
//! Successful calls serialize as `{"success": true, ...payload}`; failures as
//! `{"success": false, "error_kind": "...", "message": "..."}`. No error is
//! allowed to escape a tool as a protocol error.

use schemars::JsonSchema;
use serde::Serialize;
use tracing::warn;

use crate::error::{DbError, DbResult, ErrorKind};

#[derive(Debug, Clone, Serialize, JsonSchema)]
pub struct ErrorPayload {
    pub error_kind: ErrorKind,
    pub message: String,
    /// Keyword that caused a query rejection
    #[serde(skip_serializing_if = "Option::is_none")]
    pub keyword: Option<String>,
}

impl From<&DbError> for ErrorPayload {
    fn from(err: &DbError) -> Self {
        let keyword = match err {
            DbError::QueryValidation { keyword, .. } => keyword.clone(),
            _ => None,
        };
        Self {
            error_kind: err.kind(),
            message: err.user_message(),
            keyword,
        }
    }
}

#[derive(Debug, Clone, Serialize, JsonSchema)]
pub struct OperationResponse<T> {
    pub success: bool,
    #[serde(flatten, skip_serializing_if = "Option::is_none")]
    pub data: Option<T>,
    #[serde(flatten, skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorPayload>,
}

impl<T> OperationResponse<T> {
    pub fn ok(data: T) -> Self {
        Self {
            success: true,
            data: Some(data),
            error: None,
        }
    }

    pub fn failure(err: &DbError) -> Self {
        Self {
            success: false,
            data: None,
            error: Some(ErrorPayload::from(err)),
        }
    }

    /// Wrap the outcome of `operation`, logging failures.
    pub fn from_result(operation: &str, result: DbResult<T>) -> Self {
        match result {
            Ok(data) => Self::ok(data),
            Err(e) => {
                warn!(operation, error_kind = ?e.kind(), error = %e, "Operation failed");
                Self::failure(&e)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::SchemaList;

    #[test]
    fn test_success_flattens_payload() {
        let response = OperationResponse::ok(SchemaList {
            backend: "pg".into(),
            schemas: vec!["public".into()],
            count: 1,
        });
        let json = serde_json::to_value(&response).unwrap();
        assert_eq!(json["success"], true);
        assert_eq!(json["schemas"][0], "public");
        assert!(json.get("error_kind").is_none());
    }

    #[test]
    fn test_failure_carries_kind_and_keyword() {
        let err = DbError::rejected_keyword("DELETE", "DELETE rejected");
        let response = OperationResponse::<SchemaList>::from_result("execute_query", Err(err));
        let json = serde_json::to_value(&response).unwrap();
        assert_eq!(json["success"], false);
        assert_eq!(json["error_kind"], "query_validation_error");
        assert_eq!(json["keyword"], "DELETE");
        assert!(json.get("schemas").is_none());
    }
}

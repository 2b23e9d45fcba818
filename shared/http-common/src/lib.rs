//! Shared HTTP utilities for the member query workspace.
//!
//! Provides structured error bodies plus the paging and sort parameter
//! parsing used by api-server. Nothing here knows about the domain types.

// ============================================================================
// JSON Response Helpers (framework-agnostic)
// ============================================================================

/// Create a structured error JSON with a default message based on the code.
///
/// Returns: `{"error": {"code": "<code>", "message": "<default message>"}}`
pub fn json_err(code: &str) -> serde_json::Value {
    let message = match code {
        "not_found" => "Resource not found",
        "bad_request" | "invalid_request" => "Bad request",
        "conflict" => "Resource already exists",
        "constraint_violation" => "Constraint violation",
        "not_unique" => "More than one result",
        "error" | "internal" => "Internal server error",
        _ => code, // Fallback to code as message for unknown codes
    };
    serde_json::json!({"error": {"code": code, "message": message}})
}

/// Create a structured error JSON with a custom message.
///
/// Returns: `{"error": {"code": "<code>", "message": "<message>"}}`
pub fn json_error_with_message(code: &str, message: &str) -> serde_json::Value {
    serde_json::json!({"error": {"code": code, "message": message}})
}

// ============================================================================
// Paging
// ============================================================================

/// Resolve a requested page size against the configured maximum.
///
/// `None` yields `default`; a request outside `1..=max` is an error.
pub fn validate_limit(requested: Option<usize>, default: usize, max: usize) -> Result<usize, String> {
    match requested {
        None => Ok(default.min(max)),
        Some(n) if (1..=max).contains(&n) => Ok(n),
        Some(_) => Err(format!("limit must be between 1 and {max}")),
    }
}

// ============================================================================
// Sort Parsing
// ============================================================================

/// Where nulls go in a sort key.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum NullsPlacement {
    /// Whatever the store does by default.
    Default,
    First,
    Last,
}

/// One `field:direction[:nulls]` entry of a `sort` query parameter.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SortParam {
    pub field: String,
    pub descending: bool,
    pub nulls: NullsPlacement,
}

/// Parse a comma separated sort parameter such as
/// `age:desc,username:asc:nulls_last`.
///
/// The direction defaults to ascending. Field names are not checked here.
pub fn parse_sort(raw: &str) -> Result<Vec<SortParam>, String> {
    let mut out = Vec::new();
    for entry in raw.split(',').map(str::trim).filter(|s| !s.is_empty()) {
        let mut parts = entry.split(':');
        let field = parts.next().unwrap_or_default().trim();
        if field.is_empty() {
            return Err(format!("empty sort field in '{entry}'"));
        }
        let descending = match parts.next().map(str::trim) {
            None | Some("asc") => false,
            Some("desc") => true,
            Some(other) => return Err(format!("unknown sort direction '{other}'")),
        };
        let nulls = match parts.next().map(str::trim) {
            None => NullsPlacement::Default,
            Some("nulls_first") => NullsPlacement::First,
            Some("nulls_last") => NullsPlacement::Last,
            Some(other) => return Err(format!("unknown null ordering '{other}'")),
        };
        if parts.next().is_some() {
            return Err(format!("too many sort segments in '{entry}'"));
        }
        out.push(SortParam {
            field: field.to_string(),
            descending,
            nulls,
        });
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_json_err() {
        let err = json_err("not_found");
        assert_eq!(err, serde_json::json!({"error": {"code": "not_found", "message": "Resource not found"}}));

        // Unknown code falls back to code as message
        let err = json_err("custom_error");
        assert_eq!(err, serde_json::json!({"error": {"code": "custom_error", "message": "custom_error"}}));
    }

    #[test]
    fn test_json_error_with_message() {
        let err = json_error_with_message("bad_request", "Invalid input");
        assert_eq!(
            err,
            serde_json::json!({"error": {"code": "bad_request", "message": "Invalid input"}})
        );
    }

    #[test]
    fn test_validate_limit() {
        assert_eq!(validate_limit(None, 100, 500), Ok(100));
        assert_eq!(validate_limit(None, 100, 20), Ok(20));
        assert_eq!(validate_limit(Some(1), 100, 500), Ok(1));
        assert_eq!(validate_limit(Some(500), 100, 500), Ok(500));
        assert!(validate_limit(Some(0), 100, 500).is_err());
        assert!(validate_limit(Some(501), 100, 500).is_err());
    }

    #[test]
    fn test_parse_sort() {
        let keys = parse_sort("age:desc, username:asc:nulls_last,id").unwrap();
        assert_eq!(
            keys,
            vec![
                SortParam { field: "age".into(), descending: true, nulls: NullsPlacement::Default },
                SortParam { field: "username".into(), descending: false, nulls: NullsPlacement::Last },
                SortParam { field: "id".into(), descending: false, nulls: NullsPlacement::Default },
            ]
        );
        assert!(parse_sort("").unwrap().is_empty());
    }

    #[test]
    fn test_parse_sort_rejects_garbage() {
        assert!(parse_sort("age:sideways").is_err());
        assert!(parse_sort("age:asc:nulls_middle").is_err());
        assert!(parse_sort(":desc").is_err());
        assert!(parse_sort("age:asc:nulls_first:extra").is_err());
    }
}

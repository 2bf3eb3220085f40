// Enqueue request validation

use super::EnqueueRequest;
use crate::domain::queue::{validate_dedup_key, validate_queue_name};
use crate::domain::DomainError;
use crate::error::{AppError, Result};

/// Maximum payload nesting depth
pub const MAX_PAYLOAD_DEPTH: usize = 32;

/// Maximum serialized payload size (10MB)
pub const MAX_PAYLOAD_BYTES: usize = 10 * 1024 * 1024;

/// Upper bound for a job's retry budget
pub const MAX_RETRIES_LIMIT: i32 = 25;

fn into_validation(err: DomainError) -> AppError {
    match err {
        DomainError::ValidationError(msg) => AppError::Validation(msg),
        other => AppError::Domain(other),
    }
}

/// Reject malformed requests before anything is persisted
pub fn validate_request(req: &EnqueueRequest) -> Result<()> {
    validate_queue_name(&req.queue).map_err(into_validation)?;
    validate_dedup_key(&req.key).map_err(into_validation)?;

    if req.asset_id.trim().is_empty() {
        return Err(AppError::Validation("asset id is empty".to_string()));
    }
    if req.user_id.trim().is_empty() {
        return Err(AppError::Validation("user id is empty".to_string()));
    }

    if let Some(max_retries) = req.max_retries {
        if !(0..=MAX_RETRIES_LIMIT).contains(&max_retries) {
            return Err(AppError::Validation(format!(
                "max_retries {} out of range (0-{})",
                max_retries, MAX_RETRIES_LIMIT
            )));
        }
    }

    let depth = req.payload.depth();
    if depth > MAX_PAYLOAD_DEPTH {
        return Err(AppError::Validation(format!(
            "payload too deeply nested ({} > {})",
            depth, MAX_PAYLOAD_DEPTH
        )));
    }

    let size = serde_json::to_vec(req.payload.as_value())?.len();
    if size > MAX_PAYLOAD_BYTES {
        return Err(AppError::Validation(format!(
            "payload too large ({} bytes > {})",
            size, MAX_PAYLOAD_BYTES
        )));
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn request() -> EnqueueRequest {
        EnqueueRequest::new("note-processing", "notes:abc", "abc", "user-1", json!({"noteId": "abc"}))
    }

    #[test]
    fn test_valid_request() {
        assert!(validate_request(&request()).is_ok());
    }

    #[test]
    fn test_queue_name_rules() {
        let mut req = request();
        req.queue = String::new();
        let err = validate_request(&req).unwrap_err();
        assert!(matches!(err, AppError::Validation(_)));
        assert!(err.to_string().contains("empty"));

        req.queue = "a".repeat(65);
        assert!(validate_request(&req).unwrap_err().to_string().contains("too long"));

        req.queue = "invalid@queue!".to_string();
        assert!(validate_request(&req)
            .unwrap_err()
            .to_string()
            .contains("alphanumeric"));
    }

    #[test]
    fn test_max_retries_out_of_range() {
        let req = request().with_max_retries(26);
        assert!(validate_request(&req)
            .unwrap_err()
            .to_string()
            .contains("out of range"));
        assert!(validate_request(&request().with_max_retries(-1)).is_err());
        assert!(validate_request(&request().with_max_retries(0)).is_ok());
    }

    #[test]
    fn test_payload_depth() {
        let mut deep = json!({"level": 0});
        for i in 1..=35 {
            deep = json!({"level": i, "nested": deep});
        }
        let mut req = request();
        req.payload = crate::domain::JobPayload::new(deep);

        assert!(validate_request(&req)
            .unwrap_err()
            .to_string()
            .contains("deeply nested"));
    }

    #[test]
    fn test_missing_owner() {
        let mut req = request();
        req.user_id = " ".to_string();
        assert!(matches!(validate_request(&req), Err(AppError::Validation(_))));
    }
}

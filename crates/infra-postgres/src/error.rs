// sqlx::Error -> AppError

use cairn_core::error::AppError;

/// Convert sqlx::Error to AppError with structured information
pub(crate) fn map_sqlx_error(err: sqlx::Error) -> AppError {
    match &err {
        sqlx::Error::Database(db_err) => {
            let Some(code) = db_err.code() else {
                return AppError::Database(format!("Database error: {}", db_err.message()));
            };

            // SQLSTATE: https://www.postgresql.org/docs/current/errcodes-appendix.html
            match code.as_ref() {
                "23505" => AppError::Conflict(format!(
                    "Unique constraint violation: {}",
                    db_err.message()
                )),
                "40001" | "40P01" => AppError::Database(format!(
                    "Serialization failure ({}): {}",
                    code,
                    db_err.message()
                )),
                code => AppError::Database(format!(
                    "Database error [{}]: {}",
                    code,
                    db_err.message()
                )),
            }
        }
        sqlx::Error::RowNotFound => AppError::NotFound("Row not found".to_string()),
        sqlx::Error::ColumnNotFound(col) => {
            AppError::Database(format!("Column not found: {}", col))
        }
        // Connection, pool, protocol errors
        _ => AppError::Database(err.to_string()),
    }
}

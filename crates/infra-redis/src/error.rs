// redis::RedisError -> AppError

use cairn_core::error::AppError;

pub(crate) fn map_redis_error(err: redis::RedisError) -> AppError {
    if err.is_timeout() || err.is_connection_dropped() || err.is_io_error() {
        return AppError::Broker(format!("Connection error: {}", err));
    }
    match err.kind() {
        redis::ErrorKind::ResponseError | redis::ErrorKind::ExtensionError => {
            AppError::Broker(format!("Script error: {}", err))
        }
        redis::ErrorKind::TypeError => {
            AppError::Internal(format!("Unexpected broker reply: {}", err))
        }
        _ => AppError::Broker(err.to_string()),
    }
}

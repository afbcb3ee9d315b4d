use thiserror::Error;

/// Top-level error type for the Tradewind runtime.
///
/// Component-local failures (bus, broker, provider, store) live in their own
/// crates; what folds in here is shared between layers.
#[derive(Error, Debug)]
pub enum TwError {
    #[error("Order error: {0}")]
    Order(#[from] OrderError),

    #[error("Portfolio error: {0}")]
    Portfolio(#[from] PortfolioError),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

/// Order-related errors.
#[derive(Error, Debug)]
pub enum OrderError {
    #[error("Order not found: {order_id}")]
    NotFound { order_id: String },

    #[error("Duplicate signal: {signal_id}")]
    DuplicateSignal { signal_id: String },

    #[error("Rate limit exceeded: {limit} orders per {window_secs} s")]
    RateLimited { limit: u32, window_secs: u64 },

    #[error("Daily order cap reached: {cap}")]
    DailyCapReached { cap: u32 },

    #[error("Emergency stop active")]
    EmergencyStop,

    #[error("Invalid status transition: {from} -> {to}")]
    InvalidTransition { from: String, to: String },
}

/// Portfolio-related errors.
#[derive(Error, Debug)]
pub enum PortfolioError {
    #[error("Portfolio state inconsistency: {message}")]
    StateInconsistency { message: String },

    #[error("Persistence failed after {attempts} attempts: {message}")]
    PersistenceExhausted { attempts: u32, message: String },
}

/// Result alias for runtime operations.
pub type TwResult<T> = Result<T, TwError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_display() {
        let e = OrderError::RateLimited {
            limit: 60,
            window_secs: 60,
        };
        assert!(e.to_string().contains("60 orders"));
    }

    #[test]
    fn order_error_folds_into_top_level() {
        let e: TwError = OrderError::EmergencyStop.into();
        assert!(matches!(e, TwError::Order(_)));
    }

    #[test]
    fn portfolio_error_folds_into_top_level() {
        let e: TwError = PortfolioError::StateInconsistency {
            message: "equity drift".into(),
        }
        .into();
        assert!(matches!(e, TwError::Portfolio(_)));
    }
}

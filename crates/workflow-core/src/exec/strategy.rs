//! Server-side retry/backoff decisions for a step's configured error
//! handling strategy (§4.7). Terminal error kinds always fail regardless of
//! strategy; everything else is routed through `fail` / `continue` /
//! `retry` / `fallback` as declared on the step.

use std::time::Duration;

use crate::config::DefaultsConfig;
use crate::error::EngineError;
use crate::loader::{ErrorHandling, ErrorStrategy};
use crate::value::Value;

pub enum Decision {
    Retry(Duration),
    Fallback(Value),
    ContinueEmpty,
    Fail,
}

/// What a pending client-delegated step should do once `complete_client_step`
/// resolves its reported result (§4.4, §6).
pub enum StepOutcome {
    Advance,
    Retry(Duration),
    Failed(EngineError),
}

pub fn decide(err: &EngineError, handling: Option<&ErrorHandling>, defaults: &DefaultsConfig, attempt: u32) -> Decision {
    if err.kind().is_terminal() || matches!(err, EngineError::Cancelled) {
        return Decision::Fail;
    }
    let Some(handling) = handling else {
        return Decision::Fail;
    };
    match handling.strategy {
        ErrorStrategy::Fail => Decision::Fail,
        ErrorStrategy::Continue => Decision::ContinueEmpty,
        ErrorStrategy::Fallback => {
            let value = handling.fallback_value.clone().map(Value::from_json).unwrap_or_else(Value::null);
            Decision::Fallback(value)
        }
        ErrorStrategy::Retry => {
            if attempt >= handling.max_retries {
                // A retry budget paired with a fallback_value (S6: "retry then
                // fallback") yields that value once the budget is exhausted,
                // rather than failing the step outright.
                match handling.fallback_value.clone() {
                    Some(value) => Decision::Fallback(Value::from_json(value)),
                    None => Decision::Fail,
                }
            } else {
                Decision::Retry(backoff_delay(handling, defaults, attempt))
            }
        }
    }
}

fn backoff_delay(handling: &ErrorHandling, defaults: &DefaultsConfig, attempt: u32) -> Duration {
    let base = handling.backoff.as_ref().and_then(|b| b.base_ms).unwrap_or(defaults.retry_backoff_base_ms);
    let multiplier = handling.backoff.as_ref().and_then(|b| b.multiplier).unwrap_or(defaults.retry_backoff_multiplier);
    let cap = handling.backoff.as_ref().and_then(|b| b.cap_ms).unwrap_or(defaults.retry_backoff_cap_ms);
    let ms = (base as f64) * multiplier.powi(attempt as i32);
    Duration::from_millis(ms.min(cap as f64).max(0.0) as u64)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::loader::BackoffOverride;

    fn defaults() -> DefaultsConfig {
        DefaultsConfig::default()
    }

    #[test]
    fn terminal_errors_always_fail() {
        let handling = ErrorHandling { strategy: ErrorStrategy::Retry, max_retries: 5, backoff: None, fallback_value: None, error_state_path: None };
        let err = EngineError::Internal("bug".to_string());
        assert!(matches!(decide(&err, Some(&handling), &defaults(), 0), Decision::Fail));
    }

    #[test]
    fn retry_caps_at_max_retries() {
        let handling = ErrorHandling { strategy: ErrorStrategy::Retry, max_retries: 2, backoff: None, fallback_value: None, error_state_path: None };
        let err = EngineError::Tool("boom".to_string());
        assert!(matches!(decide(&err, Some(&handling), &defaults(), 1), Decision::Retry(_)));
        assert!(matches!(decide(&err, Some(&handling), &defaults(), 2), Decision::Fail));
    }

    #[test]
    fn backoff_respects_cap() {
        let handling = ErrorHandling {
            strategy: ErrorStrategy::Retry,
            max_retries: 10,
            backoff: Some(BackoffOverride { base_ms: Some(1000), multiplier: Some(10.0), cap_ms: Some(5000) }),
            fallback_value: None,
            error_state_path: None,
        };
        match decide(&EngineError::Tool("x".to_string()), Some(&handling), &defaults(), 5) {
            Decision::Retry(d) => assert_eq!(d, Duration::from_millis(5000)),
            _ => panic!("expected a retry decision"),
        }
    }

    #[test]
    fn no_handling_fails_immediately() {
        let err = EngineError::Tool("boom".to_string());
        assert!(matches!(decide(&err, None, &defaults(), 0), Decision::Fail));
    }
}

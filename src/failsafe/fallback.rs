//! Fallback behavior for rejected or exhausted calls

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::BreakerState;
use crate::error::CallError;

/// Configured fallback behavior of a breaker
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FallbackStrategy {
    /// Serve the last successful response, if there is one
    Cached,
    /// Serve the breaker's degraded placeholder
    Graceful,
    /// Surface the original error
    #[default]
    Fail,
}

impl FallbackStrategy {
    /// Config/wire name
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Cached => "cached",
            Self::Graceful => "graceful",
            Self::Fail => "fail",
        }
    }
}

/// Everything a fallback gets to work with
#[derive(Debug)]
pub struct FallbackContext<'a, E> {
    /// Breaker name
    pub breaker: &'a str,
    /// Breaker state when the fallback was invoked
    pub state: BreakerState,
    /// Why there is no result: rejection, operation error or timeout
    pub cause: CallError<E>,
    /// Last successful response recorded by this breaker
    pub cached: Option<Value>,
    /// The breaker's degraded placeholder
    pub placeholder: &'a Value,
}

/// Produces a result in place of the protected operation
///
/// Implemented by [`FallbackStrategy`] for the configured behaviors; wrap a
/// closure with [`fallback_fn`] for a one-off call-site fallback.
pub trait Fallback<T, E>: Send + Sync {
    /// Recover from `ctx.cause`, or return an error (usually the cause itself)
    fn recover(&self, ctx: FallbackContext<'_, E>) -> Result<T, CallError<E>>;
}

impl<T, E> Fallback<T, E> for FallbackStrategy
where
    T: DeserializeOwned,
{
    fn recover(&self, ctx: FallbackContext<'_, E>) -> Result<T, CallError<E>> {
        match self {
            Self::Cached => match ctx.cached {
                Some(value) => serde_json::from_value(value).map_err(|e| CallError::Degraded {
                    breaker: ctx.breaker.to_string(),
                    reason: format!("cached response does not match the call's result type: {e}"),
                }),
                None => {
                    tracing::debug!(breaker = %ctx.breaker, "No cached response, propagating error");
                    Err(ctx.cause)
                }
            },
            Self::Graceful => {
                serde_json::from_value(ctx.placeholder.clone()).map_err(|e| CallError::Degraded {
                    breaker: ctx.breaker.to_string(),
                    reason: format!("degraded response does not match the call's result type: {e}"),
                })
            }
            Self::Fail => Err(ctx.cause),
        }
    }
}

/// Closure-backed fallback, see [`fallback_fn`]
pub struct FnFallback<F>(F);

/// Wrap a closure as a call-site fallback
///
/// ```
/// use circuit_breakers::failsafe::{FallbackContext, fallback_fn};
/// use circuit_breakers::CallError;
///
/// let fallback = fallback_fn(|ctx: FallbackContext<'_, std::io::Error>| {
///     Ok::<_, CallError<std::io::Error>>(format!("{} unavailable", ctx.breaker))
/// });
/// # let _ = fallback;
/// ```
pub fn fallback_fn<T, E, F>(f: F) -> FnFallback<F>
where
    F: Fn(FallbackContext<'_, E>) -> Result<T, CallError<E>> + Send + Sync,
{
    FnFallback(f)
}

impl<T, E, F> Fallback<T, E> for FnFallback<F>
where
    F: Fn(FallbackContext<'_, E>) -> Result<T, CallError<E>> + Send + Sync,
{
    fn recover(&self, ctx: FallbackContext<'_, E>) -> Result<T, CallError<E>> {
        (self.0)(ctx)
    }
}

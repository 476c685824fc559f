//! # Local Handlers
//!
//! Local method handlers: the callee side of a dispatcher.

use std::future::Future;

use crate::error::ApplicationError;
use crate::transport::Address;

/// Exception payload a dispatcher sends when it has no handler for the called method.
///
/// It travels as an ordinary exception payload, so a handler that raises an
/// [`ApplicationError`] whose message is exactly these bytes is reported to
/// its caller as [`Error::MethodNotServed`](crate::Error::MethodNotServed).
pub(crate) const UNKNOWN_METHOD: &[u8] = b"\0meshcall:unknown-method\0";

pub(crate) fn is_unknown_method(payload: &[u8]) -> bool {
    payload == UNKNOWN_METHOD
}

/// Serves one method. The payload is whatever the caller's codec produced.
#[async_trait::async_trait]
pub trait Handler: Send + Sync + 'static {
    async fn handle(&self, from: &Address, payload: &[u8]) -> Result<Vec<u8>, ApplicationError>;
}

/// Adapts an async closure into a [`Handler`].
pub struct HandlerFn<F> {
    f: F,
}

pub fn handler_fn<F, Fut>(f: F) -> HandlerFn<F>
where
    F: Fn(Address, Vec<u8>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Vec<u8>, ApplicationError>> + Send + 'static,
{
    HandlerFn { f }
}

#[async_trait::async_trait]
impl<F, Fut> Handler for HandlerFn<F>
where
    F: Fn(Address, Vec<u8>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Vec<u8>, ApplicationError>> + Send + 'static,
{
    async fn handle(&self, from: &Address, payload: &[u8]) -> Result<Vec<u8>, ApplicationError> {
        (self.f)(from.clone(), payload.to_vec()).await
    }
}

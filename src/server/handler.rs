//! HTTP request handlers.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use crate::server::context::HttpContext;
use crate::server::error::Error;

/// Type alias for a boxed future returned by a handler.
pub type HandlerFuture = Pin<Box<dyn Future<Output = Result<(), Error>> + Send>>;

/// Something that can answer a request.
///
/// The handler owns the [`HttpContext`] and writes its answer through
/// `ctx.response`. Any async closure `Fn(HttpContext) -> impl Future<Output =
/// Result<(), Error>>` is a handler.
pub trait Handler: Send + Sync + 'static {
    fn call(&self, ctx: HttpContext) -> HandlerFuture;
}

impl<F, Fut> Handler for F
where
    F: Fn(HttpContext) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<(), Error>> + Send + 'static,
{
    fn call(&self, ctx: HttpContext) -> HandlerFuture {
        Box::pin(self(ctx))
    }
}

/// Type alias for a shared handler.
pub type HandlerFn = Arc<dyn Handler>;

use std::future::Future;

use async_trait::async_trait;

use crate::event::{BaseEvent, EventContext};
use crate::utils::BoxError;

pub type HandlerResult = std::result::Result<(), BoxError>;

/// Processes one delivery. Settle it through `ctx`; returning an error
/// without settling dead-letters the message.
#[async_trait]
pub trait EventHandler: Send + Sync + 'static {
    async fn handle(&self, event: BaseEvent, ctx: EventContext) -> HandlerResult;
}

#[async_trait]
impl<F, Fut> EventHandler for F
where
    F: Fn(BaseEvent, EventContext) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = HandlerResult> + Send + 'static,
{
    async fn handle(&self, event: BaseEvent, ctx: EventContext) -> HandlerResult {
        (self)(event, ctx).await
    }
}

/// Pins a closure's argument and result types so it can be written without
/// annotations: `handler_fn(|event, ctx| async move { ctx.ack().await?; Ok(()) })`.
pub fn handler_fn<F, Fut>(f: F) -> F
where
    F: Fn(BaseEvent, EventContext) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = HandlerResult> + Send + 'static,
{
    f
}

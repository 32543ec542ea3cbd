use std::panic::AssertUnwindSafe;

use async_trait::async_trait;
use futures_util::FutureExt;
use idempotency::IdempotencyGuard;
use messaging::{HandlerError, Message, MessageHandler};
use tracing::{debug, warn};

use crate::events::{DecodedEvent, SagaEvent};

/// Decodes a saga event for `consumer`. Unknown event types are logged and
/// yield `None`; malformed payloads are handler errors.
pub(crate) fn decode_event(
    message: &Message,
    consumer: &str,
) -> Result<Option<SagaEvent>, HandlerError> {
    match SagaEvent::from_message(message)? {
        DecodedEvent::Known(event) => Ok(Some(event)),
        DecodedEvent::Unknown(event_type) => {
            warn!(
                consumer,
                %event_type,
                message_id = %message.message_id,
                "unknown event type, acknowledging without processing"
            );
            Ok(None)
        }
    }
}

/// Skips messages this consumer has already processed.
///
/// The claim is scoped to the consumer name because one published message
/// is copied to every bound queue under the same message id. A failed or
/// panicking handler drops its claim so the redelivery runs again.
pub struct IdempotentHandler<H> {
    consumer: String,
    guard: IdempotencyGuard,
    inner: H,
}

impl<H> IdempotentHandler<H> {
    pub fn new(consumer: impl Into<String>, guard: IdempotencyGuard, inner: H) -> Self {
        Self {
            consumer: consumer.into(),
            guard,
            inner,
        }
    }
}

#[async_trait]
impl<H: MessageHandler> MessageHandler for IdempotentHandler<H> {
    async fn handle(&self, message: &Message) -> Result<(), HandlerError> {
        let claim = format!("{}:{}", self.consumer, message.message_id);
        if !self.guard.claim_message(&claim).await {
            debug!(
                consumer = %self.consumer,
                message_id = %message.message_id,
                "duplicate delivery acknowledged without processing"
            );
            return Ok(());
        }

        let result = AssertUnwindSafe(self.inner.handle(message))
            .catch_unwind()
            .await
            .unwrap_or_else(|_| Err(HandlerError::new("handler panicked")));
        if result.is_err() {
            self.guard.release_message(&claim).await;
        }
        result
    }
}

// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Message Handling
//!
//! This module wraps every delivery in a small state machine guaranteeing
//! exactly one terminal action per message: acknowledge, retry (requeue),
//! discard, or delayed retry through the ladder. Only the first terminal
//! action takes effect; later calls silently no-op. This deliberately masks
//! caller bugs instead of raising on them.
//!
//! A handler that returns an error without having taken any terminal action
//! has its message discarded without requeue: an uncaught handler failure is
//! treated as permanent, and redelivering it is unlikely to succeed.

use crate::{
    errors::RouterError,
    otel,
    publisher::{publish_confirmed, SendOptions},
    retry::{delayed_retry_routing_key, RETRY_ENTRY},
    topology::DestinationKind,
};
use async_trait::async_trait;
use lapin::{
    message::Delivery,
    options::{BasicAckOptions, BasicRejectOptions},
    protocol::basic::AMQPProperties,
    types::{AMQPValue, ShortString},
    Channel,
};
use opentelemetry::{
    global::BoxedTracer,
    trace::{Span, Status},
    Context,
};
use std::{
    borrow::Cow,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
};
use tracing::{debug, error};

/// Header carrying the number of delayed retries a message has been through.
pub const RETRY_COUNT_HEADER: &str = "retryCount";

/// The result of handling one delivery.
pub type HandlerResult = Result<(), Box<dyn std::error::Error + Send + Sync>>;

/// Processes deliveries for one destination of a consumer group.
///
/// The handler decides the fate of each message through the
/// [`MessageContext`] it receives; returning `Ok` takes no action by itself.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait MessageHandler: Send + Sync {
    async fn handle(&self, ctx: &Context, message: MessageContext) -> HandlerResult;
}

/// One-way latch for the terminal action. First caller wins.
struct TerminalState(AtomicBool);

impl TerminalState {
    fn new() -> TerminalState {
        TerminalState(AtomicBool::new(false))
    }

    /// Claims the terminal action. Returns false if already taken.
    fn claim(&self) -> bool {
        !self.0.swap(true, Ordering::SeqCst)
    }

    /// Reverts a claim whose action could not be completed.
    fn release(&self) {
        self.0.store(false, Ordering::SeqCst);
    }

    fn is_taken(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

struct MessageInner {
    delivery: Delivery,
    state: TerminalState,
    group: String,
    destination: String,
    kind: DestinationKind,
    queue: String,
    retry_channel: Option<Channel>,
}

/// A delivered message and its terminal actions.
#[derive(Clone)]
pub struct MessageContext {
    inner: Arc<MessageInner>,
}

impl MessageContext {
    pub(crate) fn new(
        delivery: Delivery,
        group: String,
        destination: String,
        kind: DestinationKind,
        queue: String,
        retry_channel: Option<Channel>,
    ) -> MessageContext {
        MessageContext {
            inner: Arc::new(MessageInner {
                delivery,
                state: TerminalState::new(),
                group,
                destination,
                kind,
                queue,
                retry_channel,
            }),
        }
    }

    /// The raw message body.
    pub fn payload(&self) -> &[u8] {
        &self.inner.delivery.data
    }

    /// The message body as text, lossily converted.
    pub fn payload_str(&self) -> Cow<'_, str> {
        String::from_utf8_lossy(&self.inner.delivery.data)
    }

    /// Whether the broker has delivered this message before.
    pub fn redelivered(&self) -> bool {
        self.inner.delivery.redelivered
    }

    pub fn properties(&self) -> &AMQPProperties {
        &self.inner.delivery.properties
    }

    pub fn group(&self) -> &str {
        &self.inner.group
    }

    pub fn destination(&self) -> &str {
        &self.inner.destination
    }

    pub fn kind(&self) -> DestinationKind {
        self.inner.kind
    }

    /// The queue this message was consumed from.
    pub fn queue(&self) -> &str {
        &self.inner.queue
    }

    /// Acknowledges the message.
    pub async fn acknowledge(&self) -> Result<(), RouterError> {
        if !self.inner.state.claim() {
            return Ok(());
        }

        match self
            .inner
            .delivery
            .acker
            .ack(BasicAckOptions { multiple: false })
            .await
        {
            Err(err) => {
                error!(error = err.to_string(), "error to ack the message");
                Err(RouterError::AckMessageError)
            }
            _ => Ok(()),
        }
    }

    /// Rejects the message, requeueing it for immediate redelivery.
    pub async fn retry(&self) -> Result<(), RouterError> {
        self.reject(true).await
    }

    /// Rejects the message without requeue.
    ///
    /// With dead-lettering configured the broker redirects the message to
    /// the dead-letter command's queue; otherwise it is dropped.
    pub async fn discard(&self) -> Result<(), RouterError> {
        self.reject(false).await
    }

    async fn reject(&self, requeue: bool) -> Result<(), RouterError> {
        if !self.inner.state.claim() {
            return Ok(());
        }

        match self
            .inner
            .delivery
            .acker
            .reject(BasicRejectOptions { requeue })
            .await
        {
            Err(err) => {
                error!(error = err.to_string(), "error to reject the message");
                Err(RouterError::RejectMessageError)
            }
            _ => Ok(()),
        }
    }

    /// Republishes the message through the retry ladder and acknowledges
    /// the original once the republish is confirmed.
    ///
    /// `wait` is the requested delay in seconds, clamped to
    /// [`crate::retry::MAX_DELAY`]. The `retryCount` header is incremented
    /// by one; caller-supplied headers override generated ones. On republish
    /// failure no terminal action has been taken and the original stays
    /// unacknowledged, so the broker redelivers per its own policy.
    pub async fn delayed_retry(
        &self,
        wait: u64,
        mut options: SendOptions,
    ) -> Result<(), RouterError> {
        let Some(channel) = &self.inner.retry_channel else {
            return Err(RouterError::DelayedRetryDisabled);
        };

        if !self.inner.state.claim() {
            return Ok(());
        }

        let routing_key = delayed_retry_routing_key(wait, &self.inner.queue);
        stamp_retry_count(&mut options, retry_count(self.properties()));

        if let Err(err) = publish_confirmed(
            channel,
            RETRY_ENTRY,
            &routing_key,
            &self.inner.delivery.data,
            &options,
        )
        .await
        {
            self.inner.state.release();
            return Err(err);
        }

        match self
            .inner
            .delivery
            .acker
            .ack(BasicAckOptions { multiple: false })
            .await
        {
            Err(err) => {
                error!(
                    error = err.to_string(),
                    "error to ack the message after delayed retry republish"
                );
                Err(RouterError::AckMessageError)
            }
            _ => Ok(()),
        }
    }

    pub(crate) fn is_handled(&self) -> bool {
        self.inner.state.is_taken()
    }
}

/// Runs one delivery through its handler with an open consumer span, and
/// discards the message if the handler fails without settling it.
pub(crate) async fn handle_delivery(
    tracer: &BoxedTracer,
    handler: &Arc<dyn MessageHandler>,
    ctx: MessageContext,
) {
    let (otel_ctx, mut span) = otel::consumer_span(ctx.properties(), tracer, ctx.queue());

    debug!(
        "received: {} - queue: {}",
        ctx.destination(),
        ctx.queue()
    );

    match handler.handle(&otel_ctx, ctx.clone()).await {
        Ok(()) => {
            span.set_status(Status::Ok);
        }
        Err(err) => {
            span.record_error(err.as_ref());
            span.set_status(Status::Error {
                description: Cow::from("handler failed"),
            });

            error!(
                group = ctx.group(),
                destination = ctx.destination(),
                error = err.to_string(),
                "handler rejected; the message it was processing is discarded as the handler \
                 was unable to process it correctly, and redelivery is unlikely to succeed"
            );

            if !ctx.is_handled() {
                if let Err(reject_err) = ctx.discard().await {
                    error!(
                        error = reject_err.to_string(),
                        "error discarding the failed message"
                    );
                }
            }
        }
    }
}

/// Reads the delayed-retry count a delivery carries.
pub(crate) fn retry_count(properties: &AMQPProperties) -> i64 {
    let headers = match properties.headers() {
        Some(headers) => headers.clone(),
        None => return 0,
    };

    match headers.inner().get(RETRY_COUNT_HEADER) {
        Some(AMQPValue::LongLongInt(count)) => *count,
        Some(AMQPValue::LongInt(count)) => i64::from(*count),
        Some(AMQPValue::ShortInt(count)) => i64::from(*count),
        Some(AMQPValue::ShortShortInt(count)) => i64::from(*count),
        Some(AMQPValue::LongUInt(count)) => i64::from(*count),
        Some(AMQPValue::ShortUInt(count)) => i64::from(*count),
        Some(AMQPValue::ShortShortUInt(count)) => i64::from(*count),
        _ => 0,
    }
}

/// Stamps the incremented retry count unless the caller already set one.
fn stamp_retry_count(options: &mut SendOptions, current: i64) {
    options
        .headers
        .entry(ShortString::from(RETRY_COUNT_HEADER))
        .or_insert(AMQPValue::LongLongInt(current + 1));
}

#[cfg(test)]
mod tests {
    use super::*;
    use lapin::types::FieldTable;
    use std::collections::BTreeMap;

    #[test]
    fn first_terminal_claim_wins() {
        let state = TerminalState::new();
        assert!(!state.is_taken());
        assert!(state.claim());
        assert!(state.is_taken());
        assert!(!state.claim());
        assert!(!state.claim());
    }

    #[test]
    fn released_claim_can_be_retaken() {
        // A failed delayed-retry republish reverts the claim so another
        // terminal action can still settle the message.
        let state = TerminalState::new();
        assert!(state.claim());
        state.release();
        assert!(!state.is_taken());
        assert!(state.claim());
    }

    fn properties_with_retry_count(value: AMQPValue) -> AMQPProperties {
        let mut headers = BTreeMap::new();
        headers.insert(ShortString::from(RETRY_COUNT_HEADER), value);
        AMQPProperties::default().with_headers(FieldTable::from(headers))
    }

    #[test]
    fn retry_count_defaults_to_zero() {
        assert_eq!(retry_count(&AMQPProperties::default()), 0);
        assert_eq!(
            retry_count(&AMQPProperties::default().with_headers(FieldTable::default())),
            0
        );
        assert_eq!(
            retry_count(&properties_with_retry_count(AMQPValue::LongString(
                "three".into()
            ))),
            0
        );
    }

    #[test]
    fn retry_count_reads_integer_headers() {
        assert_eq!(
            retry_count(&properties_with_retry_count(AMQPValue::LongLongInt(3))),
            3
        );
        assert_eq!(
            retry_count(&properties_with_retry_count(AMQPValue::LongInt(7))),
            7
        );
    }

    #[test]
    fn retry_count_is_incremented_once_per_delayed_retry() {
        let mut options = SendOptions::default();
        stamp_retry_count(&mut options, 2);
        assert_eq!(
            options.headers.get(&ShortString::from(RETRY_COUNT_HEADER)),
            Some(&AMQPValue::LongLongInt(3))
        );
    }

    #[test]
    fn caller_supplied_retry_count_override_is_kept() {
        let mut options =
            SendOptions::default().header(RETRY_COUNT_HEADER, AMQPValue::LongLongInt(42));
        stamp_retry_count(&mut options, 2);
        assert_eq!(
            options.headers.get(&ShortString::from(RETRY_COUNT_HEADER)),
            Some(&AMQPValue::LongLongInt(42))
        );
    }
}

// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Trace Context Propagation
//!
//! Carries OpenTelemetry context through message headers: injected into
//! every publish, extracted again on the consuming side where a consumer
//! span is opened per delivery.

use lapin::{
    protocol::basic::AMQPProperties,
    types::{AMQPValue, ShortString},
};
use opentelemetry::{
    global::{self, BoxedSpan, BoxedTracer},
    propagation::{Extractor, Injector},
    trace::{SpanKind, Tracer},
    Context,
};
use std::{borrow::Cow, collections::BTreeMap};
use tracing::error;

/// Adapter exposing AMQP headers as an OpenTelemetry carrier.
pub(crate) struct HeaderCarrier<'a> {
    headers: &'a mut BTreeMap<ShortString, AMQPValue>,
}

impl<'a> HeaderCarrier<'a> {
    pub(crate) fn new(headers: &'a mut BTreeMap<ShortString, AMQPValue>) -> Self {
        Self { headers }
    }
}

impl Injector for HeaderCarrier<'_> {
    fn set(&mut self, key: &str, value: String) {
        self.headers.insert(
            key.to_lowercase().into(),
            AMQPValue::LongString(value.into()),
        );
    }
}

impl Extractor for HeaderCarrier<'_> {
    fn get(&self, key: &str) -> Option<&str> {
        self.headers.get(key).and_then(|value| {
            if let AMQPValue::LongString(value) = value {
                std::str::from_utf8(value.as_bytes())
                    .map_err(|e| error!("error decoding header value {:?}", e))
                    .ok()
            } else {
                None
            }
        })
    }

    fn keys(&self) -> Vec<&str> {
        self.headers.keys().map(|header| header.as_str()).collect()
    }
}

/// Injects the current trace context into outgoing message headers.
pub(crate) fn inject_context(headers: &mut BTreeMap<ShortString, AMQPValue>) {
    let ctx = Context::current();
    global::get_text_map_propagator(|propagator| {
        propagator.inject_context(&ctx, &mut HeaderCarrier::new(headers))
    });
}

/// Extracts the trace context of a delivery and opens a consumer span.
pub(crate) fn consumer_span(
    props: &AMQPProperties,
    tracer: &BoxedTracer,
    name: &str,
) -> (Context, BoxedSpan) {
    let ctx = global::get_text_map_propagator(|propagator| {
        propagator.extract(&HeaderCarrier::new(
            &mut props.headers().clone().unwrap_or_default().inner().clone(),
        ))
    });

    let span = tracer
        .span_builder(Cow::from(name.to_owned()))
        .with_kind(SpanKind::Consumer)
        .start_with_context(tracer, &ctx);

    (ctx, span)
}

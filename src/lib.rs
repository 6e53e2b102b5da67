// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # amqp-router
//!
//! A routing layer on top of an AMQP broker providing two delivery
//! patterns: exclusive-work **commands** (one shared queue, competing
//! consumers, delivered exactly once across all groups and clients) and
//! fan-out **events** (one queue per consumer group, delivered once per
//! group). A 25-rung TTL/dead-letter ladder supports delayed retries of
//! arbitrary length through a binary routing-key encoding, and rejected
//! messages can be redirected to a dead-letter command.
//!
//! The topology is provisioned idempotently against a broker that may not
//! yet exist: construction returns immediately, assertion retries forever
//! in the background, and sends issued before readiness are buffered and
//! replayed.

mod channel;
mod exchange;
mod gate;
mod otel;
mod queue;

pub mod client;
pub mod consumer;
pub mod errors;
pub mod group;
pub mod publisher;
pub mod retry;
pub mod topology;

pub use client::{ClientConfig, RouterClient};
pub use consumer::{HandlerResult, MessageContext, MessageHandler, RETRY_COUNT_HEADER};
pub use errors::RouterError;
pub use group::{ConsumerConfig, GroupHandlers};
pub use publisher::SendOptions;
pub use retry::{LEVEL_COUNT, MAX_DELAY, RETRY_ENTRY, RETRY_EXIT};
pub use topology::{
    DeadLetterConfig, DeadLetterPolicy, DestinationKind, GroupTopology, Topology,
};

// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Queue Definitions
//!
//! This module provides the types describing the queues the topology plan
//! declares and their bindings. Two queue shapes exist in the routing graph:
//! ladder rungs (message TTL plus a dead-letter exchange pointing at the next
//! rung) and destination queues (durable, optionally dead-lettering into the
//! configured dead-letter command).

/// Definition of a queue to be declared.
///
/// This struct implements the builder pattern. Destination and ladder queues
/// are always durable; TTL and dead-letter parameters are set where the
/// graph shape requires them.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub(crate) struct QueueDefinition {
    pub(crate) name: String,
    pub(crate) durable: bool,
    pub(crate) message_ttl: Option<u64>,
    pub(crate) dead_letter_exchange: Option<String>,
    pub(crate) dead_letter_routing_key: Option<String>,
}

impl QueueDefinition {
    /// Creates a new queue definition with the given name.
    pub(crate) fn new(name: impl Into<String>) -> QueueDefinition {
        QueueDefinition {
            name: name.into(),
            durable: false,
            message_ttl: None,
            dead_letter_exchange: None,
            dead_letter_routing_key: None,
        }
    }

    /// Makes the queue durable, persisting across broker restarts.
    pub(crate) fn durable(mut self) -> Self {
        self.durable = true;
        self
    }

    /// Sets the per-message TTL in milliseconds.
    ///
    /// Expired messages are dead-lettered to the configured exchange, which
    /// is what moves a message from one ladder rung to the next.
    pub(crate) fn message_ttl(mut self, ttl: u64) -> Self {
        self.message_ttl = Some(ttl);
        self
    }

    /// Sets the exchange expired or rejected messages are republished to.
    pub(crate) fn dead_letter_exchange(mut self, exchange: impl Into<String>) -> Self {
        self.dead_letter_exchange = Some(exchange.into());
        self
    }

    /// Sets the routing key dead-lettered messages are republished with.
    ///
    /// When unset the broker keeps the message's original routing key, which
    /// the ladder rungs rely on.
    pub(crate) fn dead_letter_routing_key(mut self, key: impl Into<String>) -> Self {
        self.dead_letter_routing_key = Some(key.into());
        self
    }
}

/// Configuration for binding a queue to an exchange.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct QueueBinding {
    pub(crate) queue: String,
    pub(crate) exchange: String,
    pub(crate) routing_key: String,
}

impl QueueBinding {
    pub(crate) fn new(
        queue: impl Into<String>,
        exchange: impl Into<String>,
        routing_key: impl Into<String>,
    ) -> QueueBinding {
        QueueBinding {
            queue: queue.into(),
            exchange: exchange.into(),
            routing_key: routing_key.into(),
        }
    }
}

// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Exchange Definitions
//!
//! This module provides the types describing the exchanges the topology plan
//! declares and the exchange-to-exchange bindings wiring them together. The
//! routing graph only uses two exchange kinds: topic exchanges for the retry
//! ladder (wildcard matching over the binary routing-key tag) and fanout
//! exchanges for event and command destinations.

/// Represents the exchange kinds used by the routing graph.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum ExchangeKind {
    /// Routes by wildcard pattern matching over dot-delimited routing keys
    #[default]
    Topic,
    /// Delivers a copy of every message to all bound destinations
    Fanout,
}

impl From<ExchangeKind> for lapin::ExchangeKind {
    fn from(kind: ExchangeKind) -> lapin::ExchangeKind {
        match kind {
            ExchangeKind::Topic => lapin::ExchangeKind::Topic,
            ExchangeKind::Fanout => lapin::ExchangeKind::Fanout,
        }
    }
}

/// Definition of an exchange to be declared.
///
/// Exchanges are always declared durable: the broker may be pre-provisioned
/// by an earlier run, and re-declaration must carry identical arguments to
/// succeed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct ExchangeDefinition {
    pub(crate) name: String,
    pub(crate) kind: ExchangeKind,
    pub(crate) durable: bool,
}

impl ExchangeDefinition {
    /// Creates a durable topic exchange definition.
    pub(crate) fn topic(name: impl Into<String>) -> ExchangeDefinition {
        ExchangeDefinition {
            name: name.into(),
            kind: ExchangeKind::Topic,
            durable: true,
        }
    }

    /// Creates a durable fanout exchange definition.
    pub(crate) fn fanout(name: impl Into<String>) -> ExchangeDefinition {
        ExchangeDefinition {
            name: name.into(),
            kind: ExchangeKind::Fanout,
            durable: true,
        }
    }
}

/// Configuration for binding an exchange to a source exchange.
///
/// The routing key is matched against the source exchange's semantics: the
/// ladder's pass-through bindings and the exit-to-destination bindings use
/// topic patterns, while fanout sources ignore the key entirely.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct ExchangeBinding {
    pub(crate) destination: String,
    pub(crate) source: String,
    pub(crate) routing_key: String,
}

impl ExchangeBinding {
    pub(crate) fn new(
        destination: impl Into<String>,
        source: impl Into<String>,
        routing_key: impl Into<String>,
    ) -> ExchangeBinding {
        ExchangeBinding {
            destination: destination.into(),
            source: source.into(),
            routing_key: routing_key.into(),
        }
    }
}

// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Error Types
//!
//! This module provides the error type for the routing layer. The
//! `RouterError` enum covers configuration problems surfaced at construction
//! or registration time, broker-side failures during topology assertion and
//! consumption setup, and publish failures.
//!
//! Configuration errors are never retried. Topology assertion errors are
//! retried forever by the assertion supervisor and never surfaced to callers.
//! Consumer setup errors are propagated once to the registration caller.

use thiserror::Error;

use crate::topology::DestinationKind;

/// Represents errors that can occur in the routing layer.
#[derive(Error, Debug, PartialEq, Eq)]
pub enum RouterError {
    /// Construction received an empty or invalid connection url list
    #[error("connection urls must be a non-empty list of amqp uris")]
    InvalidConnectionUrls,

    /// The configured dead letter command is not declared by any group
    #[error("the dead letter command `{0}` does not exist in the topology")]
    DeadLetterCommandMissing(String),

    /// A send targeted an event that is not declared in the topology
    #[error("this event does not exist in the topology: {0}")]
    UnknownEvent(String),

    /// A send targeted a command that is not declared in the topology
    #[error("this command does not exist in the topology: {0}")]
    UnknownCommand(String),

    /// Direct sends to the dead letter command are disabled by configuration
    #[error("sending to the dead letter command has been disabled")]
    SendingToDeadLetterDisabled,

    /// A consumer group was registered that the topology does not declare
    #[error("attempted to set up consumers for unregistered group: {0}")]
    UnregisteredGroup(String),

    /// Handlers were supplied for destinations the group does not declare
    #[error("group `{group}` attempted to consume {kind}s that were not registered for this group in the topology: {names}")]
    ExtraneousHandlers {
        group: String,
        kind: DestinationKind,
        names: String,
    },

    /// A destination the group declares was left without a handler
    #[error("group `{group}` did not provide a handler for {kind}s that were registered for this group in the topology: {names}")]
    MissingHandlers {
        group: String,
        kind: DestinationKind,
        names: String,
    },

    /// Delayed retries require the retry ladder, which was disabled
    #[error("delayed retries are disabled for this client")]
    DelayedRetryDisabled,

    /// Error establishing a connection to the broker
    #[error("failure to connect")]
    ConnectionError,

    /// Error creating a channel from an established connection
    #[error("failure to create a channel")]
    ChannelError,

    /// Error declaring an exchange with the given name
    #[error("failure to declare an exchange `{0}`")]
    DeclareExchangeError(String),

    /// Error declaring a queue with the given name
    #[error("failure to declare a queue `{0}`")]
    DeclareQueueError(String),

    /// Error binding a queue to an exchange
    #[error("failure to bind queue `{0}` to exchange `{1}`")]
    BindQueueError(String, String),

    /// Error binding an exchange to another exchange
    #[error("failure to bind exchange `{0}` to exchange `{1}`")]
    BindExchangeError(String, String),

    /// Error configuring the prefetch count on a consumption channel
    #[error("failure to configure prefetch for `{0}`")]
    PrefetchError(String),

    /// Error starting a consumer on a queue
    #[error("failure to start a consumer on `{0}`")]
    ConsumerSetupError(String),

    /// Error publishing a message to the given exchange
    #[error("failure to publish to `{0}`")]
    PublishError(String),

    /// Error acknowledging a message
    #[error("failure to ack message")]
    AckMessageError,

    /// Error rejecting a message
    #[error("failure to reject message")]
    RejectMessageError,

    /// The client was closed before a buffered message could be published
    #[error("client closed before the message could be published")]
    ClientClosed,
}

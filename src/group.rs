// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Consumer Group Registration
//!
//! This module wires up consumption for a named group: it validates the
//! supplied handlers against the declared topology, then opens one dedicated
//! channel per destination at the configured prefetch and begins
//! manual-acknowledgment consumption. The prefetch is the system's only
//! concurrency throttle; each destination backpressures independently.
//!
//! Registration is guarded against duplicates by the client's group
//! registry: a pending or successful group is a warn-and-noop, a failed one
//! is only retried by an explicit new call.

use crate::{
    channel::create_channel,
    consumer::{handle_delivery, MessageContext, MessageHandler},
    errors::RouterError,
    topology::{DestinationKind, Topology},
};
use futures_util::StreamExt;
use lapin::{
    options::{BasicConsumeOptions, BasicQosOptions},
    types::FieldTable,
    Channel, Connection,
};
use opentelemetry::global;
use std::{collections::HashMap, sync::Arc};
use tracing::error;

/// Registration state of one consumer group. Absence means unregistered.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum GroupState {
    Pending,
    Succeeded,
    Failed,
}

/// One destination's consumption settings.
pub struct ConsumerConfig {
    /// Maximum unacknowledged deliveries dispatched to this destination's
    /// channel, bounding concurrently-running handler invocations.
    pub prefetch: u16,
    pub handler: Arc<dyn MessageHandler>,
}

impl ConsumerConfig {
    pub fn new(prefetch: u16, handler: Arc<dyn MessageHandler>) -> ConsumerConfig {
        ConsumerConfig { prefetch, handler }
    }
}

/// The handlers a group registers, keyed by destination name.
///
/// Every destination the topology declares for the group must appear, and
/// nothing else may.
#[derive(Default)]
pub struct GroupHandlers {
    pub(crate) events: HashMap<String, ConsumerConfig>,
    pub(crate) commands: HashMap<String, ConsumerConfig>,
}

impl GroupHandlers {
    pub fn new() -> GroupHandlers {
        GroupHandlers::default()
    }

    /// Registers the handler consuming the given event.
    pub fn on_event(mut self, name: impl Into<String>, config: ConsumerConfig) -> Self {
        self.events.insert(name.into(), config);
        self
    }

    /// Registers the handler consuming the given command.
    pub fn on_command(mut self, name: impl Into<String>, config: ConsumerConfig) -> Self {
        self.commands.insert(name.into(), config);
        self
    }
}

/// Checks the supplied handlers cover the group's declared destinations
/// exactly.
pub(crate) fn validate_group(
    topology: &Topology,
    group: &str,
    handlers: &GroupHandlers,
) -> Result<(), RouterError> {
    let Some(declared) = topology.group(group) else {
        return Err(RouterError::UnregisteredGroup(group.to_owned()));
    };

    let extraneous_events = joined_names(
        handlers
            .events
            .keys()
            .filter(|name| !declared.events.contains(*name)),
    );
    if let Some(names) = extraneous_events {
        return Err(RouterError::ExtraneousHandlers {
            group: group.to_owned(),
            kind: DestinationKind::Event,
            names,
        });
    }

    let extraneous_commands = joined_names(
        handlers
            .commands
            .keys()
            .filter(|name| !declared.commands.contains(*name)),
    );
    if let Some(names) = extraneous_commands {
        return Err(RouterError::ExtraneousHandlers {
            group: group.to_owned(),
            kind: DestinationKind::Command,
            names,
        });
    }

    let missing_events = joined_names(
        declared
            .events
            .iter()
            .filter(|name| !handlers.events.contains_key(*name)),
    );
    if let Some(names) = missing_events {
        return Err(RouterError::MissingHandlers {
            group: group.to_owned(),
            kind: DestinationKind::Event,
            names,
        });
    }

    let missing_commands = joined_names(
        declared
            .commands
            .iter()
            .filter(|name| !handlers.commands.contains_key(*name)),
    );
    if let Some(names) = missing_commands {
        return Err(RouterError::MissingHandlers {
            group: group.to_owned(),
            kind: DestinationKind::Command,
            names,
        });
    }

    Ok(())
}

fn joined_names<'a>(names: impl Iterator<Item = &'a String>) -> Option<String> {
    let mut names: Vec<&str> = names.map(String::as_str).collect();
    if names.is_empty() {
        return None;
    }

    names.sort_unstable();
    Some(names.join(" "))
}

/// Opens a channel for one destination and starts its consume loop.
///
/// Returns the opened channel so the client can register it for shutdown.
/// The loop runs until the channel or connection closes; deliveries are
/// dispatched on their own tasks, so the channel prefetch is what bounds
/// concurrently-outstanding handler invocations.
pub(crate) async fn start_destination(
    connection: Arc<Connection>,
    group: String,
    destination: String,
    kind: DestinationKind,
    queue: String,
    config: ConsumerConfig,
    retry_channel: Option<Channel>,
) -> Result<Channel, RouterError> {
    let channel = create_channel(&connection).await?;

    if let Err(err) = channel
        .basic_qos(config.prefetch, BasicQosOptions::default())
        .await
    {
        error!(
            error = err.to_string(),
            queue = queue.as_str(),
            "failure to configure prefetch"
        );
        return Err(RouterError::PrefetchError(queue));
    }

    let mut consumer = match channel
        .basic_consume(
            &queue,
            &destination,
            BasicConsumeOptions {
                no_local: false,
                no_ack: false,
                exclusive: false,
                nowait: false,
            },
            FieldTable::default(),
        )
        .await
    {
        Ok(consumer) => consumer,
        Err(err) => {
            error!(
                error = err.to_string(),
                queue = queue.as_str(),
                "error to create the consumer"
            );
            return Err(RouterError::ConsumerSetupError(queue));
        }
    };

    let handler = config.handler;
    tokio::spawn(async move {
        while let Some(result) = consumer.next().await {
            match result {
                Ok(delivery) => {
                    let ctx = MessageContext::new(
                        delivery,
                        group.clone(),
                        destination.clone(),
                        kind,
                        queue.clone(),
                        retry_channel.clone(),
                    );
                    let handler = handler.clone();

                    tokio::spawn(async move {
                        let tracer = global::tracer("amqp consumer");
                        handle_delivery(&tracer, &handler, ctx).await;
                    });
                }
                Err(err) => error!(error = err.to_string(), "error consuming message"),
            }
        }
    });

    Ok(channel)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::consumer::MockMessageHandler;
    use crate::topology::GroupTopology;

    fn handler() -> ConsumerConfig {
        ConsumerConfig::new(10, Arc::new(MockMessageHandler::new()))
    }

    fn topology() -> Topology {
        Topology::new().with_group(
            "billing",
            GroupTopology::new(&["order-placed", "order-cancelled"], &["charge"]),
        )
    }

    #[test]
    fn unregistered_groups_are_rejected() {
        let handlers = GroupHandlers::new();
        assert_eq!(
            validate_group(&topology(), "shipping", &handlers),
            Err(RouterError::UnregisteredGroup("shipping".to_owned()))
        );
    }

    #[test]
    fn every_declared_destination_needs_a_handler() {
        let handlers = GroupHandlers::new()
            .on_event("order-placed", handler())
            .on_event("order-cancelled", handler());

        assert_eq!(
            validate_group(&topology(), "billing", &handlers),
            Err(RouterError::MissingHandlers {
                group: "billing".to_owned(),
                kind: DestinationKind::Command,
                names: "charge".to_owned(),
            })
        );

        let handlers = GroupHandlers::new().on_command("charge", handler());
        assert_eq!(
            validate_group(&topology(), "billing", &handlers),
            Err(RouterError::MissingHandlers {
                group: "billing".to_owned(),
                kind: DestinationKind::Event,
                names: "order-cancelled order-placed".to_owned(),
            })
        );
    }

    #[test]
    fn undeclared_destinations_are_rejected_first() {
        let handlers = GroupHandlers::new()
            .on_event("order-placed", handler())
            .on_event("order-cancelled", handler())
            .on_event("order-returned", handler())
            .on_command("charge", handler());

        assert_eq!(
            validate_group(&topology(), "billing", &handlers),
            Err(RouterError::ExtraneousHandlers {
                group: "billing".to_owned(),
                kind: DestinationKind::Event,
                names: "order-returned".to_owned(),
            })
        );

        // Extraneous handlers are reported even when others are missing.
        let handlers = GroupHandlers::new().on_command("refund", handler());
        assert_eq!(
            validate_group(&topology(), "billing", &handlers),
            Err(RouterError::ExtraneousHandlers {
                group: "billing".to_owned(),
                kind: DestinationKind::Command,
                names: "refund".to_owned(),
            })
        );
    }

    #[test]
    fn complete_handler_sets_pass_validation() {
        let handlers = GroupHandlers::new()
            .on_event("order-placed", handler())
            .on_event("order-cancelled", handler())
            .on_command("charge", handler());

        assert!(validate_group(&topology(), "billing", &handlers).is_ok());
    }
}

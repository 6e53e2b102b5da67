// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Topology Management
//!
//! This module provides the declared topology data model (consumer groups and
//! the events/commands they consume), the dead-letter configuration, and the
//! construction of the full exchange/queue/binding graph against the broker.
//!
//! The graph is built as a phased plan. Declarations and bindings inside one
//! phase carry no ordering dependency and fan out concurrently, but each
//! phase requires the previous one to have completed:
//!
//! 1. Retry ladder: a topic exchange and TTL queue per level, each queue
//!    dead-lettering into the next level's exchange.
//! 2. Ladder boundary: the `retry.entry` / `retry.exit` exchanges, the
//!    queueless past-the-end exchange, and every rung's capture and
//!    pass-through bindings.
//! 3. Destinations: per-event shared and per-group exchanges and queues,
//!    per-command shared exchange/queue pairs, dead-letter arguments, and
//!    the exit-exchange bindings feeding delayed retries back in.
//!
//! Every declaration is idempotent: asserting an identical topology twice
//! succeeds both times.

use crate::{
    errors::RouterError,
    exchange::{ExchangeBinding, ExchangeDefinition},
    queue::{QueueBinding, QueueDefinition},
    retry::{build_pattern, level_info, LEVEL_COUNT, RETRY_ENTRY, RETRY_EXIT},
};
use futures_util::future::try_join_all;
use lapin::{
    options::{ExchangeBindOptions, ExchangeDeclareOptions, QueueBindOptions, QueueDeclareOptions},
    types::{AMQPValue, FieldTable, LongString, ShortString},
    Channel,
};
use serde::{Deserialize, Serialize};
use std::{
    collections::{BTreeMap, BTreeSet},
    fmt,
    sync::Arc,
};
use tracing::{debug, error};

/// Constant for the queue argument used to specify a dead letter exchange
pub const AMQP_HEADERS_DEAD_LETTER_EXCHANGE: &str = "x-dead-letter-exchange";
/// Constant for the queue argument used to specify a dead letter routing key
pub const AMQP_HEADERS_DEAD_LETTER_ROUTING_KEY: &str = "x-dead-letter-routing-key";
/// Constant for the queue argument used to specify message TTL
pub const AMQP_HEADERS_MESSAGE_TTL: &str = "x-message-ttl";

/// Command every destination dead-letters into unless configured otherwise.
pub const DEFAULT_DEAD_LETTER_COMMAND: &str = "dead-letter";

/// The two delivery patterns a destination can have.
///
/// Commands are consumed from one queue shared by every group that declares
/// them (competing consumers, exactly-once across groups). Events fan out to
/// one queue per declaring group.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DestinationKind {
    Event,
    Command,
}

impl DestinationKind {
    /// Returns the wire name of the destination's shared exchange.
    pub(crate) fn exchange_name(&self, destination: &str) -> String {
        format!("{}.{}", self, destination)
    }
}

impl fmt::Display for DestinationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DestinationKind::Event => write!(f, "event"),
            DestinationKind::Command => write!(f, "command"),
        }
    }
}

/// The destinations one consumer group declares.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct GroupTopology {
    #[serde(default)]
    pub events: Vec<String>,
    #[serde(default)]
    pub commands: Vec<String>,
}

impl GroupTopology {
    /// Creates a group topology from event and command name slices.
    pub fn new(events: &[&str], commands: &[&str]) -> GroupTopology {
        GroupTopology {
            events: events.iter().map(|name| (*name).to_owned()).collect(),
            commands: commands.iter().map(|name| (*name).to_owned()).collect(),
        }
    }
}

/// The full declared topology: consumer groups and their destinations.
///
/// Declared once at client construction and immutable thereafter. Group
/// names are unique by construction (map keys).
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Topology {
    groups: BTreeMap<String, GroupTopology>,
}

impl Topology {
    pub fn new() -> Topology {
        Topology::default()
    }

    /// Adds a consumer group and its destinations.
    pub fn with_group(mut self, name: impl Into<String>, group: GroupTopology) -> Self {
        self.groups.insert(name.into(), group);
        self
    }

    /// Returns the destinations declared for the given group.
    pub fn group(&self, name: &str) -> Option<&GroupTopology> {
        self.groups.get(name)
    }

    pub(crate) fn groups(&self) -> impl Iterator<Item = (&String, &GroupTopology)> {
        self.groups.iter()
    }

    /// Every distinct event name across all groups.
    pub(crate) fn event_names(&self) -> BTreeSet<&str> {
        self.groups
            .values()
            .flat_map(|group| group.events.iter().map(String::as_str))
            .collect()
    }

    /// Every distinct command name across all groups.
    pub(crate) fn command_names(&self) -> BTreeSet<&str> {
        self.groups
            .values()
            .flat_map(|group| group.commands.iter().map(String::as_str))
            .collect()
    }

    pub(crate) fn has_event(&self, name: &str) -> bool {
        self.groups.values().any(|group| group.events.iter().any(|e| e == name))
    }

    pub(crate) fn has_command(&self, name: &str) -> bool {
        self.groups.values().any(|group| group.commands.iter().any(|c| c == name))
    }
}

/// Maps a dead-lettered queue name to the routing key its messages carry.
pub type DeadLetterRoutingKeyFn = Arc<dyn Fn(&str) -> String + Send + Sync>;

/// Dead-letter redirection settings.
///
/// Rejected and expired destination messages are republished to the
/// configured command's exchange. `command_name` left unset resolves to
/// [`DEFAULT_DEAD_LETTER_COMMAND`]; an explicitly set name must exist in the
/// topology.
#[derive(Clone)]
pub struct DeadLetterConfig {
    pub command_name: Option<String>,
    pub routing_key: DeadLetterRoutingKeyFn,
    pub disable_sending_to_dlx: bool,
}

impl DeadLetterConfig {
    /// The command dead-lettered messages are redirected to.
    pub(crate) fn command(&self) -> &str {
        self.command_name
            .as_deref()
            .unwrap_or(DEFAULT_DEAD_LETTER_COMMAND)
    }
}

impl Default for DeadLetterConfig {
    fn default() -> DeadLetterConfig {
        DeadLetterConfig {
            command_name: None,
            routing_key: Arc::new(|queue| queue.to_owned()),
            disable_sending_to_dlx: true,
        }
    }
}

impl fmt::Debug for DeadLetterConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DeadLetterConfig")
            .field("command_name", &self.command_name)
            .field("disable_sending_to_dlx", &self.disable_sending_to_dlx)
            .finish_non_exhaustive()
    }
}

/// Whether dead-letter redirection is applied to destination queues.
#[derive(Debug, Clone)]
pub enum DeadLetterPolicy {
    Enabled(DeadLetterConfig),
    Disabled,
}

impl DeadLetterPolicy {
    pub(crate) fn config(&self) -> Option<&DeadLetterConfig> {
        match self {
            DeadLetterPolicy::Enabled(config) => Some(config),
            DeadLetterPolicy::Disabled => None,
        }
    }
}

impl Default for DeadLetterPolicy {
    fn default() -> DeadLetterPolicy {
        DeadLetterPolicy::Enabled(DeadLetterConfig::default())
    }
}

/// Checks that an explicitly configured dead-letter command is declared.
pub(crate) fn validate_dead_letter(
    topology: &Topology,
    policy: &DeadLetterPolicy,
) -> Result<(), RouterError> {
    if let Some(config) = policy.config() {
        if let Some(name) = &config.command_name {
            if !topology.has_command(name) {
                return Err(RouterError::DeadLetterCommandMissing(name.clone()));
            }
        }
    }

    Ok(())
}

/// One ordering unit of the assertion plan.
///
/// Everything inside a phase is independent; declarations are executed
/// before bindings so a binding never references a name declared in its own
/// phase before that name exists.
#[derive(Debug, Default, PartialEq, Eq)]
pub(crate) struct TopologyPhase {
    pub(crate) exchanges: Vec<ExchangeDefinition>,
    pub(crate) queues: Vec<QueueDefinition>,
    pub(crate) exchange_bindings: Vec<ExchangeBinding>,
    pub(crate) queue_bindings: Vec<QueueBinding>,
}

/// The complete exchange/queue/binding graph for a declared topology.
#[derive(Debug, PartialEq, Eq)]
pub(crate) struct TopologyPlan {
    pub(crate) phases: Vec<TopologyPhase>,
}

impl TopologyPlan {
    /// Builds the assertion plan for the declared topology.
    pub(crate) fn build(
        topology: &Topology,
        disable_retry_queues: bool,
        dead_letter: &DeadLetterPolicy,
    ) -> TopologyPlan {
        let mut phases = Vec::with_capacity(3);

        if !disable_retry_queues {
            phases.push(ladder_phase());
            phases.push(boundary_phase());
        }

        phases.push(destination_phase(topology, disable_retry_queues, dead_letter));

        TopologyPlan { phases }
    }

    /// Installs the plan on the broker over the given channel.
    ///
    /// Any error aborts the attempt; the caller owns retrying.
    pub(crate) async fn install(&self, channel: &Channel) -> Result<(), RouterError> {
        for phase in &self.phases {
            try_join_all(phase.exchanges.iter().map(|def| declare_exchange(channel, def)))
                .await?;
            try_join_all(phase.queues.iter().map(|def| declare_queue(channel, def))).await?;
            try_join_all(
                phase
                    .exchange_bindings
                    .iter()
                    .map(|binding| bind_exchange(channel, binding)),
            )
            .await?;
            try_join_all(
                phase
                    .queue_bindings
                    .iter()
                    .map(|binding| bind_queue(channel, binding)),
            )
            .await?;
        }

        Ok(())
    }
}

/// Ladder rungs: one topic exchange and one TTL queue per level, each queue
/// dead-lettering into the next level's exchange.
fn ladder_phase() -> TopologyPhase {
    let mut phase = TopologyPhase::default();

    for level in 1..=LEVEL_COUNT {
        let rung = level_info(level);
        let next = level_info(level + 1);

        phase.exchanges.push(ExchangeDefinition::topic(rung.name.as_str()));
        phase.queues.push(
            QueueDefinition::new(rung.name.as_str())
                .durable()
                .message_ttl(rung.message_ttl)
                .dead_letter_exchange(next.name),
        );
    }

    phase
}

/// Ladder boundary: entry and exit exchanges, the queueless past-the-end
/// exchange the last rung dead-letters into, and every rung's capture and
/// pass-through bindings.
fn boundary_phase() -> TopologyPhase {
    let mut phase = TopologyPhase::default();

    let first = level_info(1);
    let past_end = level_info(LEVEL_COUNT + 1);

    phase.exchanges.push(ExchangeDefinition::topic(RETRY_ENTRY));
    phase.exchanges.push(ExchangeDefinition::topic(past_end.name.as_str()));
    phase.exchanges.push(ExchangeDefinition::topic(RETRY_EXIT));

    phase
        .exchange_bindings
        .push(ExchangeBinding::new(first.name, RETRY_ENTRY, "#"));
    phase
        .exchange_bindings
        .push(ExchangeBinding::new(RETRY_EXIT, past_end.name, "#"));

    for level in 1..=LEVEL_COUNT {
        let rung = level_info(level);
        let next = level_info(level + 1);

        // Capture: hold messages whose bit for this level is set.
        phase.queue_bindings.push(QueueBinding::new(
            rung.name.as_str(),
            rung.name.as_str(),
            build_pattern(level, true),
        ));
        // Pass-through: forward everything else to the next rung.
        phase.exchange_bindings.push(ExchangeBinding::new(
            next.name,
            rung.name,
            build_pattern(level, false),
        ));
    }

    phase
}

/// Destination routing: event fan-out per group, one shared queue per
/// command, dead-letter arguments, and exit-exchange bindings.
fn destination_phase(
    topology: &Topology,
    disable_retry_queues: bool,
    dead_letter: &DeadLetterPolicy,
) -> TopologyPhase {
    let mut phase = TopologyPhase::default();
    let config = dead_letter.config();

    // One shared fanout exchange per distinct event, however many groups
    // declare it.
    for event in topology.event_names() {
        phase
            .exchanges
            .push(ExchangeDefinition::fanout(DestinationKind::Event.exchange_name(event)));
    }

    for (group_name, group) in topology.groups() {
        for event in &group.events {
            let shared = DestinationKind::Event.exchange_name(event);
            let grouped = format!("event.{}.{}", group_name, event);

            phase.exchanges.push(ExchangeDefinition::fanout(grouped.as_str()));

            let mut queue = QueueDefinition::new(grouped.as_str()).durable();
            if let Some(config) = config {
                queue = queue
                    .dead_letter_exchange(DestinationKind::Command.exchange_name(config.command()))
                    .dead_letter_routing_key((config.routing_key)(&grouped));
            }
            phase.queues.push(queue);

            phase
                .exchange_bindings
                .push(ExchangeBinding::new(grouped.as_str(), shared, ""));
            phase
                .queue_bindings
                .push(QueueBinding::new(grouped.as_str(), grouped.as_str(), ""));

            if !disable_retry_queues {
                phase.exchange_bindings.push(ExchangeBinding::new(
                    grouped.as_str(),
                    RETRY_EXIT,
                    format!("#.{}", grouped),
                ));
            }
        }
    }

    // Exactly one exchange/queue pair per command, shared by every group
    // that lists it. The shared queue is what makes delivery exclusive
    // across groups.
    for command in topology.command_names() {
        let namespaced = DestinationKind::Command.exchange_name(command);

        phase.exchanges.push(ExchangeDefinition::fanout(namespaced.as_str()));

        let mut queue = QueueDefinition::new(namespaced.as_str()).durable();
        if let Some(config) = config {
            // The dead-letter command itself never dead-letters; that would
            // cycle.
            if config.command() != command {
                queue = queue
                    .dead_letter_exchange(DestinationKind::Command.exchange_name(config.command()))
                    .dead_letter_routing_key((config.routing_key)(&namespaced));
            }
        }
        phase.queues.push(queue);

        phase
            .queue_bindings
            .push(QueueBinding::new(namespaced.as_str(), namespaced.as_str(), ""));

        if !disable_retry_queues {
            phase.exchange_bindings.push(ExchangeBinding::new(
                namespaced.as_str(),
                RETRY_EXIT,
                format!("#.{}", namespaced),
            ));
        }
    }

    phase
}

async fn declare_exchange(channel: &Channel, def: &ExchangeDefinition) -> Result<(), RouterError> {
    debug!("creating exchange: {}", def.name);

    match channel
        .exchange_declare(
            &def.name,
            def.kind.into(),
            ExchangeDeclareOptions {
                durable: def.durable,
                ..ExchangeDeclareOptions::default()
            },
            FieldTable::default(),
        )
        .await
    {
        Err(err) => {
            error!(
                error = err.to_string(),
                name = def.name.as_str(),
                "error to declare the exchange"
            );
            Err(RouterError::DeclareExchangeError(def.name.clone()))
        }
        _ => Ok(()),
    }
}

async fn declare_queue(channel: &Channel, def: &QueueDefinition) -> Result<(), RouterError> {
    debug!("creating queue: {}", def.name);

    let mut args = BTreeMap::new();

    if let Some(ttl) = def.message_ttl {
        // Upper rungs exceed i32 milliseconds; the argument is a long long.
        args.insert(
            ShortString::from(AMQP_HEADERS_MESSAGE_TTL),
            AMQPValue::LongLongInt(ttl as i64),
        );
    }

    if let Some(exchange) = &def.dead_letter_exchange {
        args.insert(
            ShortString::from(AMQP_HEADERS_DEAD_LETTER_EXCHANGE),
            AMQPValue::LongString(LongString::from(exchange.as_str())),
        );
    }

    if let Some(key) = &def.dead_letter_routing_key {
        args.insert(
            ShortString::from(AMQP_HEADERS_DEAD_LETTER_ROUTING_KEY),
            AMQPValue::LongString(LongString::from(key.as_str())),
        );
    }

    match channel
        .queue_declare(
            &def.name,
            QueueDeclareOptions {
                durable: def.durable,
                ..QueueDeclareOptions::default()
            },
            FieldTable::from(args),
        )
        .await
    {
        Err(err) => {
            error!(
                error = err.to_string(),
                name = def.name.as_str(),
                "error to declare the queue"
            );
            Err(RouterError::DeclareQueueError(def.name.clone()))
        }
        _ => Ok(()),
    }
}

async fn bind_exchange(channel: &Channel, binding: &ExchangeBinding) -> Result<(), RouterError> {
    debug!(
        "binding exchange: {} to the exchange: {} with the key: {}",
        binding.destination, binding.source, binding.routing_key
    );

    match channel
        .exchange_bind(
            &binding.destination,
            &binding.source,
            &binding.routing_key,
            ExchangeBindOptions::default(),
            FieldTable::default(),
        )
        .await
    {
        Err(err) => {
            error!(error = err.to_string(), "error to bind exchange to exchange");
            Err(RouterError::BindExchangeError(
                binding.destination.clone(),
                binding.source.clone(),
            ))
        }
        _ => Ok(()),
    }
}

async fn bind_queue(channel: &Channel, binding: &QueueBinding) -> Result<(), RouterError> {
    debug!(
        "binding queue: {} to the exchange: {} with the key: {}",
        binding.queue, binding.exchange, binding.routing_key
    );

    match channel
        .queue_bind(
            &binding.queue,
            &binding.exchange,
            &binding.routing_key,
            QueueBindOptions { nowait: false },
            FieldTable::default(),
        )
        .await
    {
        Err(err) => {
            error!(error = err.to_string(), "error to bind queue to exchange");
            Err(RouterError::BindQueueError(
                binding.queue.clone(),
                binding.exchange.clone(),
            ))
        }
        _ => Ok(()),
    }
}

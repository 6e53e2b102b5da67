// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # AMQP Connection and Channel Management
//!
//! This module handles the creation of AMQP connections and channels. The
//! client is constructed with a list of broker uris treated as a fallback
//! set: each uri is tried in order and the first successful connection wins.
//! Reconnection below channel granularity is the broker connection layer's
//! concern, not this crate's.

use crate::errors::RouterError;
use lapin::{types::LongString, Channel, Connection, ConnectionProperties};
use tracing::{debug, error};

/// Connects to the first reachable broker uri in the list.
///
/// # Parameters
/// * `urls` - Broker uris, tried in order
/// * `name` - Connection name reported to the broker
///
/// # Returns
/// * `Result<Connection, RouterError>` - The established connection, or
///   `ConnectionError` once every uri has failed.
pub(crate) async fn connect_any(urls: &[String], name: &str) -> Result<Connection, RouterError> {
    for url in urls {
        debug!(connection = name, "creating amqp connection...");

        let options =
            ConnectionProperties::default().with_connection_name(LongString::from(name));

        match Connection::connect(url, options).await {
            Ok(connection) => {
                debug!(connection = name, "amqp connected");
                return Ok(connection);
            }
            Err(err) => {
                error!(
                    error = err.to_string(),
                    connection = name,
                    "failure to connect"
                );
            }
        }
    }

    Err(RouterError::ConnectionError)
}

/// Creates a channel on an established connection.
pub(crate) async fn create_channel(connection: &Connection) -> Result<Channel, RouterError> {
    debug!("creating amqp channel...");

    match connection.create_channel().await {
        Ok(channel) => {
            debug!("channel created");
            Ok(channel)
        }
        Err(err) => {
            error!(error = err.to_string(), "error to create the channel");
            Err(RouterError::ChannelError)
        }
    }
}

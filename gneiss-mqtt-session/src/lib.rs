/*
 * Copyright Bret Ambrose. All Rights Reserved.
 * SPDX-License-Identifier: Apache-2.0.
 */

/*!
Session and message-lifecycle core for MQTT 3.1.1 and MQTT 5 clients.

This crate tracks everything an MQTT client has to remember about a broker session: in-flight
QoS 1 and QoS 2 messages in both directions, packet id allocation, keep alive pings, the
connection establishment state machine, reconnect backoff, and optional persistence of
in-flight records so they survive a restart.

Socket I/O and byte-level packet encoding are supplied by the application through the
[`Transport`](network::Transport) and [`PacketCodec`](network::PacketCodec) traits.  A single
[`SessionWorker`](worker::SessionWorker) drives every registered session; applications publish,
subscribe and disconnect through a shared [`SessionHandle`](client::SessionHandle).
 */

pub mod client;
pub mod config;
pub mod connection;
pub mod error;
mod logging;
pub mod message;
pub mod mqtt;
pub mod network;
pub mod packet;
pub mod persistence;
pub mod publication;
mod queue;
pub mod registry;
pub mod session;
pub mod will;
pub mod worker;

#[cfg(test)]
mod testing;

pub use client::{ListenerHandle, SessionEventListener, SessionHandle};
pub use config::{BackpressurePolicy, DisconnectOptions, DisconnectOptionsBuilder, SessionOptions, SessionOptionsBuilder};
pub use error::{SessionError, SessionResult};
pub use mqtt::{MessageProperties, ProtocolVersion, QualityOfService};
pub use publication::Publication;
pub use session::{ClientSession, DeliveredMessage, SessionEvent};
pub use worker::SessionWorker;

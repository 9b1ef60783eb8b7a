/*
 * Copyright Bret Ambrose. All Rights Reserved.
 * SPDX-License-Identifier: Apache-2.0.
 */

/*!
A module containing the core crate error enumeration, context structures, and conversion
definitions.
 */

use crate::connection::ConnectionState;
use crate::persistence::PersistenceKey;

use std::error::Error;
use std::fmt;

/// Additional details about a TransportFailure error variant
#[derive(Debug)]
pub struct TransportFailureContext {
    source: Box<dyn Error + Send + Sync + 'static>
}

/// Additional details about a ConnectionEstablishmentFailure error variant
#[derive(Debug)]
pub struct ConnectionEstablishmentFailureContext {
    source: Box<dyn Error + Send + Sync + 'static>
}

/// Additional details about a ConnectionClosed error variant
#[derive(Debug)]
pub struct ConnectionClosedContext {
    source: Box<dyn Error + Send + Sync + 'static>
}

/// Additional details about a ProtocolError error variant
#[derive(Debug)]
pub struct ProtocolErrorContext {
    source: Box<dyn Error + Send + Sync + 'static>
}

/// Additional details about a DecodingFailure error variant
#[derive(Debug)]
pub struct DecodingFailureContext {
    source: Box<dyn Error + Send + Sync + 'static>
}

/// Additional details about an EncodingFailure error variant
#[derive(Debug)]
pub struct EncodingFailureContext {
    source: Box<dyn Error + Send + Sync + 'static>
}

/// Additional details about a PersistenceFailure error variant
#[derive(Debug)]
pub struct PersistenceFailureContext {

    /// key of the record whose read, write, or transform failed, if one was involved
    pub key: Option<PersistenceKey>,

    source: Box<dyn Error + Send + Sync + 'static>
}

/// Additional details about an InflightLimitReached error variant
#[derive(Debug)]
pub struct InflightLimitReachedContext {

    /// maximum number of unacknowledged QoS 1+ publishes the session allows
    pub limit: usize,
}

/// Additional details about a PacketIdSpaceExhausted error variant
#[derive(Debug)]
pub struct PacketIdSpaceExhaustedContext {
}

/// Additional details about a MessageExpired error variant
#[derive(Debug)]
pub struct MessageExpiredContext {

    /// packet id the expired publish was bound to
    pub packet_id: u16,
}

/// Additional details about a UserInitiatedDisconnect error variant
#[derive(Debug)]
pub struct UserInitiatedDisconnectContext {
}

/// Additional details about a SessionClosed error variant
#[derive(Debug)]
pub struct SessionClosedContext {
}

/// Additional details about a DuplicateClientId error variant
#[derive(Debug)]
pub struct DuplicateClientIdContext {

    /// client identifier that is already registered
    pub client_id: String,
}

/// Additional details about a SessionNotFound error variant
#[derive(Debug)]
pub struct SessionNotFoundContext {

    /// client identifier that was looked up
    pub client_id: String,
}

/// Additional details about an InvalidStateTransition error variant
#[derive(Debug)]
pub struct InvalidStateTransitionContext {

    /// connection state at the time of the rejected transition
    pub from: ConnectionState,

    source: Box<dyn Error + Send + Sync + 'static>
}

/// Additional details about an InternalStateError error variant
#[derive(Debug)]
pub struct InternalStateErrorContext {
    source: Box<dyn Error + Send + Sync + 'static>
}

/// Basic error type for the entire gneiss-mqtt-session crate.
#[derive(Debug)]
#[non_exhaustive]
pub enum SessionError {

    /// Socket, TLS, proxy, or websocket failure reported by the transport collaborator.
    TransportFailure(TransportFailureContext),

    /// Error emitted when a connection attempt fails.  Failure is defined as
    /// "the attempt is finished for any reason prior to receipt of a successful Connack packet."
    ConnectionEstablishmentFailure(ConnectionEstablishmentFailureContext),

    /// Error emitted when a successfully established connection subsequently gets closed for
    /// some reason (keep alive timeout, server-side disconnect, etc...).
    ConnectionClosed(ConnectionClosedContext),

    /// Generic error emitted when the session encounters broker behavior that violates the MQTT
    /// specification in a way that cannot be safely ignored or recovered from.
    ProtocolError(ProtocolErrorContext),

    /// Error reported by the packet codec while decoding incoming bytes.
    DecodingFailure(DecodingFailureContext),

    /// Error reported by the packet codec while encoding an outbound packet.
    EncodingFailure(EncodingFailureContext),

    /// A persistence store operation or a before-write/after-read transform failed.  Only the
    /// record involved is affected; the session continues.
    PersistenceFailure(PersistenceFailureContext),

    /// A QoS 1+ publish was rejected because the session already tracks the maximum number of
    /// unacknowledged publishes.
    InflightLimitReached(InflightLimitReachedContext),

    /// Every packet id is bound to an unacknowledged operation.
    PacketIdSpaceExhausted(PacketIdSpaceExhaustedContext),

    /// An MQTT5 publish reached its message expiry before being acknowledged.
    MessageExpired(MessageExpiredContext),

    /// Emitted to operations (including blocked publishers) that are released because the
    /// user requested a disconnect.  Does not indicate an actual failure.
    UserInitiatedDisconnect(UserInitiatedDisconnectContext),

    /// An operation was submitted to a session that has been destroyed.
    SessionClosed(SessionClosedContext),

    /// A session with the same client identifier is already registered.
    DuplicateClientId(DuplicateClientIdContext),

    /// No registered session has the requested client identifier.
    SessionNotFound(SessionNotFoundContext),

    /// The connection state machine rejected a transition from its current state.
    InvalidStateTransition(InvalidStateTransitionContext),

    /// Error emitted by the session when something happens that should never happen.  Always
    /// indicates a bug.
    InternalStateError(InternalStateErrorContext),
}

impl SessionError {

    /// Constructs a TransportFailure variant from an existing error.  Intended for transport
    /// collaborator implementations.
    pub fn new_transport_failure(source: impl Into<Box<dyn Error + Send + Sync + 'static>>) -> Self {
        SessionError::TransportFailure(
            TransportFailureContext {
                source : source.into()
            }
        )
    }

    pub(crate) fn new_connection_establishment_failure(source: impl Into<Box<dyn Error + Send + Sync + 'static>>) -> Self {
        SessionError::ConnectionEstablishmentFailure(
            ConnectionEstablishmentFailureContext {
                source : source.into()
            }
        )
    }

    pub(crate) fn new_connection_closed(source: impl Into<Box<dyn Error + Send + Sync + 'static>>) -> Self {
        SessionError::ConnectionClosed(
            ConnectionClosedContext {
                source : source.into()
            }
        )
    }

    pub(crate) fn new_protocol_error(source: impl Into<Box<dyn Error + Send + Sync + 'static>>) -> Self {
        SessionError::ProtocolError(
            ProtocolErrorContext {
                source : source.into()
            }
        )
    }

    /// Constructs a DecodingFailure variant from an existing error.  Intended for packet codec
    /// implementations.
    pub fn new_decoding_failure(source: impl Into<Box<dyn Error + Send + Sync + 'static>>) -> Self {
        SessionError::DecodingFailure(
            DecodingFailureContext {
                source : source.into()
            }
        )
    }

    /// Constructs an EncodingFailure variant from an existing error.  Intended for packet codec
    /// implementations.
    pub fn new_encoding_failure(source: impl Into<Box<dyn Error + Send + Sync + 'static>>) -> Self {
        SessionError::EncodingFailure(
            EncodingFailureContext {
                source : source.into()
            }
        )
    }

    pub(crate) fn new_persistence_failure(key: Option<PersistenceKey>, source: impl Into<Box<dyn Error + Send + Sync + 'static>>) -> Self {
        SessionError::PersistenceFailure(
            PersistenceFailureContext {
                key,
                source : source.into()
            }
        )
    }

    pub(crate) fn new_inflight_limit_reached(limit: usize) -> Self {
        SessionError::InflightLimitReached(
            InflightLimitReachedContext {
                limit
            }
        )
    }

    pub(crate) fn new_packet_id_space_exhausted() -> Self {
        SessionError::PacketIdSpaceExhausted(
            PacketIdSpaceExhaustedContext {
            }
        )
    }

    pub(crate) fn new_message_expired(packet_id: u16) -> Self {
        SessionError::MessageExpired(
            MessageExpiredContext {
                packet_id
            }
        )
    }

    pub(crate) fn new_user_initiated_disconnect() -> Self {
        SessionError::UserInitiatedDisconnect(
            UserInitiatedDisconnectContext {
            }
        )
    }

    pub(crate) fn new_session_closed() -> Self {
        SessionError::SessionClosed(
            SessionClosedContext {
            }
        )
    }

    pub(crate) fn new_duplicate_client_id(client_id: &str) -> Self {
        SessionError::DuplicateClientId(
            DuplicateClientIdContext {
                client_id: client_id.to_string()
            }
        )
    }

    pub(crate) fn new_session_not_found(client_id: &str) -> Self {
        SessionError::SessionNotFound(
            SessionNotFoundContext {
                client_id: client_id.to_string()
            }
        )
    }

    pub(crate) fn new_invalid_state_transition(from: ConnectionState, source: impl Into<Box<dyn Error + Send + Sync + 'static>>) -> Self {
        SessionError::InvalidStateTransition(
            InvalidStateTransitionContext {
                from,
                source : source.into()
            }
        )
    }

    pub(crate) fn new_internal_state_error(source: impl Into<Box<dyn Error + Send + Sync + 'static>>) -> Self {
        SessionError::InternalStateError(
            InternalStateErrorContext {
                source : source.into()
            }
        )
    }
}

impl Error for SessionError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            SessionError::TransportFailure(context) => {
                Some(context.source.as_ref())
            }
            SessionError::ConnectionEstablishmentFailure(context) => {
                Some(context.source.as_ref())
            }
            SessionError::ConnectionClosed(context) => {
                Some(context.source.as_ref())
            }
            SessionError::ProtocolError(context) => {
                Some(context.source.as_ref())
            }
            SessionError::DecodingFailure(context) => {
                Some(context.source.as_ref())
            }
            SessionError::EncodingFailure(context) => {
                Some(context.source.as_ref())
            }
            SessionError::PersistenceFailure(context) => {
                Some(context.source.as_ref())
            }
            SessionError::InvalidStateTransition(context) => {
                Some(context.source.as_ref())
            }
            SessionError::InternalStateError(context) => {
                Some(context.source.as_ref())
            }
            _ => { None }
        }
    }
}

impl fmt::Display for SessionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SessionError::TransportFailure(_) => {
                write!(f, "transport failure; source contains further details")
            }
            SessionError::ConnectionEstablishmentFailure(_) => {
                write!(f, "failed to establish an MQTT connection to the broker")
            }
            SessionError::ConnectionClosed(_) => {
                write!(f, "session connection was closed; source contains further details")
            }
            SessionError::ProtocolError(_) => {
                write!(f, "broker behavior disallowed by the mqtt spec")
            }
            SessionError::DecodingFailure(_) => {
                write!(f, "failure encountered while decoding an incoming MQTT packet")
            }
            SessionError::EncodingFailure(_) => {
                write!(f, "failure encountered while encoding an outbound MQTT packet")
            }
            SessionError::PersistenceFailure(context) => {
                if let Some(key) = &context.key {
                    write!(f, "persistence operation failed for record {}", key)
                } else {
                    write!(f, "persistence operation failed")
                }
            }
            SessionError::InflightLimitReached(context) => {
                write!(f, "publish rejected; session already tracks the maximum of {} unacknowledged publishes", context.limit)
            }
            SessionError::PacketIdSpaceExhausted(_) => {
                write!(f, "every packet id is bound to an unacknowledged operation")
            }
            SessionError::MessageExpired(context) => {
                write!(f, "publish with packet id {} expired before it was acknowledged", context.packet_id)
            }
            SessionError::UserInitiatedDisconnect(_) => {
                write!(f, "connection was shut down by user action")
            }
            SessionError::SessionClosed(_) => {
                write!(f, "the session has been destroyed")
            }
            SessionError::DuplicateClientId(context) => {
                write!(f, "a session with client id \"{}\" is already registered", context.client_id)
            }
            SessionError::SessionNotFound(context) => {
                write!(f, "no session with client id \"{}\" is registered", context.client_id)
            }
            SessionError::InvalidStateTransition(context) => {
                write!(f, "connection state machine rejected a transition out of {}", context.from)
            }
            SessionError::InternalStateError(_) => {
                write!(f, "session reached an invalid internal state; almost certainly a bug")
            }
        }
    }
}

impl From<std::io::Error> for SessionError {
    fn from(error: std::io::Error) -> Self {
        SessionError::new_transport_failure(error)
    }
}

impl From<httparse::Error> for SessionError {
    fn from(error: httparse::Error) -> Self {
        SessionError::new_connection_establishment_failure(error)
    }
}

impl From<core::str::Utf8Error> for SessionError {
    fn from(error: core::str::Utf8Error) -> Self {
        SessionError::new_decoding_failure(error)
    }
}

/// Crate-wide result type for functions that can fail
pub type SessionResult<T> = Result<T, SessionError>;

pub(crate) fn fold_session_result<T>(base: SessionResult<T>, new_result: SessionResult<T>) -> SessionResult<T> {
    new_result?;
    base
}

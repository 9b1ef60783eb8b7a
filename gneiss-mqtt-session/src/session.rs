/*
 * Copyright Bret Ambrose. All Rights Reserved.
 * SPDX-License-Identifier: Apache-2.0.
 */

/*!
The client session aggregate.

A [`ClientSession`] owns everything that describes one logical connection to a broker: the
connection state machine, keep alive bookkeeping, the inbound and outbound in-flight queues,
the FIFOs of messages that have not been promoted yet, and the persistence handle.  It performs
no I/O.  The worker feeds it transport events and decoded packets, and pulls packets to write
out of [`ClientSession::service`].
 */

use crate::config::*;
use crate::connection::*;
use crate::error::{SessionError, SessionResult};
use crate::message::*;
use crate::mqtt::*;
use crate::network::*;
use crate::packet::*;
use crate::persistence::SessionPersistence;
use crate::publication::Publication;
use crate::queue::SequencedQueue;
use crate::will::WillMessage;

use log::*;
use std::collections::{BTreeMap, VecDeque};
use std::fmt;
use std::time::{Duration, Instant};

// delay before a PUBREL whose stage could not be persisted is attempted again
const PUBREL_PERSISTENCE_RETRY_DELAY: Duration = Duration::from_secs(1);

/// A message received from the broker whose delivery handshake has completed
#[derive(Clone, Debug)]
pub struct DeliveredMessage {
    pub packet_id: u16,
    pub qos: QualityOfService,
    pub retain: bool,
    pub publication: Publication,
    pub properties: MessageProperties,
}

impl DeliveredMessage {
    pub fn topic(&self) -> &str {
        self.publication.topic()
    }

    pub fn payload(&self) -> &[u8] {
        self.publication.payload()
    }
}

/// Notifications produced by a session
#[derive(Debug)]
pub enum SessionEvent {

    /// A connection attempt received a successful Connack
    ConnectionSuccess {
        session_present: bool,
    },

    /// A connection attempt ended before a successful Connack was received
    ConnectionFailure(SessionError),

    /// An established connection was lost.  In-flight state is kept for resend unless the next
    /// connection uses clean start.
    ConnectionLost(SessionError),

    /// A message from the broker is ready for the application
    MessageArrived(DeliveredMessage),

    /// The broker acknowledged a QoS 1+ publish.  The reason code is the final Puback, Pubrec
    /// (on failure) or Pubcomp reason code.
    PublishComplete {
        packet_id: u16,
        qos: QualityOfService,
        reason_code: u8,
    },

    /// A QoS 1+ publish was abandoned without acknowledgement
    PublishFailed {
        packet_id: u16,
        error: SessionError,
    },

    SubscribeComplete {
        packet_id: u16,
        result: SessionResult<Vec<u8>>,
    },

    UnsubscribeComplete {
        packet_id: u16,
        result: SessionResult<Vec<u8>>,
    },

    /// A user-requested disconnect has finished tearing down the connection
    Disconnected,
}

impl fmt::Display for SessionEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SessionEvent::ConnectionSuccess { session_present } => {
                write!(f, "ConnectionSuccess {{ session_present:{} }}", session_present)
            }
            SessionEvent::ConnectionFailure(error) => {
                write!(f, "ConnectionFailure {{ {} }}", error)
            }
            SessionEvent::ConnectionLost(error) => {
                write!(f, "ConnectionLost {{ {} }}", error)
            }
            SessionEvent::MessageArrived(message) => {
                write!(f, "MessageArrived {{ packet_id:{} topic:\"{}\" }}", message.packet_id, message.topic())
            }
            SessionEvent::PublishComplete { packet_id, qos, reason_code } => {
                write!(f, "PublishComplete {{ packet_id:{} qos:{} reason_code:{} }}", packet_id, qos, reason_code)
            }
            SessionEvent::PublishFailed { packet_id, error } => {
                write!(f, "PublishFailed {{ packet_id:{} {} }}", packet_id, error)
            }
            SessionEvent::SubscribeComplete { packet_id, .. } => {
                write!(f, "SubscribeComplete {{ packet_id:{} }}", packet_id)
            }
            SessionEvent::UnsubscribeComplete { packet_id, .. } => {
                write!(f, "UnsubscribeComplete {{ packet_id:{} }}", packet_id)
            }
            SessionEvent::Disconnected => {
                write!(f, "Disconnected")
            }
        }
    }
}

// entries of the queued-outbound FIFO; tracked publishes already own an in-flight record
enum QueuedPublish {
    Tracked(u16),
    Untracked(OutboundPublish),
}

struct PendingRequest {
    packet: OutboundPacket,
    sent: bool,
}

/// State for one logical MQTT client connection
pub struct ClientSession {
    client_id: String,
    options: SessionOptions,
    assigned_client_id: Option<String>,

    connection: ConnectionStateMachine,

    // false once an unrecoverable transport error is seen, until the next attempt begins
    good: bool,
    desired_connection: bool,
    user_disconnect: bool,
    end_session_requested: bool,
    disconnect_generation: u64,
    destroyed: bool,

    ping_outstanding: bool,
    ping_due: bool,
    ping_due_time: Option<Instant>,
    ping_timeout_time: Option<Instant>,
    connack_timeout_time: Option<Instant>,

    network: NetworkHandle,

    next_packet_id: u16,
    keep_alive_interval_seconds: u16,
    saved_keep_alive_interval_seconds: u16,

    will: Option<WillMessage>,

    inbound: InflightQueue,
    outbound: InflightQueue,
    undelivered: SequencedQueue<DeliveredMessage>,
    queued_outbound: SequencedQueue<QueuedPublish>,
    pending_control: VecDeque<OutboundPacket>,
    pending_requests: BTreeMap<u16, PendingRequest>,
    pending_disconnect: Option<OutboundPacket>,

    // outbound records to resend after resuming a session, and how many have been resent
    resend_ids: Vec<u16>,
    connect_sent: usize,

    persistence: Option<SessionPersistence>,

    events: Vec<SessionEvent>,
}

impl ClientSession {
    pub fn new(options: SessionOptions, persistence: Option<SessionPersistence>) -> Self {
        let keep_alive = options.keep_alive_interval_seconds;
        let will = options.will.clone();

        ClientSession {
            client_id: options.client_id.clone(),
            options,
            assigned_client_id: None,
            connection: ConnectionStateMachine::new(),
            good: false,
            desired_connection: false,
            user_disconnect: false,
            end_session_requested: false,
            disconnect_generation: 0,
            destroyed: false,
            ping_outstanding: false,
            ping_due: false,
            ping_due_time: None,
            ping_timeout_time: None,
            connack_timeout_time: None,
            network: NetworkHandle::new(),
            next_packet_id: 1,
            keep_alive_interval_seconds: keep_alive,
            saved_keep_alive_interval_seconds: keep_alive,
            will,
            inbound: InflightQueue::new(),
            outbound: InflightQueue::new(),
            undelivered: SequencedQueue::new(),
            queued_outbound: SequencedQueue::new(),
            pending_control: VecDeque::new(),
            pending_requests: BTreeMap::new(),
            pending_disconnect: None,
            resend_ids: Vec::new(),
            connect_sent: 0,
            persistence,
            events: Vec::new(),
        }
    }

    pub fn client_id(&self) -> &str {
        self.client_id.as_str()
    }

    /// Client id assigned by the broker in the most recent Connack (MQTT5), if any
    pub fn assigned_client_id(&self) -> Option<&str> {
        self.assigned_client_id.as_deref()
    }

    pub fn options(&self) -> &SessionOptions {
        &self.options
    }

    pub fn state(&self) -> ConnectionState {
        self.connection.state()
    }

    pub fn is_connected(&self) -> bool {
        self.connection.is_connected()
    }

    /// False once an unrecoverable transport error has been observed on the current connection
    pub fn is_good(&self) -> bool {
        self.good
    }

    pub fn is_destroyed(&self) -> bool {
        self.destroyed
    }

    pub fn desires_connection(&self) -> bool {
        self.desired_connection
    }

    /// Incremented by every disconnect request
    pub fn disconnect_generation(&self) -> u64 {
        self.disconnect_generation
    }

    pub fn keep_alive_interval_seconds(&self) -> u16 {
        self.keep_alive_interval_seconds
    }

    pub fn is_ping_outstanding(&self) -> bool {
        self.ping_outstanding
    }

    pub fn is_ping_due(&self) -> bool {
        self.ping_due
    }

    pub fn network(&self) -> &NetworkHandle {
        &self.network
    }

    pub fn will(&self) -> Option<&WillMessage> {
        self.will.as_ref()
    }

    pub fn inbound(&self) -> &InflightQueue {
        &self.inbound
    }

    pub fn outbound(&self) -> &InflightQueue {
        &self.outbound
    }

    /// Number of publishes (any QoS) that have not been written for the first time
    pub fn queued_publish_count(&self) -> usize {
        self.queued_outbound.len()
    }

    pub fn undelivered_count(&self) -> usize {
        self.undelivered.len()
    }

    /// Number of outbound records to resend after the most recent session resumption
    pub fn connect_count(&self) -> usize {
        self.resend_ids.len()
    }

    /// Number of those records that have been resent so far
    pub fn connect_sent(&self) -> usize {
        self.connect_sent
    }

    /// True if a QoS 1+ publish would currently be accepted
    pub fn has_publish_capacity(&self) -> bool {
        self.outbound.len() < self.options.max_inflight_messages
    }

    pub fn socket(&self) -> Option<SocketId> {
        self.network.socket()
    }

    /// Replaces the will sent with subsequent Connect packets
    pub fn set_will(&mut self, will: Option<WillMessage>) {
        self.will = will;
    }

    pub fn take_events(&mut self) -> Vec<SessionEvent> {
        std::mem::take(&mut self.events)
    }

    /// Removes and returns every completed inbound message, in arrival order
    pub fn take_delivered(&mut self) -> Vec<DeliveredMessage> {
        self.undelivered.drain()
    }

    /// Requests that the session be connected (and reconnected after failures)
    pub fn connect(&mut self) -> SessionResult<()> {
        if self.destroyed {
            return Err(SessionError::new_session_closed());
        }

        self.desired_connection = true;
        self.end_session_requested = false;
        Ok(())
    }

    // a lost connection is not re-established until the application asks again
    pub(crate) fn halt_reconnect(&mut self) {
        self.desired_connection = false;
    }

    /// Rebuilds the in-flight queues from persisted records.  Records that cannot be restored
    /// are reported and skipped.
    pub fn restore_from_persistence(&mut self, now: Instant) -> Vec<SessionError> {
        let Some(persistence) = &mut self.persistence else {
            return Vec::new();
        };

        let (messages, mut errors) = persistence.restore(self.client_id.as_str(), now);
        for message in messages {
            let result = match message.direction {
                Direction::Outbound => { self.outbound.insert_restored(message) }
                Direction::Inbound => { self.inbound.insert_restored(message) }
            };

            if let Err(error) = result {
                warn!("[{}] restore_from_persistence - {}", self.client_id, error);
                errors.push(error);
            }
        }

        errors
    }

    /// Submits a publish.  QoS 1+ publishes are assigned a packet id and tracked in flight until
    /// acknowledged; the packet id (zero for QoS 0) is returned.
    pub fn publish(&mut self, publication: Publication, qos: QualityOfService, retain: bool, properties: MessageProperties, now: Instant) -> SessionResult<u16> {
        if self.destroyed {
            return Err(SessionError::new_session_closed());
        }

        let properties =
            if self.options.protocol_version.supports_properties() {
                properties
            } else {
                MessageProperties::default()
            };

        if qos == QualityOfService::AtMostOnce {
            let publish = OutboundPublish {
                packet_id: 0,
                qos,
                retain,
                duplicate: false,
                publication,
                properties,
            };

            self.queued_outbound.push(QueuedPublish::Untracked(publish));
            return Ok(0);
        }

        if !self.has_publish_capacity() {
            debug!("[{}] publish - rejected, {} publishes already in flight", self.client_id, self.outbound.len());
            return Err(SessionError::new_inflight_limit_reached(self.options.max_inflight_messages));
        }

        let packet_id = self.acquire_free_packet_id()?;
        let mut message = InflightMessage::new_outbound(packet_id, qos, retain, self.options.protocol_version, properties, publication, now)?;
        message.queue_sequence = Some(self.queued_outbound.push(QueuedPublish::Tracked(packet_id)));
        self.outbound.insert(message)?;

        debug!("[{}] publish - bound packet id {} to qos {} publish", self.client_id, packet_id, qos);
        Ok(packet_id)
    }

    pub fn subscribe(&mut self, subscriptions: Vec<Subscription>) -> SessionResult<u16> {
        if self.destroyed {
            return Err(SessionError::new_session_closed());
        }

        if subscriptions.is_empty() {
            return Err(SessionError::new_protocol_error("subscribe requires at least one subscription"));
        }

        let packet_id = self.acquire_free_packet_id()?;
        let packet = OutboundPacket::Subscribe(SubscribePacket { packet_id, subscriptions });
        self.pending_requests.insert(packet_id, PendingRequest { packet, sent: false });

        Ok(packet_id)
    }

    pub fn unsubscribe(&mut self, topic_filters: Vec<String>) -> SessionResult<u16> {
        if self.destroyed {
            return Err(SessionError::new_session_closed());
        }

        if topic_filters.is_empty() {
            return Err(SessionError::new_protocol_error("unsubscribe requires at least one topic filter"));
        }

        let packet_id = self.acquire_free_packet_id()?;
        let packet = OutboundPacket::Unsubscribe(UnsubscribePacket { packet_id, topic_filters });
        self.pending_requests.insert(packet_id, PendingRequest { packet, sent: false });

        Ok(packet_id)
    }

    /// Requests that the connection be closed.  A Disconnect packet is written first if the
    /// session is connected.
    pub fn disconnect(&mut self, options: DisconnectOptions) {
        info!("[{}] disconnect - requested in state {}", self.client_id, self.connection.state());

        self.desired_connection = false;
        self.disconnect_generation += 1;
        self.end_session_requested = options.end_session;

        if self.connection.is_connected() {
            let session_expiry_interval_seconds =
                if self.options.protocol_version.supports_properties() {
                    options.session_expiry_interval_seconds
                } else {
                    None
                };

            self.pending_disconnect = Some(OutboundPacket::Disconnect(DisconnectPacket {
                reason_code: options.reason_code,
                session_expiry_interval_seconds,
            }));
        }

        if self.connection.begin_disconnect() {
            self.user_disconnect = true;
            self.connack_timeout_time = None;
            self.reset_ping_state();
        }
    }

    /// True once a disconnect requested ending the session and the connection is gone
    pub fn is_destroy_pending(&self) -> bool {
        self.end_session_requested && !self.destroyed && self.connection.state() == ConnectionState::NotInProgress && !self.connection.is_connected()
    }

    /// Permanently discards the session: in-flight publishes fail, persisted records and the
    /// will are dropped.
    pub fn destroy(&mut self) {
        if self.destroyed {
            return;
        }

        info!("[{}] destroy - discarding session", self.client_id);

        self.destroyed = true;
        self.desired_connection = false;
        self.will = None;

        for message in self.outbound.drain() {
            self.events.push(SessionEvent::PublishFailed {
                packet_id: message.packet_id,
                error: SessionError::new_session_closed(),
            });
        }

        self.inbound.drain();
        self.queued_outbound.drain();
        self.undelivered.drain();
        self.pending_control.clear();
        self.pending_disconnect = None;

        let request_ids : Vec<u16> = self.pending_requests.keys().copied().collect();
        for packet_id in request_ids {
            self.fail_request(packet_id, SessionError::new_session_closed());
        }

        if let Some(persistence) = &mut self.persistence {
            if let Err(error) = persistence.clear(self.client_id.as_str()) {
                warn!("[{}] destroy - failed to clear persisted records: {}", self.client_id, error);
            }
        }
    }

    /// Starts a connection attempt and returns what the transport needs to open the connection
    pub fn begin_connect(&mut self, now: Instant) -> SessionResult<OpenRequest> {
        if self.destroyed {
            return Err(SessionError::new_session_closed());
        }

        let proxy = self.options.proxy().cloned();
        let plan = ConnectionPlan {
            proxy: proxy.is_some(),
            tls: self.options.tls,
            websocket: self.options.websocket,
        };

        self.connection.begin(plan)?;

        info!("[{}] begin_connect - starting connection attempt to {}", self.client_id, self.options.endpoint);

        self.good = true;
        self.user_disconnect = false;
        self.keep_alive_interval_seconds = self.saved_keep_alive_interval_seconds;
        self.reset_ping_state();
        self.pending_control.clear();
        self.pending_disconnect = None;
        self.resend_ids.clear();
        self.connect_sent = 0;

        if self.options.clean_start {
            self.discard_session_state();
        }

        self.network.prepare(proxy.clone(), self.options.http_headers.clone());
        self.connack_timeout_time = Some(now + self.options.connect_timeout);

        Ok(OpenRequest {
            broker: self.options.endpoint.clone(),
            proxy,
            tls: self.options.tls,
            tls_session: self.network.tls_session.clone(),
            websocket: self.options.websocket,
            http_headers: self.options.http_headers.clone(),
        })
    }

    pub fn bind_socket(&mut self, socket: SocketId) {
        debug!("[{}] bind_socket - bound to {}", self.client_id, socket);
        self.network.bind_socket(socket);
    }

    /// Applies a transport progress or failure notification to the connection state machine
    pub fn on_transport_event(&mut self, event: TransportEvent) {
        if let TransportEvent::Failed(error) = event {
            self.on_transport_failure(error);
            return;
        }

        let state = self.connection.state();
        let expected_state = match &event {
            TransportEvent::Readable | TransportEvent::Failed(_) => {
                return;
            }
            TransportEvent::ProxyConnected => { ConnectionState::ProxyConnectInProgress }
            TransportEvent::TcpConnected => { ConnectionState::TcpInProgress }
            TransportEvent::TlsEstablished(_) => { ConnectionState::SslInProgress }
            TransportEvent::WebsocketUpgraded(_) => { ConnectionState::WebsocketInProgress }
        };

        if state != expected_state {
            error!("[{}] on_transport_event - {} is not valid in state {}", self.client_id, event, state);
            self.on_transport_failure(SessionError::new_invalid_state_transition(state, "transport event does not match the connection stage"));
            return;
        }

        match event {
            TransportEvent::TlsEstablished(tls_session) => {
                if tls_session.is_some() {
                    self.network.tls_session = tls_session;
                }
            }
            TransportEvent::WebsocketUpgraded(key) => {
                self.network.websocket = true;
                self.network.websocket_key = Some(key);
            }
            _ => {}
        }

        match self.connection.complete_stage() {
            Ok(ConnectionState::WaitForConnack) => {
                let connect = self.build_connect_packet();
                self.pending_control.push_back(OutboundPacket::Connect(connect));
            }
            Ok(_) => {}
            Err(error) => {
                self.on_transport_failure(error);
            }
        }
    }

    /// Reacts to an unrecoverable transport error (or a failure the session detected itself)
    pub fn on_transport_failure(&mut self, error: SessionError) {
        let state = self.connection.state();

        if self.connection.is_connected() {
            error!("[{}] on_transport_failure - connection lost: {}", self.client_id, error);
            self.connection.begin_disconnect();
            self.good = false;
            self.reset_ping_state();
            self.pending_control.clear();
            self.events.push(SessionEvent::ConnectionLost(error));
        } else if state.is_establishing() {
            error!("[{}] on_transport_failure - connection attempt failed in state {}: {}", self.client_id, state, error);
            self.connection.begin_disconnect();
            self.good = false;
            self.connack_timeout_time = None;
            self.pending_control.clear();
            self.events.push(SessionEvent::ConnectionFailure(error));
        } else if state == ConnectionState::Disconnecting {
            debug!("[{}] on_transport_failure - failure while disconnecting: {}", self.client_id, error);
            self.good = false;
            self.pending_disconnect = None;
        } else {
            debug!("[{}] on_transport_failure - ignoring failure while idle: {}", self.client_id, error);
        }
    }

    /// True once the connection is disconnecting and nothing else needs to be written on it
    pub fn needs_teardown(&self) -> bool {
        self.connection.state() == ConnectionState::Disconnecting && self.pending_disconnect.is_none()
    }

    /// Completes a disconnect once the transport has been closed.  Returns the socket that was
    /// released.
    pub fn finish_teardown(&mut self) -> Option<SocketId> {
        if let Err(error) = self.connection.finish_disconnect() {
            debug!("[{}] finish_teardown - {}", self.client_id, error);
            return None;
        }

        let socket = self.network.release_socket();
        self.pending_control.clear();
        self.pending_disconnect = None;
        self.connack_timeout_time = None;
        self.reset_ping_state();

        if self.user_disconnect {
            self.user_disconnect = false;
            info!("[{}] finish_teardown - disconnect complete", self.client_id);
            self.events.push(SessionEvent::Disconnected);
        }

        socket
    }

    /// Applies a decoded packet from the broker
    pub fn handle_packet(&mut self, packet: InboundPacket, now: Instant) {
        crate::logging::log_packet(format!("[{}] Received: ", self.client_id).as_str(), packet.packet_type(), &packet);
        self.network.record_received(now);

        if let InboundPacket::Connack(connack) = packet {
            self.handle_connack(connack, now);
            return;
        }

        if !self.connection.is_connected() {
            if self.connection.state() == ConnectionState::WaitForConnack {
                error!("[{}] handle_packet - {} received before connack", self.client_id, packet.packet_type());
                self.on_transport_failure(SessionError::new_protocol_error("packet received before connack"));
            } else {
                debug!("[{}] handle_packet - discarding {} while not connected", self.client_id, packet.packet_type());
            }
            return;
        }

        match packet {
            InboundPacket::Publish(publish) => { self.handle_publish(publish, now); }
            InboundPacket::Puback(puback) => { self.handle_puback(puback, now); }
            InboundPacket::Pubrec(pubrec) => { self.handle_pubrec(pubrec, now); }
            InboundPacket::Pubrel(pubrel) => { self.handle_pubrel(pubrel, now); }
            InboundPacket::Pubcomp(pubcomp) => { self.handle_pubcomp(pubcomp, now); }
            InboundPacket::Suback(suback) => {
                self.complete_request(suback.packet_id, PacketType::Subscribe, suback.reason_codes);
            }
            InboundPacket::Unsuback(unsuback) => {
                self.complete_request(unsuback.packet_id, PacketType::Unsubscribe, unsuback.reason_codes);
            }
            InboundPacket::Pingresp => {
                self.ping_outstanding = false;
                self.ping_timeout_time = None;
            }
            InboundPacket::Disconnect(disconnect) => {
                info!("[{}] handle_packet - server sent disconnect with reason code {}", self.client_id, disconnect.reason_code);
                self.on_transport_failure(SessionError::new_connection_closed("server sent a disconnect packet"));
            }
            InboundPacket::Connack(_) => {}
        }
    }

    /// Produces the packets to write, in priority order, up to `budget` packets.  A zero budget
    /// means the transport cannot accept writes; time-based checks still run.
    pub fn service(&mut self, now: Instant, budget: usize) -> Vec<OutboundPacket> {
        let mut packets = Vec::new();
        if self.destroyed {
            return packets;
        }

        self.expire_messages(now);

        let state = self.connection.state();
        if state.is_establishing() {
            if let Some(connack_timeout) = self.connack_timeout_time {
                if now >= connack_timeout {
                    error!("[{}] service - connack timeout exceeded", self.client_id);
                    self.on_transport_failure(SessionError::new_connection_establishment_failure("connack response timeout reached"));
                    return packets;
                }
            }

            if state == ConnectionState::WaitForConnack {
                self.service_control(budget, &mut packets);
            }
        } else if state == ConnectionState::Disconnecting {
            if budget > 0 {
                if let Some(disconnect) = self.pending_disconnect.take() {
                    packets.push(disconnect);
                }
            }
        } else if self.connection.is_connected() {
            self.service_connected(now, budget, &mut packets);
        }

        if !packets.is_empty() {
            self.network.record_sent(now);
        }

        packets
    }

    /// Earliest time at which [`ClientSession::service`] has something to do, if any
    pub fn next_service_time(&self, now: Instant) -> Option<Instant> {
        if self.destroyed {
            return None;
        }

        let mut next_service_time = None;
        for message in self.outbound.iter() {
            next_service_time = fold_optional_timepoint_min(&next_service_time, &message.expiry_time());
        }

        let state = self.connection.state();
        if state.is_establishing() {
            next_service_time = fold_optional_timepoint_min(&next_service_time, &self.connack_timeout_time);
            if state == ConnectionState::WaitForConnack && !self.pending_control.is_empty() {
                next_service_time = fold_timepoint(&next_service_time, &now);
            }
        } else if state == ConnectionState::Disconnecting {
            if self.pending_disconnect.is_some() {
                next_service_time = fold_timepoint(&next_service_time, &now);
            }
        } else if self.connection.is_connected() {
            next_service_time = fold_optional_timepoint_min(&next_service_time, &self.ping_timeout_time);
            next_service_time = fold_optional_timepoint_min(&next_service_time, &self.ping_due_time);
            next_service_time = fold_optional_timepoint_min(&next_service_time, &self.next_ping_time());

            if self.has_pending_writes(now) {
                next_service_time = fold_timepoint(&next_service_time, &now);
            }

            let retry_interval = self.options.retry_interval;
            for message in self.outbound.iter().chain(self.inbound.iter()) {
                next_service_time = fold_optional_timepoint_min(&next_service_time, &message.retry_time(retry_interval));
                if message.needs_pubrel() {
                    next_service_time = fold_optional_timepoint_min(&next_service_time, &message.pubrel_hold);
                }
            }
        }

        next_service_time
    }

    fn service_connected(&mut self, now: Instant, budget: usize, packets: &mut Vec<OutboundPacket>) {
        if let Some(ping_timeout) = self.ping_timeout_time {
            if now >= ping_timeout {
                error!("[{}] service_connected - keep alive timeout exceeded", self.client_id);
                self.on_transport_failure(SessionError::new_connection_closed("keep alive timeout exceeded"));
                return;
            }
        }

        if let Some(next_ping) = self.next_ping_time() {
            if now >= next_ping && !self.ping_due {
                debug!("[{}] service_connected - ping is due", self.client_id);
                self.ping_due = true;
                self.ping_due_time = Some(now);
            }
        }

        // pings take priority over every other write
        if self.ping_due && packets.len() < budget {
            packets.push(OutboundPacket::Pingreq);
            self.ping_due = false;
            self.ping_due_time = None;
            self.ping_outstanding = true;
            self.ping_timeout_time = Some(now + self.options.ping_timeout);
            self.network.record_ping(now);
        }

        self.service_control(budget, packets);
        self.service_resends(now, budget, packets);
        self.service_pubrels(now, budget, packets);
        // time-based retry waits until every record owed a resend has been resent
        if self.good && self.connect_sent >= self.resend_ids.len() {
            self.service_retries(now, budget, packets);
        }
        self.service_requests(budget, packets);
        self.service_queued_publishes(now, budget, packets);
    }

    fn service_control(&mut self, budget: usize, packets: &mut Vec<OutboundPacket>) {
        while packets.len() < budget {
            let Some(packet) = self.pending_control.pop_front() else {
                return;
            };

            packets.push(packet);
        }
    }

    fn service_resends(&mut self, now: Instant, budget: usize, packets: &mut Vec<OutboundPacket>) {
        while self.connect_sent < self.resend_ids.len() && packets.len() < budget {
            let packet_id = self.resend_ids[self.connect_sent];
            self.connect_sent += 1;

            if let Some(packet) = self.transmit_outbound(packet_id, now) {
                debug!("[{}] service_resends - resending packet id {} ({} of {})", self.client_id, packet_id, self.connect_sent, self.resend_ids.len());
                packets.push(packet);
            }
        }
    }

    fn service_pubrels(&mut self, now: Instant, budget: usize, packets: &mut Vec<OutboundPacket>) {
        let pubrel_ids : Vec<u16> = self.outbound.iter().filter(|message| message.is_pubrel_due(now)).map(|message| message.packet_id).collect();
        for packet_id in pubrel_ids {
            if packets.len() >= budget {
                return;
            }

            if let Some(packet) = self.transmit_outbound(packet_id, now) {
                packets.push(packet);
            }
        }
    }

    fn service_retries(&mut self, now: Instant, budget: usize, packets: &mut Vec<OutboundPacket>) {
        let retry_interval = self.options.retry_interval;

        let outbound_ids : Vec<u16> = self.outbound.iter().filter(|message| message.is_retry_due(now, retry_interval)).map(|message| message.packet_id).collect();
        for packet_id in outbound_ids {
            if packets.len() >= budget {
                return;
            }

            if let Some(packet) = self.transmit_outbound(packet_id, now) {
                debug!("[{}] service_retries - retrying outbound packet id {}", self.client_id, packet_id);
                packets.push(packet);
            }
        }

        for message in self.inbound.iter_mut() {
            if packets.len() >= budget {
                return;
            }

            if message.is_retry_due(now, retry_interval) {
                debug!("[{}] service_retries - retrying pubrec for packet id {}", self.client_id, message.packet_id);
                packets.push(message.transmit(now));
            }
        }
    }

    fn service_requests(&mut self, budget: usize, packets: &mut Vec<OutboundPacket>) {
        for request in self.pending_requests.values_mut() {
            if packets.len() >= budget {
                return;
            }

            if !request.sent {
                request.sent = true;
                packets.push(request.packet.clone());
            }
        }
    }

    fn service_queued_publishes(&mut self, now: Instant, budget: usize, packets: &mut Vec<OutboundPacket>) {
        while packets.len() < budget {
            let Some((_, entry)) = self.queued_outbound.pop_front() else {
                return;
            };

            match entry {
                QueuedPublish::Untracked(publish) => {
                    packets.push(OutboundPacket::Publish(publish));
                }
                QueuedPublish::Tracked(packet_id) => {
                    let Some(message) = self.outbound.get_mut(packet_id) else {
                        continue;
                    };

                    message.queue_sequence = None;
                    let packet = message.transmit(now);

                    // records become durable on first write
                    if let Err(error) = persist_message(&mut self.persistence, self.client_id.as_str(), message) {
                        warn!("[{}] service_queued_publishes - abandoning packet id {}: {}", self.client_id, packet_id, error);
                        self.outbound.remove(packet_id);
                        self.events.push(SessionEvent::PublishFailed { packet_id, error });
                        continue;
                    }

                    packets.push(packet);
                }
            }
        }
    }

    fn has_pending_writes(&self, now: Instant) -> bool {
        !self.pending_control.is_empty()
            || self.connect_sent < self.resend_ids.len()
            || self.outbound.iter().any(|message| message.is_pubrel_due(now))
            || self.pending_requests.values().any(|request| !request.sent)
            || !self.queued_outbound.is_empty()
    }

    fn next_ping_time(&self) -> Option<Instant> {
        if self.keep_alive_interval_seconds == 0 || self.ping_outstanding || self.ping_due {
            return None;
        }

        let last_sent = self.network.last_sent?;
        Some(last_sent + Duration::from_secs(self.keep_alive_interval_seconds as u64))
    }

    fn reset_ping_state(&mut self) {
        self.ping_outstanding = false;
        self.ping_due = false;
        self.ping_due_time = None;
        self.ping_timeout_time = None;
    }

    // transmits an outbound record's current step; a PUBREL only goes out once its stage is persisted
    fn transmit_outbound(&mut self, packet_id: u16, now: Instant) -> Option<OutboundPacket> {
        let message = self.outbound.get_mut(packet_id)?;
        let writes_pubrel = message.needs_pubrel();
        if writes_pubrel && !message.is_pubrel_due(now) {
            return None;
        }

        let packet = message.transmit(now);

        if writes_pubrel {
            if let Err(error) = persist_message(&mut self.persistence, self.client_id.as_str(), message) {
                warn!("[{}] transmit_outbound - withholding pubrel for packet id {} until its stage can be persisted: {}", self.client_id, packet_id, error);
                message.hold_pubrel(now + PUBREL_PERSISTENCE_RETRY_DELAY);
                return None;
            }
        }

        Some(packet)
    }

    fn expire_messages(&mut self, now: Instant) {
        let expired : Vec<u16> = self.outbound.iter().filter(|message| message.is_expired(now)).map(|message| message.packet_id).collect();
        for packet_id in expired {
            if let Some(message) = self.outbound.remove(packet_id) {
                info!("[{}] expire_messages - packet id {} expired before it was acknowledged", self.client_id, packet_id);
                if let Some(sequence) = message.queue_sequence {
                    self.queued_outbound.remove(sequence);
                }

                self.remove_persisted(&message);
                self.events.push(SessionEvent::PublishFailed {
                    packet_id,
                    error: SessionError::new_message_expired(packet_id),
                });
            }
        }
    }

    // clean start: state bound to the previous connection is abandoned, never-written publishes stay queued
    fn discard_session_state(&mut self) {
        let sent_ids : Vec<u16> = self.outbound.iter().filter(|message| message.queue_sequence.is_none()).map(|message| message.packet_id).collect();
        for packet_id in sent_ids {
            if let Some(message) = self.outbound.remove(packet_id) {
                self.remove_persisted(&message);
                self.events.push(SessionEvent::PublishFailed {
                    packet_id,
                    error: SessionError::new_connection_closed("session state discarded by clean start"),
                });
            }
        }

        for message in self.inbound.drain() {
            self.remove_persisted(&message);
        }

        let sent_requests : Vec<u16> = self.pending_requests.iter().filter(|(_, request)| request.sent).map(|(packet_id, _)| *packet_id).collect();
        for packet_id in sent_requests {
            self.fail_request(packet_id, SessionError::new_connection_closed("session state discarded by clean start"));
        }
    }

    fn handle_connack(&mut self, connack: ConnackPacket, now: Instant) {
        if self.connection.state() != ConnectionState::WaitForConnack {
            error!("[{}] handle_connack - connack received in state {}", self.client_id, self.connection.state());
            self.on_transport_failure(SessionError::new_protocol_error("connack received outside of a connection attempt"));
            return;
        }

        if !connack.is_success() {
            error!("[{}] handle_connack - connection rejected with reason code {}", self.client_id, connack.reason_code);
            self.on_transport_failure(SessionError::new_connection_establishment_failure(format!("connack rejected with reason code {}", connack.reason_code)));
            return;
        }

        if let Err(error) = self.connection.accept_connack() {
            self.on_transport_failure(error);
            return;
        }

        self.connack_timeout_time = None;
        if self.network.last_sent.is_none() {
            self.network.record_sent(now);
        }

        if self.options.protocol_version.supports_properties() {
            if let Some(server_keep_alive) = connack.server_keep_alive {
                debug!("[{}] handle_connack - server overrides keep alive to {} seconds", self.client_id, server_keep_alive);
                self.keep_alive_interval_seconds = server_keep_alive;
            }

            if let Some(assigned_client_identifier) = connack.assigned_client_identifier {
                self.assigned_client_id = Some(assigned_client_identifier);
            }
        }

        if !self.options.clean_start {
            self.resend_ids = self.outbound.iter().filter(|message| message.queue_sequence.is_none()).map(|message| message.packet_id).collect();
            self.connect_sent = 0;

            for request in self.pending_requests.values_mut() {
                request.sent = false;
            }
        }

        info!("[{}] handle_connack - connection established, session present: {}, {} records to resend", self.client_id, connack.session_present, self.resend_ids.len());
        self.events.push(SessionEvent::ConnectionSuccess { session_present: connack.session_present });
    }

    fn handle_publish(&mut self, publish: InboundPublish, now: Instant) {
        let properties =
            if self.options.protocol_version.supports_properties() {
                publish.properties.clone()
            } else {
                MessageProperties::default()
            };

        match publish.qos {
            QualityOfService::AtMostOnce => {
                self.deliver(DeliveredMessage {
                    packet_id: 0,
                    qos: publish.qos,
                    retain: publish.retain,
                    publication: Publication::acquire(publish.topic.as_str(), publish.payload),
                    properties,
                });
            }
            QualityOfService::AtLeastOnce => {
                if publish.packet_id == 0 {
                    warn!("[{}] handle_publish - discarding qos 1 publish with a zero packet id", self.client_id);
                    return;
                }

                let packet_id = publish.packet_id;
                self.deliver(DeliveredMessage {
                    packet_id,
                    qos: publish.qos,
                    retain: publish.retain,
                    publication: Publication::acquire(publish.topic.as_str(), publish.payload),
                    properties,
                });

                self.pending_control.push_back(OutboundPacket::Puback(PubackPacket { packet_id, reason_code: 0 }));
            }
            QualityOfService::ExactlyOnce => {
                let packet_id = publish.packet_id;
                if packet_id == 0 {
                    warn!("[{}] handle_publish - discarding qos 2 publish with a zero packet id", self.client_id);
                    return;
                }

                if self.inbound.contains(packet_id) {
                    debug!("[{}] handle_publish - duplicate qos 2 publish for packet id {}, resending pubrec", self.client_id, packet_id);
                    self.pending_control.push_back(OutboundPacket::Pubrec(PubrecPacket { packet_id, reason_code: 0 }));
                    return;
                }

                let publication = Publication::acquire(publish.topic.as_str(), publish.payload.clone());
                let mut message = match InflightMessage::new_inbound(&publish, self.options.protocol_version, publication, now) {
                    Ok(message) => { message }
                    Err(error) => {
                        warn!("[{}] handle_publish - discarding qos 2 publish: {}", self.client_id, error);
                        return;
                    }
                };

                if let Err(error) = persist_message(&mut self.persistence, self.client_id.as_str(), &message) {
                    warn!("[{}] handle_publish - failed to persist inbound packet id {}, awaiting redelivery: {}", self.client_id, packet_id, error);
                    return;
                }

                let pubrec = message.transmit(now);
                if let Err(error) = self.inbound.insert(message) {
                    warn!("[{}] handle_publish - {}", self.client_id, error);
                    return;
                }

                self.pending_control.push_back(pubrec);
            }
        }
    }

    fn handle_pubrel(&mut self, pubrel: PubrelPacket, now: Instant) {
        let packet_id = pubrel.packet_id;
        self.pending_control.push_back(OutboundPacket::Pubcomp(PubcompPacket { packet_id, reason_code: 0 }));

        let Some(message) = self.inbound.get_mut(packet_id) else {
            warn!("[{}] handle_pubrel - no inbound record for packet id {}", self.client_id, packet_id);
            return;
        };

        if message.on_pubrel(now) != AckOutcome::Completed {
            warn!("[{}] handle_pubrel - pubrel does not apply to packet id {} in stage {}", self.client_id, packet_id, message.stage);
            return;
        }

        if let Some(message) = self.inbound.remove(packet_id) {
            self.remove_persisted(&message);
            self.deliver(DeliveredMessage {
                packet_id,
                qos: message.qos,
                retain: message.retain,
                publication: message.publication,
                properties: message.properties,
            });
        }
    }

    fn handle_puback(&mut self, puback: PubackPacket, now: Instant) {
        let Some(message) = self.outbound.get_mut(puback.packet_id) else {
            warn!("[{}] handle_puback - no outbound record for packet id {}", self.client_id, puback.packet_id);
            return;
        };

        match message.on_puback(now) {
            AckOutcome::Completed => {
                self.retire_outbound(puback.packet_id, puback.reason_code);
            }
            _ => {
                warn!("[{}] handle_puback - puback does not apply to packet id {} in stage {}", self.client_id, puback.packet_id, message.stage);
            }
        }
    }

    fn handle_pubrec(&mut self, pubrec: PubrecPacket, now: Instant) {
        let Some(message) = self.outbound.get_mut(pubrec.packet_id) else {
            warn!("[{}] handle_pubrec - no outbound record for packet id {}", self.client_id, pubrec.packet_id);
            return;
        };

        match message.on_pubrec(now) {
            AckOutcome::Advanced => {
                // an MQTT5 failure reason ends the exchange without a pubrel
                if message.protocol_version.supports_properties() && pubrec.reason_code >= 0x80 {
                    warn!("[{}] handle_pubrec - packet id {} rejected with reason code {}", self.client_id, pubrec.packet_id, pubrec.reason_code);
                    self.retire_outbound(pubrec.packet_id, pubrec.reason_code);
                }
            }
            _ => {
                debug!("[{}] handle_pubrec - ignoring pubrec for packet id {} in stage {}", self.client_id, pubrec.packet_id, message.stage);
            }
        }
    }

    fn handle_pubcomp(&mut self, pubcomp: PubcompPacket, now: Instant) {
        let Some(message) = self.outbound.get_mut(pubcomp.packet_id) else {
            warn!("[{}] handle_pubcomp - no outbound record for packet id {}", self.client_id, pubcomp.packet_id);
            return;
        };

        match message.on_pubcomp(now) {
            AckOutcome::Completed => {
                self.retire_outbound(pubcomp.packet_id, pubcomp.reason_code);
            }
            _ => {
                warn!("[{}] handle_pubcomp - pubcomp does not apply to packet id {} in stage {}", self.client_id, pubcomp.packet_id, message.stage);
            }
        }
    }

    fn retire_outbound(&mut self, packet_id: u16, reason_code: u8) {
        let Some(message) = self.outbound.remove(packet_id) else {
            return;
        };

        if let Some(sequence) = message.queue_sequence {
            self.queued_outbound.remove(sequence);
        }

        self.remove_persisted(&message);
        info!("[{}] retire_outbound - packet id {} complete", self.client_id, packet_id);

        self.events.push(SessionEvent::PublishComplete {
            packet_id,
            qos: message.qos,
            reason_code,
        });
    }

    fn complete_request(&mut self, packet_id: u16, request_type: PacketType, reason_codes: Vec<u8>) {
        match self.pending_requests.get(&packet_id) {
            Some(request) if request.packet.packet_type() == request_type => {}
            _ => {
                warn!("[{}] complete_request - no pending {} for packet id {}", self.client_id, request_type, packet_id);
                return;
            }
        }

        self.pending_requests.remove(&packet_id);
        let result = Ok(reason_codes);
        if request_type == PacketType::Subscribe {
            self.events.push(SessionEvent::SubscribeComplete { packet_id, result });
        } else {
            self.events.push(SessionEvent::UnsubscribeComplete { packet_id, result });
        }
    }

    fn fail_request(&mut self, packet_id: u16, error: SessionError) {
        if let Some(request) = self.pending_requests.remove(&packet_id) {
            if let OutboundPacket::Subscribe(_) = request.packet {
                self.events.push(SessionEvent::SubscribeComplete { packet_id, result: Err(error) });
            } else {
                self.events.push(SessionEvent::UnsubscribeComplete { packet_id, result: Err(error) });
            }
        }
    }

    fn deliver(&mut self, message: DeliveredMessage) {
        debug!("[{}] deliver - queueing message from \"{}\" for delivery", self.client_id, message.topic());
        self.undelivered.push(message);
    }

    fn remove_persisted(&mut self, message: &InflightMessage) {
        if let Some(persistence) = &mut self.persistence {
            if let Err(error) = persistence.remove_record(self.client_id.as_str(), message) {
                warn!("[{}] remove_persisted - {}", self.client_id, error);
            }
        }
    }

    fn build_connect_packet(&self) -> ConnectPacket {
        let session_expiry_interval_seconds =
            if self.options.protocol_version.supports_properties() {
                self.options.session_expiry_interval_seconds
            } else {
                None
            };

        ConnectPacket {
            protocol_version: self.options.protocol_version,
            client_id: self.client_id.clone(),
            username: self.options.username.clone(),
            password: self.options.password.clone(),
            clean_start: self.options.clean_start,
            keep_alive_interval_seconds: self.keep_alive_interval_seconds,
            session_expiry_interval_seconds,
            will: self.will.clone(),
        }
    }

    fn is_packet_id_bound(&self, packet_id: u16) -> bool {
        self.outbound.contains(packet_id) || self.pending_requests.contains_key(&packet_id)
    }

    fn acquire_free_packet_id(&mut self) -> SessionResult<u16> {
        let start_id = self.next_packet_id;
        let mut check_id = start_id;

        loop {
            if self.next_packet_id == u16::MAX {
                self.next_packet_id = 1;
            } else {
                self.next_packet_id += 1;
            }

            if !self.is_packet_id_bound(check_id) {
                return Ok(check_id);
            }

            if self.next_packet_id == start_id {
                error!("[{}] acquire_free_packet_id - could not find an unbound packet id", self.client_id);
                return Err(SessionError::new_packet_id_space_exhausted());
            }

            check_id = self.next_packet_id;
        }
    }
}

fn persist_message(persistence: &mut Option<SessionPersistence>, client_id: &str, message: &InflightMessage) -> SessionResult<()> {
    if let Some(persistence) = persistence {
        return persistence.write_record(client_id, message);
    }

    Ok(())
}

pub(crate) fn fold_timepoint(base: &Option<Instant>, new: &Instant) -> Option<Instant> {
    if let Some(base_timepoint) = &base {
        if base_timepoint < new {
            return *base;
        }
    }

    Some(*new)
}

pub(crate) fn fold_optional_timepoint_min(base: &Option<Instant>, new: &Option<Instant>) -> Option<Instant> {
    if let Some(base_timepoint) = base {
        if let Some(new_timepoint) = new {
            if base_timepoint < new_timepoint {
                return *base;
            } else {
                return *new;
            }
        }

        return *base;
    }

    *new
}

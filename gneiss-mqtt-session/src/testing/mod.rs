/*
 * Copyright Bret Ambrose. All Rights Reserved.
 * SPDX-License-Identifier: Apache-2.0.
 */

use crate::config::*;
use crate::error::{SessionError, SessionResult};
use crate::mqtt::*;
use crate::network::*;
use crate::packet::*;
use crate::persistence::{PersistenceError, PersistenceStore};
use crate::session::*;

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Instant;
use uuid::Uuid;

pub(crate) fn random_client_id() -> String {
    format!("test-client-{}", Uuid::new_v4())
}

pub(crate) fn build_session_options(protocol_version: ProtocolVersion, clean_start: bool) -> SessionOptionsBuilder {
    SessionOptionsBuilder::new(random_client_id().as_str(), "localhost", 1883)
        .with_protocol_version(protocol_version)
        .with_clean_start(clean_start)
}

/// Walks a plain TCP session from idle to connected.  Returns the Connect packet that was written.
pub(crate) fn connect_session(session: &mut ClientSession, session_present: bool, now: Instant) -> ConnectPacket {
    session.connect().unwrap();
    session.begin_connect(now).unwrap();
    session.bind_socket(SocketId(1));
    session.on_transport_event(TransportEvent::TcpConnected);

    let packets = session.service(now, usize::MAX);
    assert_eq!(1, packets.len());
    let OutboundPacket::Connect(connect) = packets.into_iter().next().unwrap() else {
        panic!("expected a connect packet");
    };

    session.handle_packet(InboundPacket::Connack(ConnackPacket {
        session_present,
        ..Default::default()
    }), now);

    assert!(session.is_connected());
    connect
}

/// Simulates an unrecoverable socket error and completes the teardown
pub(crate) fn drop_connection(session: &mut ClientSession) {
    session.on_transport_event(TransportEvent::Failed(SessionError::new_transport_failure("connection reset by peer")));
    assert!(session.needs_teardown());
    session.finish_teardown();
}

#[derive(Default)]
struct MemoryStoreState {
    records: BTreeMap<String, Vec<u8>>,
    fail_writes: bool,
}

/// An in-memory persistence store.  Clones share the same records.
#[derive(Clone, Default)]
pub(crate) struct MemoryStore {
    state: Arc<Mutex<MemoryStoreState>>,
}

impl MemoryStore {
    pub(crate) fn new() -> Self {
        MemoryStore::default()
    }

    pub(crate) fn insert(&self, key: &str, record: Vec<u8>) {
        self.state.lock().unwrap().records.insert(key.to_string(), record);
    }

    pub(crate) fn contains(&self, key: &str) -> bool {
        self.state.lock().unwrap().records.contains_key(key)
    }

    pub(crate) fn get_record(&self, key: &str) -> Option<Vec<u8>> {
        self.state.lock().unwrap().records.get(key).cloned()
    }

    pub(crate) fn len(&self) -> usize {
        self.state.lock().unwrap().records.len()
    }

    pub(crate) fn set_fail_writes(&self, fail_writes: bool) {
        self.state.lock().unwrap().fail_writes = fail_writes;
    }
}

impl PersistenceStore for MemoryStore {
    fn put(&mut self, key: &str, record: Vec<u8>) -> Result<(), PersistenceError> {
        let mut state = self.state.lock().unwrap();
        if state.fail_writes {
            return Err("simulated write failure".into());
        }

        state.records.insert(key.to_string(), record);
        Ok(())
    }

    fn get(&mut self, key: &str) -> Result<Option<Vec<u8>>, PersistenceError> {
        Ok(self.state.lock().unwrap().records.get(key).cloned())
    }

    fn delete(&mut self, key: &str) -> Result<(), PersistenceError> {
        self.state.lock().unwrap().records.remove(key);
        Ok(())
    }

    fn keys(&mut self) -> Result<Vec<String>, PersistenceError> {
        Ok(self.state.lock().unwrap().records.keys().cloned().collect())
    }
}

#[derive(Default)]
struct ScriptedTransportState {
    next_socket: u64,
    auto_establish: bool,
    fail_opens: bool,
    open_requests: Vec<OpenRequest>,
    proxy_requests: Vec<Vec<u8>>,
    events: VecDeque<(SocketId, TransportEvent)>,
    incoming: HashMap<SocketId, Vec<u8>>,
    written: HashMap<SocketId, usize>,
    send_failures: HashMap<SocketId, String>,

    // remaining bytes a socket accepts before sends would block; absent means unlimited
    send_capacity: HashMap<SocketId, usize>,
    closed: Vec<SocketId>,
}

/// A transport whose sockets are scripted by the test.  Clones share the same state.
#[derive(Clone)]
pub(crate) struct ScriptedTransport {
    state: Arc<Mutex<ScriptedTransportState>>,
}

impl ScriptedTransport {

    /// With `auto_establish`, every open immediately queues the events that complete the
    /// configured establishment stages.
    pub(crate) fn new(auto_establish: bool) -> Self {
        let state = ScriptedTransportState {
            next_socket: 1,
            auto_establish,
            ..Default::default()
        };

        ScriptedTransport {
            state: Arc::new(Mutex::new(state)),
        }
    }

    pub(crate) fn queue_event(&self, socket: SocketId, event: TransportEvent) {
        self.state.lock().unwrap().events.push_back((socket, event));
    }

    pub(crate) fn queue_incoming(&self, socket: SocketId, bytes: &[u8]) {
        self.state.lock().unwrap().incoming.entry(socket).or_default().extend_from_slice(bytes);
    }

    pub(crate) fn fail_sends(&self, socket: SocketId, reason: &str) {
        self.state.lock().unwrap().send_failures.insert(socket, reason.to_string());
    }

    /// Limits how many more bytes `socket` accepts before sends would block.  `None` lifts the limit.
    pub(crate) fn set_send_capacity(&self, socket: SocketId, capacity: Option<usize>) {
        let mut state = self.state.lock().unwrap();
        match capacity {
            Some(capacity) => { state.send_capacity.insert(socket, capacity); }
            None => { state.send_capacity.remove(&socket); }
        }
    }

    pub(crate) fn set_fail_opens(&self, fail_opens: bool) {
        self.state.lock().unwrap().fail_opens = fail_opens;
    }

    pub(crate) fn open_requests(&self) -> Vec<OpenRequest> {
        self.state.lock().unwrap().open_requests.clone()
    }

    pub(crate) fn proxy_requests(&self) -> Vec<Vec<u8>> {
        self.state.lock().unwrap().proxy_requests.clone()
    }

    pub(crate) fn closed_sockets(&self) -> Vec<SocketId> {
        self.state.lock().unwrap().closed.clone()
    }

    pub(crate) fn bytes_written(&self, socket: SocketId) -> usize {
        self.state.lock().unwrap().written.get(&socket).copied().unwrap_or(0)
    }
}

impl Transport for ScriptedTransport {
    fn open(&mut self, request: &OpenRequest) -> SessionResult<SocketId> {
        let mut state = self.state.lock().unwrap();
        if state.fail_opens {
            return Err(SessionError::new_transport_failure("connection refused"));
        }

        let socket = SocketId(state.next_socket);
        state.next_socket += 1;
        state.open_requests.push(request.clone());

        if state.auto_establish {
            if let Some(proxy) = &request.proxy {
                state.proxy_requests.push(build_proxy_connect_request(&request.broker, proxy));
                let response = b"HTTP/1.1 200 Connection established\r\n\r\n";
                if let Ok(ProxyConnectStatus::Established(_)) = parse_proxy_connect_response(response) {
                    state.events.push_back((socket, TransportEvent::ProxyConnected));
                }
            }

            state.events.push_back((socket, TransportEvent::TcpConnected));
            if request.tls {
                let tls_session = TlsSession { data: vec![socket.0 as u8] };
                state.events.push_back((socket, TransportEvent::TlsEstablished(Some(tls_session))));
            }

            if request.websocket {
                state.events.push_back((socket, TransportEvent::WebsocketUpgraded(format!("websocket-key-{}", socket.0))));
            }
        }

        Ok(socket)
    }

    fn poll(&mut self) -> Vec<(SocketId, TransportEvent)> {
        let mut state = self.state.lock().unwrap();
        let mut events : Vec<(SocketId, TransportEvent)> = state.events.drain(..).collect();

        let readable : Vec<SocketId> = state.incoming.iter().filter(|(_, bytes)| !bytes.is_empty()).map(|(socket, _)| *socket).collect();
        for socket in readable {
            events.push((socket, TransportEvent::Readable));
        }

        events
    }

    fn send(&mut self, socket: SocketId, bytes: &[u8]) -> SessionResult<usize> {
        let mut state = self.state.lock().unwrap();
        if let Some(reason) = state.send_failures.get(&socket) {
            return Err(SessionError::new_transport_failure(reason.clone()));
        }

        let mut accepted = bytes.len();
        if let Some(capacity) = state.send_capacity.get_mut(&socket) {
            accepted = accepted.min(*capacity);
            *capacity -= accepted;
        }

        *state.written.entry(socket).or_default() += accepted;
        Ok(accepted)
    }

    fn receive(&mut self, socket: SocketId, buffer: &mut Vec<u8>) -> SessionResult<usize> {
        let mut state = self.state.lock().unwrap();
        let bytes = state.incoming.remove(&socket).unwrap_or_default();
        buffer.extend_from_slice(&bytes);
        Ok(bytes.len())
    }

    fn close(&mut self, socket: SocketId) {
        let mut state = self.state.lock().unwrap();
        state.incoming.remove(&socket);
        state.closed.push(socket);
    }
}

/// What the scripted codec saw for each encoded packet
#[derive(Clone, Debug, Eq, PartialEq)]
pub(crate) struct RecordedPacket {
    pub(crate) packet_type: PacketType,
    pub(crate) packet_id: Option<u16>,
    pub(crate) duplicate: bool,
}

#[derive(Default)]
struct ScriptedCodecState {
    encoded: Vec<RecordedPacket>,
    inbound: VecDeque<InboundPacket>,
    fail_decode: bool,
}

/// A codec that encodes every packet as a single byte and decodes each incoming byte into the
/// next scripted inbound packet.  Clones share the same state.
#[derive(Clone, Default)]
pub(crate) struct ScriptedCodec {
    state: Arc<Mutex<ScriptedCodecState>>,
}

impl ScriptedCodec {
    pub(crate) fn new() -> Self {
        ScriptedCodec::default()
    }

    /// Queues a packet to be decoded; the matching byte must be delivered through the transport
    pub(crate) fn queue_inbound(&self, packet: InboundPacket) {
        self.state.lock().unwrap().inbound.push_back(packet);
    }

    pub(crate) fn set_fail_decode(&self, fail_decode: bool) {
        self.state.lock().unwrap().fail_decode = fail_decode;
    }

    pub(crate) fn encoded(&self) -> Vec<RecordedPacket> {
        self.state.lock().unwrap().encoded.clone()
    }

    pub(crate) fn take_encoded(&self) -> Vec<RecordedPacket> {
        std::mem::take(&mut self.state.lock().unwrap().encoded)
    }
}

impl PacketCodec for ScriptedCodec {
    fn encode(&mut self, packet: &OutboundPacket, _: ProtocolVersion, buffer: &mut Vec<u8>) -> SessionResult<()> {
        let duplicate = match packet {
            OutboundPacket::Publish(publish) => { publish.duplicate }
            _ => { false }
        };

        self.state.lock().unwrap().encoded.push(RecordedPacket {
            packet_type: packet.packet_type(),
            packet_id: packet.packet_id(),
            duplicate,
        });

        buffer.push(0);
        Ok(())
    }

    fn decode(&mut self, bytes: &[u8], _: ProtocolVersion) -> SessionResult<DecodeResult> {
        let mut state = self.state.lock().unwrap();
        if state.fail_decode {
            return Err(SessionError::new_decoding_failure("malformed packet"));
        }

        if bytes.is_empty() {
            return Ok(DecodeResult::Incomplete);
        }

        match state.inbound.pop_front() {
            Some(packet) => { Ok(DecodeResult::Packet(packet, 1)) }
            None => { Ok(DecodeResult::Incomplete) }
        }
    }
}

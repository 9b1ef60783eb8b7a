/*
 * Copyright Bret Ambrose. All Rights Reserved.
 * SPDX-License-Identifier: Apache-2.0.
 */

/*!
Transport-facing state and the collaborator contracts the session consumes.

The socket, TLS, and websocket implementations live outside this crate.  They are reached
through the [`Transport`] and [`PacketCodec`] traits; the session only keeps the bookkeeping
that feeds its own timers and state machine in a [`NetworkHandle`].
 */

use crate::config::HttpProxyOptions;
use crate::error::{SessionError, SessionResult};
use crate::mqtt::ProtocolVersion;
use crate::packet::{InboundPacket, OutboundPacket};

use log::*;
use std::fmt;
use std::time::Instant;

/// Host and port of a network peer
#[derive(Clone, Debug, Eq, PartialEq, Hash)]
pub struct Endpoint {
    pub(crate) endpoint: String,
    pub(crate) port: u16,
}

impl Endpoint {
    pub fn new(endpoint: &str, port: u16) -> Self {
        Endpoint {
            endpoint: endpoint.to_string(),
            port,
        }
    }

    pub fn endpoint(&self) -> &str {
        self.endpoint.as_str()
    }

    pub fn port(&self) -> u16 {
        self.port
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.endpoint, self.port)
    }
}

/// Opaque handle to a transport connection, assigned by the transport collaborator
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash, PartialOrd, Ord)]
pub struct SocketId(pub u64);

impl fmt::Display for SocketId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "socket-{}", self.0)
    }
}

/// Opaque TLS session state (e.g. resumption data) handed back by the transport
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct TlsSession {
    pub data: Vec<u8>,
}

/// Everything the transport needs to open a connection for a session
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct OpenRequest {
    pub broker: Endpoint,
    pub proxy: Option<HttpProxyOptions>,
    pub tls: bool,

    // reused to resume a previous TLS session, if the transport supports it
    pub tls_session: Option<TlsSession>,
    pub websocket: bool,
    pub http_headers: Vec<(String, String)>,
}

/// Progress and readiness notifications produced by the transport
#[derive(Debug)]
pub enum TransportEvent {

    /// The proxy accepted the CONNECT tunnel request
    ProxyConnected,

    TcpConnected,

    TlsEstablished(Option<TlsSession>),

    /// The websocket upgrade completed; carries the Sec-WebSocket-Key that was used
    WebsocketUpgraded(String),

    /// Incoming bytes can be read
    Readable,

    /// The connection failed or was closed by the peer
    Failed(SessionError),
}

impl fmt::Display for TransportEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransportEvent::ProxyConnected => { write!(f, "ProxyConnected") }
            TransportEvent::TcpConnected => { write!(f, "TcpConnected") }
            TransportEvent::TlsEstablished(_) => { write!(f, "TlsEstablished") }
            TransportEvent::WebsocketUpgraded(_) => { write!(f, "WebsocketUpgraded") }
            TransportEvent::Readable => { write!(f, "Readable") }
            TransportEvent::Failed(error) => { write!(f, "Failed({})", error) }
        }
    }
}

/// Socket/TLS/websocket collaborator.  All calls are non-blocking.
pub trait Transport {

    /// Begins opening a connection.  Progress is reported through [`Transport::poll`].
    fn open(&mut self, request: &OpenRequest) -> SessionResult<SocketId>;

    /// Returns every event that occurred since the last poll
    fn poll(&mut self) -> Vec<(SocketId, TransportEvent)>;

    /// Writes as many bytes as the connection accepts; zero means the write would block
    fn send(&mut self, socket: SocketId, bytes: &[u8]) -> SessionResult<usize>;

    /// Appends available bytes to the buffer; zero means the read would block
    fn receive(&mut self, socket: SocketId, buffer: &mut Vec<u8>) -> SessionResult<usize>;

    fn close(&mut self, socket: SocketId);
}

/// Result of attempting to decode one packet from buffered bytes
#[derive(Debug, Eq, PartialEq)]
pub enum DecodeResult {

    /// More bytes are needed
    Incomplete,

    /// A packet and the number of bytes it consumed
    Packet(InboundPacket, usize),
}

/// Byte-level MQTT encoder/decoder collaborator
pub trait PacketCodec {
    fn encode(&mut self, packet: &OutboundPacket, protocol_version: ProtocolVersion, buffer: &mut Vec<u8>) -> SessionResult<()>;

    fn decode(&mut self, bytes: &[u8], protocol_version: ProtocolVersion) -> SessionResult<DecodeResult>;
}

/// Transport bookkeeping owned by one session
#[derive(Debug, Default)]
pub struct NetworkHandle {
    pub(crate) socket: Option<SocketId>,
    pub(crate) last_sent: Option<Instant>,
    pub(crate) last_received: Option<Instant>,
    pub(crate) last_ping: Option<Instant>,
    pub(crate) tls_session: Option<TlsSession>,
    pub(crate) proxy: Option<HttpProxyOptions>,
    pub(crate) websocket: bool,
    pub(crate) websocket_key: Option<String>,
    pub(crate) http_headers: Vec<(String, String)>,
}

impl NetworkHandle {
    pub(crate) fn new() -> Self {
        NetworkHandle::default()
    }

    pub fn socket(&self) -> Option<SocketId> {
        self.socket
    }

    pub fn last_sent(&self) -> Option<Instant> {
        self.last_sent
    }

    pub fn last_received(&self) -> Option<Instant> {
        self.last_received
    }

    pub fn last_ping(&self) -> Option<Instant> {
        self.last_ping
    }

    pub fn tls_session(&self) -> Option<&TlsSession> {
        self.tls_session.as_ref()
    }

    pub fn proxy(&self) -> Option<&HttpProxyOptions> {
        self.proxy.as_ref()
    }

    /// True once the websocket upgrade of the current connection has completed
    pub fn is_websocket_upgraded(&self) -> bool {
        self.websocket
    }

    pub fn websocket_key(&self) -> Option<&str> {
        self.websocket_key.as_deref()
    }

    pub fn http_headers(&self) -> &[(String, String)] {
        self.http_headers.as_slice()
    }

    /// Resets per-connection state for a new attempt.  TLS session data is kept for resumption.
    pub(crate) fn prepare(&mut self, proxy: Option<HttpProxyOptions>, http_headers: Vec<(String, String)>) {
        self.socket = None;
        self.last_sent = None;
        self.last_received = None;
        self.last_ping = None;
        self.proxy = proxy;
        self.websocket = false;
        self.websocket_key = None;
        self.http_headers = http_headers;
    }

    pub(crate) fn bind_socket(&mut self, socket: SocketId) {
        self.socket = Some(socket);
    }

    pub(crate) fn release_socket(&mut self) -> Option<SocketId> {
        self.websocket = false;
        self.socket.take()
    }

    pub(crate) fn record_sent(&mut self, now: Instant) {
        self.last_sent = Some(now);
    }

    pub(crate) fn record_received(&mut self, now: Instant) {
        self.last_received = Some(now);
    }

    pub(crate) fn record_ping(&mut self, now: Instant) {
        self.last_ping = Some(now);
        self.last_sent = Some(now);
    }
}

/// Builds the HTTP CONNECT request that asks a proxy to tunnel to the broker
pub fn build_proxy_connect_request(broker: &Endpoint, proxy: &HttpProxyOptions) -> Vec<u8> {
    let mut request_as_string = format!("CONNECT {}:{} HTTP/1.1\r\nHost: {}:{}\r\nConnection: keep-alive\r\n", broker.endpoint, broker.port, broker.endpoint, broker.port);
    if let Some(authorization) = &proxy.authorization {
        request_as_string.push_str(format!("Proxy-Authorization: {}\r\n", authorization).as_str());
    }
    request_as_string.push_str("\r\n");

    request_as_string.into_bytes()
}

/// Outcome of parsing a proxy's response to a CONNECT request
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum ProxyConnectStatus {

    /// The response has not been fully received
    Partial,

    /// The tunnel is open; the value is the number of response bytes consumed
    Established(usize),
}

/// Parses a proxy's response to a CONNECT request.  Any non-2xx status fails the attempt.
pub fn parse_proxy_connect_response(response_bytes: &[u8]) -> SessionResult<ProxyConnectStatus> {
    let mut headers = [httparse::EMPTY_HEADER; 32];
    let mut response = httparse::Response::new(&mut headers);

    let parse_result = response.parse(response_bytes);
    match parse_result {
        Err(e) => {
            error!("parse_proxy_connect_response - failed to parse proxy response to CONNECT request: {:?}", e);
            Err(SessionError::from(e))
        }
        Ok(httparse::Status::Complete(bytes_parsed)) => {
            if let Some(response_code) = response.code {
                if (200..300).contains(&response_code) {
                    return Ok(ProxyConnectStatus::Established(bytes_parsed));
                }
            }

            error!("parse_proxy_connect_response - CONNECT request was failed, with http code: {:?}", response.code);
            Err(SessionError::new_connection_establishment_failure("proxy connect request unsuccessful"))
        }
        Ok(httparse::Status::Partial) => {
            Ok(ProxyConnectStatus::Partial)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::HttpProxyOptionsBuilder;
    use assert_matches::assert_matches;

    #[test]
    fn proxy_connect_request_format() {
        let proxy = HttpProxyOptionsBuilder::new("proxy", 3128).build();
        let request = build_proxy_connect_request(&Endpoint::new("broker.example.com", 8883), &proxy);

        assert_eq!("CONNECT broker.example.com:8883 HTTP/1.1\r\nHost: broker.example.com:8883\r\nConnection: keep-alive\r\n\r\n".as_bytes(), request.as_slice());
    }

    #[test]
    fn proxy_connect_request_with_authorization() {
        let proxy = HttpProxyOptionsBuilder::new("proxy", 3128).with_authorization("Basic dXNlcjpwYXNz").build();
        let request = String::from_utf8(build_proxy_connect_request(&Endpoint::new("broker", 1883), &proxy)).unwrap();

        assert!(request.starts_with("CONNECT broker:1883 HTTP/1.1\r\n"));
        assert!(request.contains("Proxy-Authorization: Basic dXNlcjpwYXNz\r\n"));
        assert!(request.ends_with("\r\n\r\n"));
    }

    #[test]
    fn proxy_connect_response_parsing() {
        assert_eq!(ProxyConnectStatus::Partial, parse_proxy_connect_response("HTTP/1.1 200 Connection established\r\n".as_bytes()).unwrap());

        let complete = "HTTP/1.1 200 Connection established\r\n\r\n";
        assert_eq!(ProxyConnectStatus::Established(complete.len()), parse_proxy_connect_response(complete.as_bytes()).unwrap());

        assert_matches!(parse_proxy_connect_response("HTTP/1.1 407 Proxy Authentication Required\r\n\r\n".as_bytes()), Err(SessionError::ConnectionEstablishmentFailure(_)));
        assert_matches!(parse_proxy_connect_response("garbage\r\n\r\n".as_bytes()), Err(SessionError::ConnectionEstablishmentFailure(_)));
    }

    #[test]
    fn network_handle_lifecycle() {
        let now = Instant::now();
        let mut handle = NetworkHandle::new();
        handle.tls_session = Some(TlsSession { data: vec![1, 2] });

        handle.prepare(None, vec![("x-header".to_string(), "value".to_string())]);
        handle.bind_socket(SocketId(3));
        handle.websocket = true;
        handle.record_sent(now);
        handle.record_received(now);
        handle.record_ping(now);

        assert_eq!(Some(SocketId(3)), handle.socket());
        assert_eq!(Some(now), handle.last_ping());
        assert_eq!(Some(now), handle.last_sent());
        assert_eq!(1, handle.http_headers().len());

        assert_eq!(Some(SocketId(3)), handle.release_socket());
        assert_eq!(None, handle.socket());
        assert!(!handle.is_websocket_upgraded());
        assert!(handle.tls_session().is_some());
    }
}

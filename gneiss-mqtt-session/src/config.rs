/*
 * Copyright Bret Ambrose. All Rights Reserved.
 * SPDX-License-Identifier: Apache-2.0.
 */

/*!
Module containing types for configuring a client session.
 */

use crate::mqtt::ProtocolVersion;
use crate::network::Endpoint;
use crate::will::WillMessage;

use std::time::Duration;

const DEFAULT_KEEP_ALIVE_SECONDS : u16 = 60;
const DEFAULT_RETRY_INTERVAL : Duration = Duration::from_secs(20);
const DEFAULT_MAX_INFLIGHT_MESSAGES : usize = 10;
const DEFAULT_CONNECT_TIMEOUT : Duration = Duration::from_secs(30);
const DEFAULT_PING_TIMEOUT : Duration = Duration::from_secs(10);

// reconnect periods above a day are clamped so that backoff deadlines stay representable
const MAX_RECONNECT_PERIOD_CEILING : Duration = Duration::from_secs(24 * 60 * 60);

/// Controls what happens when a QoS 1+ publish is submitted while the session already tracks
/// its maximum number of unacknowledged publishes.
#[derive(Debug, Default, Clone, Copy, Eq, PartialEq)]
pub enum BackpressurePolicy {

    /// Fail the publish immediately with an InflightLimitReached error
    #[default]
    FailFast,

    /// Block the publishing thread until capacity frees up.  A timeout bounds the wait; the
    /// publish then fails with InflightLimitReached.  A disconnect request releases every
    /// blocked publisher with a UserInitiatedDisconnect error.
    Block {
        timeout: Option<Duration>
    },
}

/// Controls how reconnect delays are randomized
#[derive(Debug, Default, Clone, Copy, Eq, PartialEq)]
pub enum ExponentialBackoffJitterType {

    /// The full backoff period is waited
    None,

    /// The delay is picked uniformly from [0, backoff period)
    #[default]
    Uniform
}

/// Reconnect behavior after a connection is lost or an attempt fails
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct ReconnectOptions {
    pub(crate) automatic: bool,
    pub(crate) reconnect_period_jitter: ExponentialBackoffJitterType,
    pub(crate) base_reconnect_period: Duration,
    pub(crate) max_reconnect_period: Duration,
    pub(crate) reconnect_stability_reset_period: Duration,
}

impl ReconnectOptions {
    pub(crate) fn normalize(&mut self) {
        if self.base_reconnect_period > self.max_reconnect_period {
            std::mem::swap(&mut self.base_reconnect_period, &mut self.max_reconnect_period)
        }

        if self.max_reconnect_period < Duration::from_secs(1) {
            self.max_reconnect_period = Duration::from_secs(1);
        }

        self.base_reconnect_period = self.base_reconnect_period.min(MAX_RECONNECT_PERIOD_CEILING);
        self.max_reconnect_period = self.max_reconnect_period.min(MAX_RECONNECT_PERIOD_CEILING);
    }
}

impl Default for ReconnectOptions {
    fn default() -> Self {
        ReconnectOptions {
            automatic: true,
            reconnect_period_jitter: ExponentialBackoffJitterType::default(),
            base_reconnect_period: Duration::from_secs(1),
            max_reconnect_period: Duration::from_secs(120),
            reconnect_stability_reset_period: Duration::from_secs(30),
        }
    }
}

/// Configuration for tunneling a connection through an HTTP proxy with a CONNECT request
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct HttpProxyOptions {
    pub(crate) endpoint: Endpoint,

    // pre-encoded Proxy-Authorization header value
    pub(crate) authorization: Option<String>,
}

impl HttpProxyOptions {
    pub fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }

    pub fn authorization(&self) -> Option<&str> {
        self.authorization.as_deref()
    }
}

/// Builder type for constructing HTTP-proxy-related configuration.
pub struct HttpProxyOptionsBuilder {
    options: HttpProxyOptions
}

impl HttpProxyOptionsBuilder {

    /// Creates a new builder object
    pub fn new(endpoint: &str, port: u16) -> Self {
        HttpProxyOptionsBuilder {
            options: HttpProxyOptions {
                endpoint: Endpoint::new(endpoint, port),
                authorization: None,
            }
        }
    }

    /// Sets the value of the Proxy-Authorization header sent with the CONNECT request
    /// (for example "Basic dXNlcjpwYXNz").
    pub fn with_authorization(mut self, authorization: &str) -> Self {
        self.options.authorization = Some(authorization.to_string());
        self
    }

    /// Creates a new set of HTTP proxy options
    pub fn build(self) -> HttpProxyOptions {
        self.options
    }
}

/// Configuration for a single client session
#[derive(Clone, Debug)]
pub struct SessionOptions {
    pub(crate) client_id: String,
    pub(crate) endpoint: Endpoint,
    pub(crate) username: Option<String>,
    pub(crate) password: Option<Vec<u8>>,
    pub(crate) clean_start: bool,
    pub(crate) protocol_version: ProtocolVersion,
    pub(crate) keep_alive_interval_seconds: u16,
    pub(crate) retry_interval: Duration,
    pub(crate) max_inflight_messages: usize,
    pub(crate) backpressure_policy: BackpressurePolicy,
    pub(crate) session_expiry_interval_seconds: Option<u32>,
    pub(crate) will: Option<WillMessage>,
    pub(crate) http_proxy: Option<HttpProxyOptions>,
    pub(crate) https_proxy: Option<HttpProxyOptions>,
    pub(crate) tls: bool,
    pub(crate) websocket: bool,
    pub(crate) http_headers: Vec<(String, String)>,
    pub(crate) connect_timeout: Duration,
    pub(crate) ping_timeout: Duration,
    pub(crate) reconnect_options: ReconnectOptions,
}

impl SessionOptions {
    pub fn client_id(&self) -> &str {
        self.client_id.as_str()
    }

    pub fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }

    pub fn clean_start(&self) -> bool {
        self.clean_start
    }

    pub fn protocol_version(&self) -> ProtocolVersion {
        self.protocol_version
    }

    pub fn max_inflight_messages(&self) -> usize {
        self.max_inflight_messages
    }

    pub fn backpressure_policy(&self) -> BackpressurePolicy {
        self.backpressure_policy
    }

    pub fn reconnect_options(&self) -> &ReconnectOptions {
        &self.reconnect_options
    }

    /// The proxy a connection attempt tunnels through; HTTPS proxy settings win over HTTP ones
    /// when the broker connection uses TLS.
    pub(crate) fn proxy(&self) -> Option<&HttpProxyOptions> {
        if self.tls && self.https_proxy.is_some() {
            return self.https_proxy.as_ref();
        }

        self.http_proxy.as_ref().or(self.https_proxy.as_ref())
    }
}

/// Builder type for SessionOptions
#[derive(Debug)]
pub struct SessionOptionsBuilder {
    options: SessionOptions
}

impl SessionOptionsBuilder {

    /// Creates a new builder for a session with the given client id that connects to the
    /// given broker
    pub fn new(client_id: &str, endpoint: &str, port: u16) -> Self {
        SessionOptionsBuilder {
            options: SessionOptions {
                client_id: client_id.to_string(),
                endpoint: Endpoint::new(endpoint, port),
                username: None,
                password: None,
                clean_start: true,
                protocol_version: ProtocolVersion::default(),
                keep_alive_interval_seconds: DEFAULT_KEEP_ALIVE_SECONDS,
                retry_interval: DEFAULT_RETRY_INTERVAL,
                max_inflight_messages: DEFAULT_MAX_INFLIGHT_MESSAGES,
                backpressure_policy: BackpressurePolicy::default(),
                session_expiry_interval_seconds: None,
                will: None,
                http_proxy: None,
                https_proxy: None,
                tls: false,
                websocket: false,
                http_headers: Vec::new(),
                connect_timeout: DEFAULT_CONNECT_TIMEOUT,
                ping_timeout: DEFAULT_PING_TIMEOUT,
                reconnect_options: ReconnectOptions::default(),
            }
        }
    }

    pub fn with_username(mut self, username: &str) -> Self {
        self.options.username = Some(username.to_string());
        self
    }

    pub fn with_password(mut self, password: &[u8]) -> Self {
        self.options.password = Some(password.to_vec());
        self
    }

    /// Clean start (MQTT5) or clean session (3.x).  When false, in-flight state survives
    /// reconnects and is resent once the new connection is established.
    pub fn with_clean_start(mut self, clean_start: bool) -> Self {
        self.options.clean_start = clean_start;
        self
    }

    pub fn with_protocol_version(mut self, protocol_version: ProtocolVersion) -> Self {
        self.options.protocol_version = protocol_version;
        self
    }

    /// Zero disables keep alive pings
    pub fn with_keep_alive_interval_seconds(mut self, keep_alive: u16) -> Self {
        self.options.keep_alive_interval_seconds = keep_alive;
        self
    }

    /// How long an in-flight record may go without progress before its last unacknowledged
    /// packet is resent.  Zero disables time-based retry.
    pub fn with_retry_interval(mut self, retry_interval: Duration) -> Self {
        self.options.retry_interval = retry_interval;
        self
    }

    pub fn with_max_inflight_messages(mut self, max_inflight_messages: usize) -> Self {
        self.options.max_inflight_messages = max_inflight_messages;
        self
    }

    pub fn with_backpressure_policy(mut self, policy: BackpressurePolicy) -> Self {
        self.options.backpressure_policy = policy;
        self
    }

    pub fn with_session_expiry_interval_seconds(mut self, session_expiry_interval_seconds: u32) -> Self {
        self.options.session_expiry_interval_seconds = Some(session_expiry_interval_seconds);
        self
    }

    pub fn with_will(mut self, will: WillMessage) -> Self {
        self.options.will = Some(will);
        self
    }

    pub fn with_http_proxy_options(mut self, http_proxy_options: HttpProxyOptions) -> Self {
        self.options.http_proxy = Some(http_proxy_options);
        self
    }

    pub fn with_https_proxy_options(mut self, https_proxy_options: HttpProxyOptions) -> Self {
        self.options.https_proxy = Some(https_proxy_options);
        self
    }

    pub fn with_tls(mut self, tls: bool) -> Self {
        self.options.tls = tls;
        self
    }

    pub fn with_websocket(mut self, websocket: bool) -> Self {
        self.options.websocket = websocket;
        self
    }

    /// Adds a header to the websocket upgrade request
    pub fn with_http_header(mut self, name: &str, value: &str) -> Self {
        self.options.http_headers.push((name.to_string(), value.to_string()));
        self
    }

    /// Upper bound on the time between starting a connection attempt and receiving a CONNACK
    pub fn with_connect_timeout(mut self, connect_timeout: Duration) -> Self {
        self.options.connect_timeout = connect_timeout;
        self
    }

    pub fn with_ping_timeout(mut self, ping_timeout: Duration) -> Self {
        self.options.ping_timeout = ping_timeout;
        self
    }

    pub fn with_automatic_reconnect(mut self, automatic: bool) -> Self {
        self.options.reconnect_options.automatic = automatic;
        self
    }

    pub fn with_reconnect_period_jitter(mut self, reconnect_period_jitter: ExponentialBackoffJitterType) -> Self {
        self.options.reconnect_options.reconnect_period_jitter = reconnect_period_jitter;
        self
    }

    pub fn with_base_reconnect_period(mut self, base_reconnect_period: Duration) -> Self {
        self.options.reconnect_options.base_reconnect_period = base_reconnect_period;
        self
    }

    pub fn with_max_reconnect_period(mut self, max_reconnect_period: Duration) -> Self {
        self.options.reconnect_options.max_reconnect_period = max_reconnect_period;
        self
    }

    pub fn with_reconnect_stability_reset_period(mut self, reconnect_stability_reset_period: Duration) -> Self {
        self.options.reconnect_options.reconnect_stability_reset_period = reconnect_stability_reset_period;
        self
    }

    pub fn build(self) -> SessionOptions {
        let mut options = self.options;
        options.reconnect_options.normalize();
        if options.max_inflight_messages == 0 {
            options.max_inflight_messages = 1;
        }

        options
    }
}

/// Options for an application-requested disconnect
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct DisconnectOptions {
    pub(crate) reason_code: u8,
    pub(crate) session_expiry_interval_seconds: Option<u32>,
    pub(crate) end_session: bool,
}

impl DisconnectOptions {
    pub fn reason_code(&self) -> u8 {
        self.reason_code
    }

    pub fn session_expiry_interval_seconds(&self) -> Option<u32> {
        self.session_expiry_interval_seconds
    }

    pub fn end_session(&self) -> bool {
        self.end_session
    }
}

/// Builder type for DisconnectOptions
#[derive(Default)]
pub struct DisconnectOptionsBuilder {
    options: DisconnectOptions
}

impl DisconnectOptionsBuilder {
    pub fn new() -> Self {
        DisconnectOptionsBuilder {
            ..Default::default()
        }
    }

    /// Reason code carried by the Disconnect packet (MQTT5)
    pub fn with_reason_code(mut self, reason_code: u8) -> Self {
        self.options.reason_code = reason_code;
        self
    }

    /// Overrides the session expiry interval when the connection closes (MQTT5)
    pub fn with_session_expiry_interval_seconds(mut self, session_expiry_interval_seconds: u32) -> Self {
        self.options.session_expiry_interval_seconds = Some(session_expiry_interval_seconds);
        self
    }

    /// Destroys the session, its in-flight state and its persisted records once the connection
    /// has been torn down
    pub fn with_end_session(mut self, end_session: bool) -> Self {
        self.options.end_session = end_session;
        self
    }

    pub fn build(self) -> DisconnectOptions {
        self.options
    }
}

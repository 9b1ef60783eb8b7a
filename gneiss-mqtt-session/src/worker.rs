/*
 * Copyright Bret Ambrose. All Rights Reserved.
 * SPDX-License-Identifier: Apache-2.0.
 */

/*!
The single worker that drives every registered session.

Each pass of [`SessionWorker::run_once`] routes transport events to the owning session, decodes
incoming bytes, starts connection attempts whose backoff has elapsed, services every session and
writes what it produced, tears down finished connections, and hands events to listeners.
 */

use crate::client::SessionHandle;
use crate::config::*;
use crate::connection::ConnectionState;
use crate::error::{fold_session_result, SessionResult};
use crate::logging::log_packet;
use crate::network::*;
use crate::persistence::SessionPersistence;
use crate::registry::SessionRegistry;
use crate::session::{fold_optional_timepoint_min, fold_timepoint};

use log::*;
use rand::Rng;
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

/// Maximum number of packets a session may produce per service pass
const SERVICE_PACKET_BUDGET: usize = 32;

/// Upper bound on how long [`SessionWorker::run`] sleeps between passes, since the transport is polled
const MAX_POLL_INTERVAL: Duration = Duration::from_millis(10);

/// How long a disconnecting connection may wait for unwritten bytes (the Disconnect packet) to drain
const TEARDOWN_DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

// per-session worker state that does not belong to the protocol session itself
struct SessionDriver {
    read_buffer: Vec<u8>,
    pending_write: Vec<u8>,
    reconnect_options: ReconnectOptions,
    next_reconnect_period: Duration,
    reconnect_time: Option<Instant>,
    connected_since: Option<Instant>,
    teardown_deadline: Option<Instant>,
}

impl SessionDriver {
    fn new(reconnect_options: ReconnectOptions) -> Self {
        let mut reconnect_options = reconnect_options;
        reconnect_options.normalize();

        SessionDriver {
            read_buffer: Vec::new(),
            pending_write: Vec::new(),
            next_reconnect_period: reconnect_options.base_reconnect_period,
            reconnect_options,
            reconnect_time: None,
            connected_since: None,
            teardown_deadline: None,
        }
    }

    fn reset_connection_state(&mut self) {
        self.read_buffer.clear();
        self.pending_write.clear();
        self.teardown_deadline = None;
    }

    // a healthy disconnecting connection stays open until its unwritten bytes drain or the drain times out
    fn should_hold_teardown(&mut self, client_id: &str, transport_good: bool, now: Instant) -> bool {
        if self.pending_write.is_empty() || !transport_good {
            return false;
        }

        let deadline = *self.teardown_deadline.get_or_insert(now + TEARDOWN_DRAIN_TIMEOUT);
        if now < deadline {
            debug!("[{}] complete_teardown - waiting for {} unwritten bytes to drain", client_id, self.pending_write.len());
            return true;
        }

        warn!("[{}] complete_teardown - abandoning {} unwritten bytes after drain timeout", client_id, self.pending_write.len());
        false
    }

    fn clamp_reconnect_period(&self, mut reconnect_period: Duration) -> Duration {
        if reconnect_period > self.reconnect_options.max_reconnect_period {
            reconnect_period = self.reconnect_options.max_reconnect_period;
        }

        reconnect_period
    }

    fn compute_uniform_jitter_period(&self, max_nanos: u128) -> Duration {
        if max_nanos == 0 {
            return Duration::ZERO;
        }

        let mut rng = rand::thread_rng();
        let uniform_nanos = rng.gen_range(0..max_nanos);
        Duration::from_nanos(uniform_nanos as u64)
    }

    fn compute_reconnect_period(&mut self) -> Duration {
        let reconnect_period = self.next_reconnect_period;
        self.next_reconnect_period = self.clamp_reconnect_period(self.next_reconnect_period.saturating_mul(2));

        match self.reconnect_options.reconnect_period_jitter {
            ExponentialBackoffJitterType::None => {
                reconnect_period
            }
            ExponentialBackoffJitterType::Uniform => {
                self.compute_uniform_jitter_period(reconnect_period.as_nanos())
            }
        }
    }

    // a connection that stayed up long enough resets the backoff
    fn apply_stability_reset(&mut self, now: Instant) {
        if let Some(connected_since) = self.connected_since.take() {
            if now.saturating_duration_since(connected_since) > self.reconnect_options.reconnect_stability_reset_period {
                self.next_reconnect_period = self.reconnect_options.base_reconnect_period;
            }
        }
    }
}

/// Drives the transport I/O and timers of every session in its registry
pub struct SessionWorker<T, C> where T : Transport, C : PacketCodec {
    transport: T,
    codec: C,
    registry: SessionRegistry,
    drivers: HashMap<String, SessionDriver>,
}

impl<T, C> SessionWorker<T, C> where T : Transport, C : PacketCodec {
    pub fn new(transport: T, codec: C) -> Self {
        SessionWorker {
            transport,
            codec,
            registry: SessionRegistry::new(),
            drivers: HashMap::new(),
        }
    }

    pub fn registry(&self) -> &SessionRegistry {
        &self.registry
    }

    /// Adds (or resumes) a session for `options`; see [`SessionRegistry::attach`]
    pub fn attach(&mut self, options: SessionOptions, persistence: Option<SessionPersistence>, now: Instant) -> SessionResult<Arc<SessionHandle>> {
        let client_id = options.client_id().to_string();
        let reconnect_options = *options.reconnect_options();
        let replacing = options.clean_start();

        // nothing routes events to a replaced session, so its socket is closed up front
        if replacing {
            if let Some(existing) = self.registry.find_by_client_id(client_id.as_str()) {
                if let Some(socket) = existing.with_session(|session| session.socket()) {
                    self.transport.close(socket);
                }
            }
        }

        let handle = self.registry.attach(options, persistence, now)?;
        if replacing || !self.drivers.contains_key(&client_id) {
            if let Some(previous) = self.drivers.insert(client_id, SessionDriver::new(reconnect_options)) {
                debug!("SessionWorker - attach - discarded driver state ({} unwritten bytes)", previous.pending_write.len());
            }
        }

        Ok(handle)
    }

    /// Performs one pass over every session.  Returns the earliest time another pass is needed,
    /// if any session has timed work pending.
    pub fn run_once(&mut self, now: Instant) -> Option<Instant> {
        self.route_transport_events(now);

        let handles : Vec<Arc<SessionHandle>> = self.registry.iter().cloned().collect();
        let mut next_service_time = None;
        for handle in handles {
            let session_service_time = self.drive_session(&handle, now);
            next_service_time = fold_optional_timepoint_min(&next_service_time, &session_service_time);
        }

        next_service_time
    }

    /// Runs passes until `shutdown` is set, then releases every session
    pub fn run(&mut self, shutdown: &AtomicBool) {
        info!("SessionWorker - run - starting");

        while !shutdown.load(Ordering::Acquire) {
            let now = Instant::now();
            let mut wait = MAX_POLL_INTERVAL;
            if let Some(next_service_time) = self.run_once(now) {
                wait = wait.min(next_service_time.saturating_duration_since(now));
            }

            if !wait.is_zero() {
                std::thread::sleep(wait);
            }
        }

        self.shutdown();
    }

    /// Closes every connection and releases every session.  Persisted records are kept.
    pub fn shutdown(&mut self) {
        let now = Instant::now();
        for handle in self.registry.drain() {
            self.ensure_driver(&handle);
            handle.with_session(|session| session.disconnect(DisconnectOptions::default()));

            self.write_session(&handle, now);
            self.complete_teardown(&handle, now, true);
            handle.dispatch_events();
        }

        self.drivers.clear();
        info!("SessionWorker - shutdown - complete");
    }

    fn ensure_driver(&mut self, handle: &Arc<SessionHandle>) {
        if !self.drivers.contains_key(handle.client_id()) {
            let reconnect_options = handle.with_session(|session| *session.options().reconnect_options());
            self.drivers.insert(handle.client_id().to_string(), SessionDriver::new(reconnect_options));
        }
    }

    fn route_transport_events(&mut self, now: Instant) {
        for (socket, event) in self.transport.poll() {
            let Some(handle) = self.registry.find_by_socket(socket) else {
                warn!("SessionWorker - route_transport_events - {} for unknown {}, closing", event, socket);
                self.transport.close(socket);
                continue;
            };

            match event {
                TransportEvent::Readable => {
                    self.read_socket(&handle, socket, now);
                }
                _ => {
                    debug!("[{}] route_transport_events - {} on {}", handle.client_id(), event, socket);
                    handle.with_session(|session| session.on_transport_event(event));
                }
            }
        }
    }

    fn read_socket(&mut self, handle: &Arc<SessionHandle>, socket: SocketId, now: Instant) {
        let Some(driver) = self.drivers.get_mut(handle.client_id()) else {
            return;
        };

        if let Err(error) = self.transport.receive(socket, &mut driver.read_buffer) {
            handle.with_session(|session| session.on_transport_failure(error));
            driver.read_buffer.clear();
            return;
        }

        let codec = &mut self.codec;
        handle.with_session(|session| {
            let protocol_version = session.options().protocol_version();
            while !driver.read_buffer.is_empty() {
                match codec.decode(&driver.read_buffer, protocol_version) {
                    Ok(DecodeResult::Packet(packet, consumed)) => {
                        driver.read_buffer.drain(..consumed);
                        session.handle_packet(packet, now);
                    }
                    Ok(DecodeResult::Incomplete) => {
                        return;
                    }
                    Err(error) => {
                        error!("[{}] read_socket - failed to decode incoming bytes: {}", session.client_id(), error);
                        driver.read_buffer.clear();
                        session.on_transport_failure(error);
                        return;
                    }
                }
            }
        });
    }

    fn drive_session(&mut self, handle: &Arc<SessionHandle>, now: Instant) -> Option<Instant> {
        let client_id = handle.client_id().to_string();
        self.ensure_driver(handle);

        self.start_connection_attempt(handle, now);
        self.write_session(handle, now);
        self.complete_teardown(handle, now, false);

        handle.dispatch_events();

        if handle.with_session(|session| session.is_destroy_pending()) {
            handle.with_session(|session| session.destroy());
            handle.dispatch_events();

            info!("[{}] drive_session - session ended, removing it", client_id);
            if let Err(error) = self.registry.remove(client_id.as_str()) {
                warn!("[{}] drive_session - {}", client_id, error);
            }
            self.drivers.remove(&client_id);
            return None;
        }

        let driver = self.drivers.get(&client_id)?;
        let (session_service_time, idle) = handle.with_session(|session| {
            let idle = session.desires_connection() && session.state() == ConnectionState::NotInProgress && !session.is_connected();
            (session.next_service_time(now), idle)
        });

        let mut next_service_time = session_service_time;
        if !driver.pending_write.is_empty() {
            next_service_time = fold_timepoint(&next_service_time, &now);
        }

        if idle {
            let reconnect_time = driver.reconnect_time.unwrap_or(now);
            next_service_time = fold_timepoint(&next_service_time, &reconnect_time);
        }

        next_service_time
    }

    fn start_connection_attempt(&mut self, handle: &Arc<SessionHandle>, now: Instant) {
        let Some(driver) = self.drivers.get_mut(handle.client_id()) else {
            return;
        };

        if let Some(reconnect_time) = driver.reconnect_time {
            if now < reconnect_time {
                return;
            }
        }

        let transport = &mut self.transport;
        let started = handle.with_session(|session| {
            if session.is_destroyed() || !session.desires_connection() || session.is_connected() || session.state() != ConnectionState::NotInProgress {
                return false;
            }

            let request = match session.begin_connect(now) {
                Ok(request) => { request }
                Err(error) => {
                    error!("[{}] start_connection_attempt - {}", session.client_id(), error);
                    return false;
                }
            };

            match transport.open(&request) {
                Ok(socket) => {
                    session.bind_socket(socket);
                }
                Err(error) => {
                    session.on_transport_failure(error);
                }
            }

            true
        });

        if started {
            driver.reconnect_time = None;
            driver.reset_connection_state();
        }
    }

    fn write_session(&mut self, handle: &Arc<SessionHandle>, now: Instant) {
        let Some(driver) = self.drivers.get_mut(handle.client_id()) else {
            return;
        };

        let transport = &mut self.transport;
        let codec = &mut self.codec;
        handle.with_session(|session| {
            let socket = session.socket();
            if let Some(socket) = socket {
                if let Err(error) = flush(transport, socket, &mut driver.pending_write) {
                    session.on_transport_failure(error);
                }
            }

            let budget = if driver.pending_write.is_empty() { SERVICE_PACKET_BUDGET } else { 0 };
            let packets = session.service(now, budget);
            if packets.is_empty() {
                if session.is_connected() && driver.connected_since.is_none() {
                    driver.connected_since = Some(now);
                }
                return;
            }

            let protocol_version = session.options().protocol_version();
            let prefix = format!("[{}] Sending: ", session.client_id());
            let mut result = Ok(());
            for packet in &packets {
                log_packet(prefix.as_str(), packet.packet_type(), packet);
                result = fold_session_result(result, codec.encode(packet, protocol_version, &mut driver.pending_write));
            }

            if let Err(error) = result {
                error!("[{}] write_session - failed to encode outbound packets: {}", session.client_id(), error);
                driver.pending_write.clear();
                session.on_transport_failure(error);
                return;
            }

            if let Some(socket) = socket {
                if let Err(error) = flush(transport, socket, &mut driver.pending_write) {
                    session.on_transport_failure(error);
                }
            }

            if session.is_connected() && driver.connected_since.is_none() {
                driver.connected_since = Some(now);
            }
        });
    }

    // `force` closes the connection even while written bytes are still pending
    fn complete_teardown(&mut self, handle: &Arc<SessionHandle>, now: Instant, force: bool) {
        let Some(driver) = self.drivers.get_mut(handle.client_id()) else {
            return;
        };

        let teardown = handle.with_session(|session| {
            if !session.needs_teardown() {
                return None;
            }

            if !force && driver.should_hold_teardown(session.client_id(), session.is_good(), now) {
                return None;
            }

            let socket = session.finish_teardown();
            Some((socket, session.desires_connection()))
        });

        let Some((socket, reconnect)) = teardown else {
            return;
        };

        if let Some(socket) = socket {
            debug!("[{}] complete_teardown - closing {}", handle.client_id(), socket);
            self.transport.close(socket);
        }

        driver.reset_connection_state();
        driver.apply_stability_reset(now);

        if !reconnect {
            driver.reconnect_time = None;
            return;
        }

        if !driver.reconnect_options.automatic {
            info!("[{}] complete_teardown - automatic reconnect disabled", handle.client_id());
            handle.with_session(|session| session.halt_reconnect());
            return;
        }

        let reconnect_period = driver.compute_reconnect_period();
        info!("[{}] complete_teardown - reconnecting in {:?}", handle.client_id(), reconnect_period);
        driver.reconnect_time = Some(now + reconnect_period);
    }
}

fn flush<T>(transport: &mut T, socket: SocketId, pending_write: &mut Vec<u8>) -> SessionResult<()> where T : Transport {
    if pending_write.is_empty() {
        return Ok(());
    }

    let written = transport.send(socket, pending_write)?;
    pending_write.drain(..written.min(pending_write.len()));

    Ok(())
}

/*
 * Copyright Bret Ambrose. All Rights Reserved.
 * SPDX-License-Identifier: Apache-2.0.
 */

/*!
Thread-safe application-facing handle to a client session.

Application threads publish, subscribe and disconnect through a [`SessionHandle`] while the
worker thread drives the same session's network side.  Both sides serialize on the session's
lock.  Publishers that hit the in-flight limit under [`BackpressurePolicy::Block`] wait on a
condition variable that is signalled whenever session state changes.
 */

use crate::config::*;
use crate::connection::ConnectionState;
use crate::error::{SessionError, SessionResult};
use crate::mqtt::*;
use crate::packet::Subscription;
use crate::publication::Publication;
use crate::session::*;

use log::*;
use std::fmt;
use std::sync::{Arc, Condvar, Mutex};
use std::time::Instant;

/// Callback function to be invoked with every emitted session event
pub type SessionEventListenerCallback = dyn Fn(Arc<SessionEvent>) + Send + Sync;

/// Basic session event listener type
pub type SessionEventListener = Arc<SessionEventListenerCallback>;

/// Opaque structure that represents the identity of a session event listener.  Returned by
/// adding a listener and used to remove that same listener if needed.
#[derive(Debug, Eq, PartialEq)]
pub struct ListenerHandle {
    id: u64
}

/// Shared handle to a [`ClientSession`].  Wrap it in an `Arc` to share it between the
/// application and the worker.
pub struct SessionHandle {
    client_id: String,

    session: Mutex<ClientSession>,

    // signalled after every change to session state
    state_signal: Condvar,

    listeners: Mutex<Vec<(u64, SessionEventListener)>>,

    listener_id_allocator: Mutex<u64>,
}

impl fmt::Debug for SessionHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SessionHandle {{ client_id:\"{}\" }}", self.client_id)
    }
}

impl SessionHandle {
    pub fn new(session: ClientSession) -> Self {
        SessionHandle {
            client_id: session.client_id().to_string(),
            session: Mutex::new(session),
            state_signal: Condvar::new(),
            listeners: Mutex::new(Vec::new()),
            listener_id_allocator: Mutex::new(1),
        }
    }

    pub fn client_id(&self) -> &str {
        self.client_id.as_str()
    }

    pub fn state(&self) -> ConnectionState {
        self.session.lock().unwrap().state()
    }

    pub fn is_connected(&self) -> bool {
        self.session.lock().unwrap().is_connected()
    }

    /// Runs `operation` with exclusive access to the session, then wakes any blocked publishers
    pub fn with_session<R>(&self, operation: impl FnOnce(&mut ClientSession) -> R) -> R {
        let result = {
            let mut session = self.session.lock().unwrap();
            operation(&mut session)
        };

        self.state_signal.notify_all();
        result
    }

    /// Signals the worker that it should establish (and keep re-establishing) a connection
    pub fn connect(&self) -> SessionResult<()> {
        info!("[{}] session connect invoked", self.client_id);
        self.with_session(|session| session.connect())
    }

    /// Signals the worker to close the current connection.  Publishers blocked on the in-flight
    /// limit are released with a user-initiated-disconnect error.
    pub fn disconnect(&self, options: Option<DisconnectOptions>) {
        info!("[{}] session disconnect invoked", self.client_id);
        let options = options.unwrap_or_default();
        self.with_session(|session| session.disconnect(options));
    }

    /// Submits a publish and returns its packet id (zero for QoS 0).  When the in-flight limit is
    /// reached the configured backpressure policy decides between failing immediately and
    /// waiting for capacity.
    pub fn publish(&self, publication: Publication, qos: QualityOfService, retain: bool, properties: MessageProperties) -> SessionResult<u16> {
        debug!("[{}] publish operation submitted to \"{}\"", self.client_id, publication.topic());

        let mut session = self.session.lock().unwrap();
        let policy = session.options().backpressure_policy();
        if qos != QualityOfService::AtMostOnce {
            if let BackpressurePolicy::Block { timeout } = policy {
                let generation = session.disconnect_generation();
                let deadline = timeout.map(|timeout| Instant::now() + timeout);

                while !session.has_publish_capacity() {
                    if session.is_destroyed() {
                        return Err(SessionError::new_session_closed());
                    }

                    if session.disconnect_generation() != generation {
                        info!("[{}] publish - blocked publish released by disconnect", self.client_id);
                        return Err(SessionError::new_user_initiated_disconnect());
                    }

                    // nothing frees capacity while a disconnect is in effect
                    if session.disconnect_generation() > 0 && !session.desires_connection() {
                        info!("[{}] publish - no in-flight capacity and the session is disconnected", self.client_id);
                        return Err(SessionError::new_user_initiated_disconnect());
                    }

                    match deadline {
                        Some(deadline) => {
                            let now = Instant::now();
                            if now >= deadline {
                                warn!("[{}] publish - timed out waiting for in-flight capacity", self.client_id);
                                return Err(SessionError::new_inflight_limit_reached(session.options().max_inflight_messages()));
                            }

                            session = self.state_signal.wait_timeout(session, deadline - now).unwrap().0;
                        }
                        None => {
                            session = self.state_signal.wait(session).unwrap();
                        }
                    }
                }
            }
        }

        session.publish(publication, qos, retain, properties, Instant::now())
    }

    /// Convenience form of [`SessionHandle::publish`] that takes ownership of a topic and payload
    pub fn publish_bytes(&self, topic: &str, payload: Vec<u8>, qos: QualityOfService, retain: bool) -> SessionResult<u16> {
        self.publish(Publication::acquire(topic, payload), qos, retain, MessageProperties::default())
    }

    pub fn subscribe(&self, subscriptions: Vec<Subscription>) -> SessionResult<u16> {
        debug!("[{}] subscribe operation submitted", self.client_id);
        self.with_session(|session| session.subscribe(subscriptions))
    }

    pub fn unsubscribe(&self, topic_filters: Vec<String>) -> SessionResult<u16> {
        debug!("[{}] unsubscribe operation submitted", self.client_id);
        self.with_session(|session| session.unsubscribe(topic_filters))
    }

    /// Removes and returns completed inbound messages.  Only useful when no listeners are
    /// registered; otherwise messages are handed to the listeners as they arrive.
    pub fn take_delivered(&self) -> Vec<DeliveredMessage> {
        self.session.lock().unwrap().take_delivered()
    }

    /// Adds a listener to the events emitted by this session
    pub fn add_event_listener(&self, listener: SessionEventListener) -> ListenerHandle {
        let mut current_id = self.listener_id_allocator.lock().unwrap();
        let listener_id = *current_id;
        *current_id += 1;

        debug!("[{}] adding event listener {}", self.client_id, listener_id);
        self.listeners.lock().unwrap().push((listener_id, listener));

        ListenerHandle {
            id: listener_id
        }
    }

    pub fn remove_event_listener(&self, listener: ListenerHandle) {
        debug!("[{}] removing event listener {}", self.client_id, listener.id);
        self.listeners.lock().unwrap().retain(|(id, _)| *id != listener.id);
    }

    /// Hands pending session events (and, when listeners exist, completed inbound messages) to
    /// the registered listeners.  Listeners are invoked without holding the session lock.
    pub fn dispatch_events(&self) {
        let listeners : Vec<SessionEventListener> = self.listeners.lock().unwrap().iter().map(|(_, listener)| listener.clone()).collect();

        let events = self.with_session(|session| {
            let mut events = session.take_events();
            if !listeners.is_empty() {
                events.extend(session.take_delivered().into_iter().map(SessionEvent::MessageArrived));
            }

            events
        });

        for event in events {
            let event = Arc::new(event);
            debug!("[{}] dispatching {}", self.client_id, event);
            for listener in &listeners {
                (listener)(event.clone());
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::packet::*;
    use crate::testing::*;
    use assert_matches::assert_matches;
    use std::sync::mpsc;
    use std::thread;
    use std::time::Duration;

    fn build_blocking_handle(timeout: Option<Duration>) -> Arc<SessionHandle> {
        let options = build_session_options(ProtocolVersion::Mqtt311, true)
            .with_max_inflight_messages(1)
            .with_backpressure_policy(BackpressurePolicy::Block { timeout })
            .build();

        let mut session = ClientSession::new(options, None);
        connect_session(&mut session, false, Instant::now());

        Arc::new(SessionHandle::new(session))
    }

    #[test]
    fn blocked_publish_resumes_when_capacity_frees() {
        let handle = build_blocking_handle(Some(Duration::from_secs(10)));
        let first_id = handle.publish_bytes("a/b", vec![1], QualityOfService::AtLeastOnce, false).unwrap();

        let completer = handle.clone();
        let join_handle = thread::spawn(move || {
            thread::sleep(Duration::from_millis(50));
            completer.with_session(|session| {
                let now = Instant::now();
                session.service(now, usize::MAX);
                session.handle_packet(InboundPacket::Puback(PubackPacket { packet_id: first_id, reason_code: 0 }), now);
            });
        });

        let second_id = handle.publish_bytes("a/b", vec![2], QualityOfService::AtLeastOnce, false).unwrap();
        assert_ne!(first_id, second_id);
        join_handle.join().unwrap();

        assert_eq!(vec![second_id], handle.with_session(|session| session.outbound().packet_ids()));
    }

    #[test]
    fn blocked_publish_times_out() {
        let handle = build_blocking_handle(Some(Duration::from_millis(20)));
        handle.publish_bytes("a/b", vec![1], QualityOfService::AtLeastOnce, false).unwrap();

        let result = handle.publish_bytes("a/b", vec![2], QualityOfService::AtLeastOnce, false);
        assert_matches!(result, Err(SessionError::InflightLimitReached(context)) if context.limit == 1);

        // qos 0 never blocks
        assert_eq!(0, handle.publish_bytes("a/b", vec![3], QualityOfService::AtMostOnce, false).unwrap());
    }

    #[test]
    fn disconnect_releases_blocked_publishers() {
        let handle = build_blocking_handle(None);
        handle.publish_bytes("a/b", vec![1], QualityOfService::AtLeastOnce, false).unwrap();

        let publisher = handle.clone();
        let join_handle = thread::spawn(move || {
            publisher.publish_bytes("a/b", vec![2], QualityOfService::AtLeastOnce, false)
        });

        thread::sleep(Duration::from_millis(50));
        handle.disconnect(None);

        let result = join_handle.join().unwrap();
        assert_matches!(result, Err(SessionError::UserInitiatedDisconnect(_)));
    }

    #[test]
    fn publish_without_capacity_after_disconnect_fails_immediately() {
        let handle = build_blocking_handle(None);
        handle.publish_bytes("a/b", vec![1], QualityOfService::AtLeastOnce, false).unwrap();
        handle.disconnect(None);

        let result = handle.publish_bytes("a/b", vec![2], QualityOfService::AtLeastOnce, false);
        assert_matches!(result, Err(SessionError::UserInitiatedDisconnect(_)));

        // qos 0 has no in-flight limit
        assert_eq!(0, handle.publish_bytes("a/b", vec![3], QualityOfService::AtMostOnce, false).unwrap());
    }

    #[test]
    fn listeners_receive_events_and_messages() {
        let handle = build_blocking_handle(None);
        let (sender, receiver) = mpsc::channel();
        let listener_handle = handle.add_event_listener(Arc::new(move |event: Arc<SessionEvent>| {
            sender.send(event.to_string()).unwrap();
        }));

        handle.with_session(|session| {
            session.handle_packet(InboundPacket::Publish(InboundPublish {
                packet_id: 0,
                qos: QualityOfService::AtMostOnce,
                retain: false,
                duplicate: false,
                topic: "news".to_string(),
                payload: vec![1, 2, 3],
                properties: MessageProperties::default(),
            }), Instant::now());
        });

        handle.dispatch_events();
        let dispatched : Vec<String> = receiver.try_iter().collect();
        assert_eq!(2, dispatched.len());
        assert!(dispatched[0].starts_with("ConnectionSuccess"));
        assert!(dispatched[1].contains("topic:\"news\""));

        handle.remove_event_listener(listener_handle);
        handle.with_session(|session| {
            session.subscribe(vec![Subscription::new("a", QualityOfService::AtMostOnce)]).unwrap();
        });
        handle.dispatch_events();
        assert_eq!(0, receiver.try_iter().count());
    }

    #[test]
    fn messages_are_polled_without_listeners() {
        let handle = build_blocking_handle(None);
        handle.with_session(|session| {
            session.handle_packet(InboundPacket::Publish(InboundPublish {
                packet_id: 3,
                qos: QualityOfService::AtLeastOnce,
                retain: true,
                duplicate: false,
                topic: "state".to_string(),
                payload: vec![9],
                properties: MessageProperties::default(),
            }), Instant::now());
        });

        handle.dispatch_events();
        let delivered = handle.take_delivered();
        assert_eq!(1, delivered.len());
        assert!(delivered[0].retain);
    }
}

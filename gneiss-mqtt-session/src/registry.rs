/*
 * Copyright Bret Ambrose. All Rights Reserved.
 * SPDX-License-Identifier: Apache-2.0.
 */

/*!
The collection of every client session driven by one worker.
 */

use crate::client::SessionHandle;
use crate::config::SessionOptions;
use crate::error::{SessionError, SessionResult};
use crate::network::SocketId;
use crate::persistence::SessionPersistence;
use crate::session::ClientSession;

use log::*;
use std::sync::Arc;
use std::time::Instant;

/// Format tag of the registry, reported for diagnostics
pub const REGISTRY_VERSION: u32 = 1;

/// Insertion-ordered set of sessions, unique by client id
pub struct SessionRegistry {
    version: u32,
    sessions: Vec<Arc<SessionHandle>>,
}

impl Default for SessionRegistry {
    fn default() -> Self {
        SessionRegistry::new()
    }
}

impl SessionRegistry {
    pub fn new() -> Self {
        SessionRegistry {
            version: REGISTRY_VERSION,
            sessions: Vec::new(),
        }
    }

    pub fn version(&self) -> u32 {
        self.version
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    /// Sessions in insertion order
    pub fn iter(&self) -> impl Iterator<Item = &Arc<SessionHandle>> {
        self.sessions.iter()
    }

    pub fn find_by_client_id(&self, client_id: &str) -> Option<Arc<SessionHandle>> {
        self.sessions.iter().find(|handle| handle.client_id() == client_id).cloned()
    }

    /// Finds the session whose current connection attempt owns `socket`
    pub fn find_by_socket(&self, socket: SocketId) -> Option<Arc<SessionHandle>> {
        self.sessions.iter().find(|handle| handle.with_session(|session| session.socket()) == Some(socket)).cloned()
    }

    pub fn insert(&mut self, handle: Arc<SessionHandle>) -> SessionResult<()> {
        if self.find_by_client_id(handle.client_id()).is_some() {
            error!("SessionRegistry - insert - session for client id \"{}\" already exists", handle.client_id());
            return Err(SessionError::new_duplicate_client_id(handle.client_id()));
        }

        debug!("SessionRegistry - insert - adding session for client id \"{}\"", handle.client_id());
        self.sessions.push(handle);
        Ok(())
    }

    pub fn remove(&mut self, client_id: &str) -> SessionResult<Arc<SessionHandle>> {
        let Some(index) = self.sessions.iter().position(|handle| handle.client_id() == client_id) else {
            return Err(SessionError::new_session_not_found(client_id));
        };

        debug!("SessionRegistry - remove - removing session for client id \"{}\"", client_id);
        Ok(self.sessions.remove(index))
    }

    /// Returns the session to use for `options`.  Without clean start an existing session is
    /// resumed; with clean start it is destroyed and replaced.  A new session restores its
    /// persisted records unless clean start was requested, in which case they are cleared.
    pub fn attach(&mut self, options: SessionOptions, persistence: Option<SessionPersistence>, now: Instant) -> SessionResult<Arc<SessionHandle>> {
        let client_id = options.client_id().to_string();

        if let Some(existing) = self.find_by_client_id(client_id.as_str()) {
            if !options.clean_start() {
                info!("SessionRegistry - attach - resuming existing session for client id \"{}\"", client_id);
                return Ok(existing);
            }

            info!("SessionRegistry - attach - clean start replaces existing session for client id \"{}\"", client_id);
            existing.with_session(|session| session.destroy());
            existing.dispatch_events();
            self.remove(client_id.as_str())?;
        }

        let mut persistence = persistence;
        if options.clean_start() {
            if let Some(persistence) = &mut persistence {
                persistence.clear(client_id.as_str())?;
            }
        }

        let clean_start = options.clean_start();
        let mut session = ClientSession::new(options, persistence);
        if !clean_start {
            for error in session.restore_from_persistence(now) {
                warn!("SessionRegistry - attach - [{}] skipped persisted record: {}", client_id, error);
            }
        }

        let handle = Arc::new(SessionHandle::new(session));
        self.insert(handle.clone())?;

        Ok(handle)
    }

    /// Removes every session from the registry.  Persisted records are left untouched.
    pub fn drain(&mut self) -> Vec<Arc<SessionHandle>> {
        info!("SessionRegistry - drain - releasing {} sessions", self.sessions.len());
        std::mem::take(&mut self.sessions)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mqtt::*;
    use crate::testing::*;
    use assert_matches::assert_matches;

    #[test]
    fn lookup_by_client_id_and_socket() {
        let now = Instant::now();
        let mut registry = SessionRegistry::new();
        assert_eq!(REGISTRY_VERSION, registry.version());

        let first = registry.attach(build_session_options(ProtocolVersion::Mqtt311, true).build(), None, now).unwrap();
        let second = registry.attach(build_session_options(ProtocolVersion::Mqtt5, true).build(), None, now).unwrap();
        assert_eq!(2, registry.len());

        second.with_session(|session| session.bind_socket(SocketId(42)));

        assert!(Arc::ptr_eq(&first, &registry.find_by_client_id(first.client_id()).unwrap()));
        assert!(Arc::ptr_eq(&second, &registry.find_by_socket(SocketId(42)).unwrap()));
        assert!(registry.find_by_socket(SocketId(7)).is_none());
        assert!(registry.find_by_client_id("missing").is_none());

        let client_ids : Vec<&str> = registry.iter().map(|handle| handle.client_id()).collect();
        assert_eq!(vec![first.client_id(), second.client_id()], client_ids);
    }

    #[test]
    fn duplicate_and_missing_client_ids_are_rejected() {
        let mut registry = SessionRegistry::new();
        let options = build_session_options(ProtocolVersion::Mqtt311, true).build();
        let client_id = options.client_id().to_string();

        registry.insert(Arc::new(SessionHandle::new(ClientSession::new(options.clone(), None)))).unwrap();
        let result = registry.insert(Arc::new(SessionHandle::new(ClientSession::new(options, None))));
        assert_matches!(result, Err(SessionError::DuplicateClientId(context)) if context.client_id == client_id);

        registry.remove(client_id.as_str()).unwrap();
        assert_matches!(registry.remove(client_id.as_str()), Err(SessionError::SessionNotFound(_)));
        assert!(registry.is_empty());
    }

    #[test]
    fn attach_resumes_or_replaces() {
        let now = Instant::now();
        let mut registry = SessionRegistry::new();
        let resumable = build_session_options(ProtocolVersion::Mqtt311, false).build();

        let original = registry.attach(resumable.clone(), None, now).unwrap();
        original.publish_bytes("a", vec![1], QualityOfService::AtLeastOnce, false).unwrap();

        let resumed = registry.attach(resumable.clone(), None, now).unwrap();
        assert!(Arc::ptr_eq(&original, &resumed));

        let mut clean = resumable;
        clean.clean_start = true;
        let replaced = registry.attach(clean, None, now).unwrap();
        assert!(!Arc::ptr_eq(&original, &replaced));
        assert!(original.with_session(|session| session.is_destroyed()));
        assert!(replaced.with_session(|session| session.outbound().is_empty()));
        assert_eq!(1, registry.len());
    }

    #[test]
    fn attach_restores_or_clears_persisted_records() {
        let now = Instant::now();
        let store = MemoryStore::new();
        let options = build_session_options(ProtocolVersion::Mqtt5, false).build();

        {
            let mut session = ClientSession::new(options.clone(), Some(SessionPersistence::new(Box::new(store.clone()))));
            connect_session(&mut session, false, now);
            session.publish(crate::publication::Publication::acquire("a", vec![1]), QualityOfService::AtLeastOnce, false, MessageProperties::default(), now).unwrap();
            session.service(now, usize::MAX);
        }
        assert_eq!(1, store.len());

        let mut registry = SessionRegistry::new();
        let restored = registry.attach(options.clone(), Some(SessionPersistence::new(Box::new(store.clone()))), now).unwrap();
        assert_eq!(1, restored.with_session(|session| session.outbound().len()));

        let mut registry = SessionRegistry::new();
        let mut clean = options;
        clean.clean_start = true;
        let cleaned = registry.attach(clean, Some(SessionPersistence::new(Box::new(store.clone()))), now).unwrap();
        assert!(cleaned.with_session(|session| session.outbound().is_empty()));
        assert_eq!(0, store.len());
    }

    #[test]
    fn drain_releases_every_session() {
        let now = Instant::now();
        let mut registry = SessionRegistry::new();
        registry.attach(build_session_options(ProtocolVersion::Mqtt311, true).build(), None, now).unwrap();
        registry.attach(build_session_options(ProtocolVersion::Mqtt311, true).build(), None, now).unwrap();

        let drained = registry.drain();
        assert_eq!(2, drained.len());
        assert!(registry.is_empty());
        assert!(drained.iter().all(|handle| !handle.with_session(|session| session.is_destroyed())));
    }
}

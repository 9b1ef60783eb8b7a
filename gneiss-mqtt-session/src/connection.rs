/*
 * Copyright Bret Ambrose. All Rights Reserved.
 * SPDX-License-Identifier: Apache-2.0.
 */

/*!
Connection establishment state machine.

An attempt walks the configured stages in a fixed order (proxy tunnel, TCP, TLS, websocket
upgrade, CONNACK wait), skipping the ones that are not configured.  An accepted CONNACK marks
the connection established and returns the state code to `NotInProgress`.  Failures and
disconnect requests move to `Disconnecting`, which only resolves back to `NotInProgress` once the
transport has been torn down.
 */

use crate::error::{SessionError, SessionResult};

use log::*;
use std::fmt;

/// Connection progress of a session.
///
/// The established state is not a distinct code: it is `NotInProgress` with the connected flag set.
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq)]
pub enum ConnectionState {
    #[default]
    NotInProgress,
    TcpInProgress,
    SslInProgress,
    WebsocketInProgress,
    WaitForConnack,
    ProxyConnectInProgress,
    Disconnecting,
}

impl ConnectionState {

    /// Numeric state code, as reported in diagnostics
    pub fn code(&self) -> i8 {
        match self {
            ConnectionState::NotInProgress => { 0 }
            ConnectionState::TcpInProgress => { 1 }
            ConnectionState::SslInProgress => { 2 }
            ConnectionState::WebsocketInProgress => { 3 }
            ConnectionState::WaitForConnack => { 4 }
            ConnectionState::ProxyConnectInProgress => { 5 }
            ConnectionState::Disconnecting => { -2 }
        }
    }

    pub fn from_code(code: i8) -> Option<ConnectionState> {
        match code {
            0 => { Some(ConnectionState::NotInProgress) }
            1 => { Some(ConnectionState::TcpInProgress) }
            2 => { Some(ConnectionState::SslInProgress) }
            3 => { Some(ConnectionState::WebsocketInProgress) }
            4 => { Some(ConnectionState::WaitForConnack) }
            5 => { Some(ConnectionState::ProxyConnectInProgress) }
            -2 => { Some(ConnectionState::Disconnecting) }
            _ => { None }
        }
    }

    /// True while an attempt is walking its establishment stages
    pub fn is_establishing(&self) -> bool {
        !matches!(self, ConnectionState::NotInProgress | ConnectionState::Disconnecting)
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConnectionState::NotInProgress => { write!(f, "NotInProgress") }
            ConnectionState::TcpInProgress => { write!(f, "TcpInProgress") }
            ConnectionState::SslInProgress => { write!(f, "SslInProgress") }
            ConnectionState::WebsocketInProgress => { write!(f, "WebsocketInProgress") }
            ConnectionState::WaitForConnack => { write!(f, "WaitForConnack") }
            ConnectionState::ProxyConnectInProgress => { write!(f, "ProxyConnectInProgress") }
            ConnectionState::Disconnecting => { write!(f, "Disconnecting") }
        }
    }
}

/// Optional establishment stages a connection attempt goes through
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq)]
pub struct ConnectionPlan {
    pub proxy: bool,
    pub tls: bool,
    pub websocket: bool,
}

impl ConnectionPlan {
    fn first_stage(&self) -> ConnectionState {
        if self.proxy {
            ConnectionState::ProxyConnectInProgress
        } else {
            ConnectionState::TcpInProgress
        }
    }

    fn stage_after(&self, state: ConnectionState) -> Option<ConnectionState> {
        match state {
            ConnectionState::ProxyConnectInProgress => {
                Some(ConnectionState::TcpInProgress)
            }
            ConnectionState::TcpInProgress => {
                if self.tls {
                    Some(ConnectionState::SslInProgress)
                } else {
                    self.stage_after(ConnectionState::SslInProgress)
                }
            }
            ConnectionState::SslInProgress => {
                if self.websocket {
                    Some(ConnectionState::WebsocketInProgress)
                } else {
                    Some(ConnectionState::WaitForConnack)
                }
            }
            ConnectionState::WebsocketInProgress => {
                Some(ConnectionState::WaitForConnack)
            }
            _ => { None }
        }
    }
}

pub(crate) struct ConnectionStateMachine {
    state: ConnectionState,
    plan: ConnectionPlan,
    connected: bool,
}

impl ConnectionStateMachine {
    pub(crate) fn new() -> Self {
        ConnectionStateMachine {
            state: ConnectionState::NotInProgress,
            plan: ConnectionPlan::default(),
            connected: false,
        }
    }

    pub(crate) fn state(&self) -> ConnectionState {
        self.state
    }

    pub(crate) fn is_connected(&self) -> bool {
        self.connected
    }

    /// Starts an attempt; only legal when idle and not connected
    pub(crate) fn begin(&mut self, plan: ConnectionPlan) -> SessionResult<ConnectionState> {
        if self.state != ConnectionState::NotInProgress || self.connected {
            error!("ConnectionStateMachine - cannot begin a connection attempt from {} (connected: {})", self.state, self.connected);
            return Err(SessionError::new_invalid_state_transition(self.state, "connection attempt already in progress or established"));
        }

        self.plan = plan;
        self.change_state(plan.first_stage());
        Ok(self.state)
    }

    /// Marks the current establishment stage complete and moves to the next configured one
    pub(crate) fn complete_stage(&mut self) -> SessionResult<ConnectionState> {
        if let Some(next_state) = self.plan.stage_after(self.state) {
            self.change_state(next_state);
            return Ok(next_state);
        }

        error!("ConnectionStateMachine - no establishment stage follows {}", self.state);
        Err(SessionError::new_invalid_state_transition(self.state, "no establishment stage follows the current state"))
    }

    pub(crate) fn accept_connack(&mut self) -> SessionResult<()> {
        if self.state != ConnectionState::WaitForConnack {
            error!("ConnectionStateMachine - connack accepted while in {}", self.state);
            return Err(SessionError::new_invalid_state_transition(self.state, "connack is only valid while waiting for one"));
        }

        self.connected = true;
        self.change_state(ConnectionState::NotInProgress);
        Ok(())
    }

    /// Enters `Disconnecting` from an attempt or an established connection.  Returns false if
    /// there was nothing to tear down.
    pub(crate) fn begin_disconnect(&mut self) -> bool {
        match self.state {
            ConnectionState::Disconnecting => {
                self.connected = false;
                true
            }
            ConnectionState::NotInProgress if !self.connected => {
                false
            }
            _ => {
                self.connected = false;
                self.change_state(ConnectionState::Disconnecting);
                true
            }
        }
    }

    pub(crate) fn finish_disconnect(&mut self) -> SessionResult<()> {
        if self.state != ConnectionState::Disconnecting {
            error!("ConnectionStateMachine - teardown completed while in {}", self.state);
            return Err(SessionError::new_invalid_state_transition(self.state, "teardown can only complete while disconnecting"));
        }

        self.change_state(ConnectionState::NotInProgress);
        Ok(())
    }

    fn change_state(&mut self, next_state: ConnectionState) {
        debug!("ConnectionStateMachine - change_state - transitioning from {} to {}", self.state, next_state);
        self.state = next_state;
    }
}

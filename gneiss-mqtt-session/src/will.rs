/*
 * Copyright Bret Ambrose. All Rights Reserved.
 * SPDX-License-Identifier: Apache-2.0.
 */

use crate::mqtt::QualityOfService;

use std::fmt;

/// Last-will message the broker publishes on the session's behalf if the connection drops
/// unexpectedly.
///
/// Owned solely by its session and never shared with in-flight publishes.  Reconfiguring the will
/// replaces it wholesale.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct WillMessage {
    pub(crate) topic: String,
    pub(crate) payload: Vec<u8>,
    pub(crate) qos: QualityOfService,
    pub(crate) retain: bool,
}

impl WillMessage {

    /// Creates a new will with QoS 0 and no retain
    pub fn new(topic: &str, payload: Vec<u8>) -> Self {
        WillMessage {
            topic: topic.to_string(),
            payload,
            qos: QualityOfService::AtMostOnce,
            retain: false,
        }
    }

    /// Sets the quality of service the broker should publish the will with
    pub fn with_qos(mut self, qos: QualityOfService) -> Self {
        self.qos = qos;
        self
    }

    /// Sets whether the broker should retain the will when it is published
    pub fn with_retain(mut self, retain: bool) -> Self {
        self.retain = retain;
        self
    }

    pub fn topic(&self) -> &str {
        self.topic.as_str()
    }

    pub fn payload(&self) -> &[u8] {
        self.payload.as_slice()
    }

    pub fn qos(&self) -> QualityOfService {
        self.qos
    }

    pub fn retain(&self) -> bool {
        self.retain
    }
}

impl fmt::Display for WillMessage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "WillMessage {{ topic:\"{}\" payload:<{} Bytes> qos:{} retain:{} }}", self.topic, self.payload.len(), self.qos, self.retain)
    }
}

/*
 * Copyright Bret Ambrose. All Rights Reserved.
 * SPDX-License-Identifier: Apache-2.0.
 */

/*!
In-flight message records and the per-record QoS handshake state machine.

Outbound QoS 1 records move from `Puback` to retirement.  Outbound QoS 2 records move
`Pubrec` -> `Pubrel` -> `Pubcomp` -> retirement, where `Pubrel` means "PUBREC received, PUBREL
not yet written".  Inbound QoS 2 records start at `Pubrel` (PUBREC written, waiting for the
broker's PUBREL) and retire once PUBREL arrives.  Stages never move backwards; a resend after
reconnect re-transmits the packet for the current stage without changing it.
 */

use crate::error::{SessionError, SessionResult};
use crate::logging::*;
use crate::mqtt::*;
use crate::packet::*;
use crate::publication::Publication;

use log::*;
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::time::{Duration, Instant};

/// Which side of the connection originated a tracked publish
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
pub enum Direction {

    /// Received from the broker
    Inbound,

    /// Published by the application
    Outbound,
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Direction::Inbound => { write!(f, "Inbound") }
            Direction::Outbound => { write!(f, "Outbound") }
        }
    }
}

/// Next packet type a record is waiting on.
///
/// Values match MQTT control packet type codes, which is also how they are persisted.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum MessageStage {
    None = 0,
    Puback = 4,
    Pubrec = 5,
    Pubrel = 6,
    Pubcomp = 7,
}

impl TryFrom<u8> for MessageStage {
    type Error = SessionError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => { Ok(MessageStage::None) }
            4 => { Ok(MessageStage::Puback) }
            5 => { Ok(MessageStage::Pubrec) }
            6 => { Ok(MessageStage::Pubrel) }
            7 => { Ok(MessageStage::Pubcomp) }
            _ => {
                Err(SessionError::new_decoding_failure("invalid message stage value"))
            }
        }
    }
}

impl fmt::Display for MessageStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MessageStage::None => { write!(f, "None") }
            MessageStage::Puback => { write!(f, "Puback") }
            MessageStage::Pubrec => { write!(f, "Pubrec") }
            MessageStage::Pubrel => { write!(f, "Pubrel") }
            MessageStage::Pubcomp => { write!(f, "Pubcomp") }
        }
    }
}

/// Result of applying an acknowledgement to a record
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub(crate) enum AckOutcome {

    /// The record moved to its next stage and stays in flight
    Advanced,

    /// The handshake is finished; the record should be retired
    Completed,

    /// The acknowledgement does not apply to the record's current stage and was ignored
    Ignored,
}

/// Per-publish protocol state for a QoS 1 or QoS 2 exchange.
pub struct InflightMessage {
    pub(crate) direction: Direction,
    pub(crate) qos: QualityOfService,
    pub(crate) retain: bool,
    pub(crate) packet_id: u16,
    pub(crate) protocol_version: ProtocolVersion,
    pub(crate) properties: MessageProperties,
    pub(crate) publication: Publication,
    pub(crate) created: Instant,
    pub(crate) last_touch: Instant,
    pub(crate) stage: MessageStage,

    // set once the publish has been written; later writes carry the DUP flag
    pub(crate) duplicate: bool,
    pub(crate) serialized_length: usize,

    // enqueue order within the owning InflightQueue
    pub(crate) order: u64,

    // entry in the queued-outbound FIFO while the publish has never been written
    pub(crate) queue_sequence: Option<u64>,

    // a PUBREL whose stage could not be persisted is not rewritten before this time
    pub(crate) pubrel_hold: Option<Instant>,
}

impl InflightMessage {

    pub(crate) fn new_outbound(packet_id: u16, qos: QualityOfService, retain: bool, protocol_version: ProtocolVersion, properties: MessageProperties, publication: Publication, now: Instant) -> SessionResult<Self> {
        let stage = match qos {
            QualityOfService::AtLeastOnce => { MessageStage::Puback }
            QualityOfService::ExactlyOnce => { MessageStage::Pubrec }
            QualityOfService::AtMostOnce => {
                return Err(SessionError::new_internal_state_error("qos 0 publishes are not tracked in flight"));
            }
        };

        InflightMessage::new(Direction::Outbound, packet_id, qos, retain, protocol_version, properties, publication, stage, now)
    }

    pub(crate) fn new_inbound(publish: &InboundPublish, protocol_version: ProtocolVersion, publication: Publication, now: Instant) -> SessionResult<Self> {
        if publish.qos != QualityOfService::ExactlyOnce {
            return Err(SessionError::new_internal_state_error("only inbound qos 2 publishes are tracked in flight"));
        }

        let mut message = InflightMessage::new(Direction::Inbound, publish.packet_id, publish.qos, publish.retain, protocol_version, publish.properties.clone(), publication, MessageStage::Pubrel, now)?;

        // PUBREC goes out as soon as the record exists
        message.duplicate = true;
        Ok(message)
    }

    #[allow(clippy::too_many_arguments)]
    fn new(direction: Direction, packet_id: u16, qos: QualityOfService, retain: bool, protocol_version: ProtocolVersion, properties: MessageProperties, publication: Publication, stage: MessageStage, now: Instant) -> SessionResult<Self> {
        if packet_id == 0 {
            return Err(SessionError::new_internal_state_error("in-flight records require a non-zero packet id"));
        }

        let properties =
            if protocol_version.supports_properties() {
                properties
            } else {
                MessageProperties::default()
            };

        let mut message = InflightMessage {
            direction,
            qos,
            retain,
            packet_id,
            protocol_version,
            properties,
            publication,
            created: now,
            last_touch: now,
            stage,
            duplicate: false,
            serialized_length: 0,
            order: 0,
            queue_sequence: None,
            pubrel_hold: None,
        };

        message.serialized_length = crate::persistence::compute_record_length(&message);
        Ok(message)
    }

    pub fn direction(&self) -> Direction {
        self.direction
    }

    pub fn packet_id(&self) -> u16 {
        self.packet_id
    }

    pub fn qos(&self) -> QualityOfService {
        self.qos
    }

    pub fn retain(&self) -> bool {
        self.retain
    }

    pub fn protocol_version(&self) -> ProtocolVersion {
        self.protocol_version
    }

    pub fn properties(&self) -> &MessageProperties {
        &self.properties
    }

    pub fn publication(&self) -> &Publication {
        &self.publication
    }

    pub fn stage(&self) -> MessageStage {
        self.stage
    }

    pub fn last_touch(&self) -> Instant {
        self.last_touch
    }

    /// True once the publish has been written at least once
    pub fn is_duplicate(&self) -> bool {
        self.duplicate
    }

    /// Size of the record's persisted representation
    pub fn serialized_length(&self) -> usize {
        self.serialized_length
    }

    pub(crate) fn on_puback(&mut self, now: Instant) -> AckOutcome {
        if self.direction != Direction::Outbound || self.stage != MessageStage::Puback {
            return AckOutcome::Ignored;
        }

        self.touch(now);
        AckOutcome::Completed
    }

    pub(crate) fn on_pubrec(&mut self, now: Instant) -> AckOutcome {
        if self.direction != Direction::Outbound || self.stage != MessageStage::Pubrec {
            return AckOutcome::Ignored;
        }

        self.advance(MessageStage::Pubrel, now);
        AckOutcome::Advanced
    }

    pub(crate) fn on_pubcomp(&mut self, now: Instant) -> AckOutcome {
        if self.direction != Direction::Outbound || self.stage != MessageStage::Pubcomp {
            return AckOutcome::Ignored;
        }

        self.touch(now);
        AckOutcome::Completed
    }

    pub(crate) fn on_pubrel(&mut self, now: Instant) -> AckOutcome {
        if self.direction != Direction::Inbound || self.stage != MessageStage::Pubrel {
            return AckOutcome::Ignored;
        }

        self.touch(now);
        AckOutcome::Completed
    }

    /// Outbound QoS 2 records that have received PUBREC but not yet written PUBREL
    pub(crate) fn needs_pubrel(&self) -> bool {
        self.direction == Direction::Outbound && self.stage == MessageStage::Pubrel
    }

    /// True if the record needs PUBREL written and is not being held back after a failed persist
    pub(crate) fn is_pubrel_due(&self, now: Instant) -> bool {
        if !self.needs_pubrel() {
            return false;
        }

        match self.pubrel_hold {
            Some(hold_until) => { now >= hold_until }
            None => { true }
        }
    }

    /// Undoes the stage change of a PUBREL write that must not go out, and holds the record
    /// until `hold_until` before it is attempted again.
    pub(crate) fn hold_pubrel(&mut self, hold_until: Instant) {
        if self.direction != Direction::Outbound || self.stage != MessageStage::Pubcomp {
            return;
        }

        debug!("InflightMessage - {} packet id {} holding pubrel until a later attempt", self.direction, self.packet_id);
        self.stage = MessageStage::Pubrel;
        self.pubrel_hold = Some(hold_until);
    }

    /// Builds the packet that (re)sends the current stage's unacknowledged step and refreshes
    /// the record's timestamp.  Writing PUBREL moves an outbound record from `Pubrel` to `Pubcomp`.
    pub(crate) fn transmit(&mut self, now: Instant) -> OutboundPacket {
        let packet = match (self.direction, self.stage) {
            (Direction::Outbound, MessageStage::Pubrel) => {
                self.pubrel_hold = None;
                self.advance(MessageStage::Pubcomp, now);
                OutboundPacket::Pubrel(PubrelPacket {
                    packet_id: self.packet_id,
                    reason_code: 0,
                })
            }
            (Direction::Outbound, MessageStage::Pubcomp) => {
                OutboundPacket::Pubrel(PubrelPacket {
                    packet_id: self.packet_id,
                    reason_code: 0,
                })
            }
            (Direction::Outbound, _) => {
                let publish = OutboundPublish {
                    packet_id: self.packet_id,
                    qos: self.qos,
                    retain: self.retain,
                    duplicate: self.duplicate,
                    publication: self.publication.share(),
                    properties: self.remaining_properties(now),
                };

                self.duplicate = true;
                OutboundPacket::Publish(publish)
            }
            (Direction::Inbound, _) => {
                OutboundPacket::Pubrec(PubrecPacket {
                    packet_id: self.packet_id,
                    reason_code: 0,
                })
            }
        };

        self.touch(now);
        packet
    }

    /// True if the record has been written and has not progressed within the retry interval.
    /// A zero interval disables time-based retry.
    pub(crate) fn is_retry_due(&self, now: Instant, retry_interval: Duration) -> bool {
        if let Some(retry_time) = self.retry_time(retry_interval) {
            return now >= retry_time;
        }

        false
    }

    pub(crate) fn retry_time(&self, retry_interval: Duration) -> Option<Instant> {
        if retry_interval.is_zero() || !self.duplicate || self.needs_pubrel() {
            return None;
        }

        Some(self.last_touch + retry_interval)
    }

    /// MQTT5 message expiry deadline, if the record has one
    pub(crate) fn expiry_time(&self) -> Option<Instant> {
        if !self.protocol_version.supports_properties() {
            return None;
        }

        self.properties.message_expiry_interval_seconds.map(|interval| self.created + Duration::from_secs(interval as u64))
    }

    pub(crate) fn is_expired(&self, now: Instant) -> bool {
        if let Some(expiry_time) = self.expiry_time() {
            return now >= expiry_time;
        }

        false
    }

    // a resent MQTT5 publish carries the expiry interval that remains, not the original one
    fn remaining_properties(&self, now: Instant) -> MessageProperties {
        let mut properties = self.properties.clone();
        if let Some(expiry_time) = self.expiry_time() {
            let remaining = expiry_time.saturating_duration_since(now);
            properties.message_expiry_interval_seconds = Some(remaining.as_secs() as u32);
        }

        properties
    }

    fn advance(&mut self, next_stage: MessageStage, now: Instant) {
        debug!("InflightMessage - {} packet id {} advancing from {} to {}", self.direction, self.packet_id, self.stage, next_stage);
        self.stage = next_stage;
        self.touch(now);
    }

    fn touch(&mut self, now: Instant) {
        self.last_touch = now;
    }
}

impl fmt::Display for InflightMessage {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "InflightMessage {{")?;
        log_primitive_value!(self.direction, f, "direction");
        log_primitive_value!(self.packet_id, f, "packet_id");
        log_primitive_value!(self.qos, f, "qos");
        log_primitive_value!(self.stage, f, "stage");
        log_primitive_value!(self.duplicate, f, "duplicate");
        log_string!(self.publication.topic(), f, "topic");
        log_binary_data!(self.publication.payload(), f, "payload");
        log_primitive_value!(self.serialized_length, f, "serialized_length");
        write!(f, " }}")
    }
}

impl fmt::Debug for InflightMessage {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}

/// In-flight records for one direction of a session, iterated in enqueue order and indexed by
/// packet id.  Packet ids are unique within the queue.
pub struct InflightQueue {
    records: BTreeMap<u64, InflightMessage>,
    index: HashMap<u16, u64>,
    next_order: u64,
}

impl InflightQueue {
    pub(crate) fn new() -> Self {
        InflightQueue {
            records: BTreeMap::new(),
            index: HashMap::new(),
            next_order: 1,
        }
    }

    pub(crate) fn insert(&mut self, mut message: InflightMessage) -> SessionResult<()> {
        message.order = self.next_order;
        self.insert_restored(message)
    }

    /// Inserts a record that already carries its enqueue order (restored from persistence)
    pub(crate) fn insert_restored(&mut self, message: InflightMessage) -> SessionResult<()> {
        if self.index.contains_key(&message.packet_id) {
            error!("InflightQueue - packet id {} is already in flight", message.packet_id);
            return Err(SessionError::new_internal_state_error("packet id already bound to an in-flight record"));
        }

        if self.records.contains_key(&message.order) {
            return Err(SessionError::new_internal_state_error("enqueue order already in use"));
        }

        self.next_order = self.next_order.max(message.order + 1);
        self.index.insert(message.packet_id, message.order);
        self.records.insert(message.order, message);

        Ok(())
    }

    pub fn get(&self, packet_id: u16) -> Option<&InflightMessage> {
        self.index.get(&packet_id).and_then(|order| self.records.get(order))
    }

    pub(crate) fn get_mut(&mut self, packet_id: u16) -> Option<&mut InflightMessage> {
        if let Some(order) = self.index.get(&packet_id) {
            return self.records.get_mut(order);
        }

        None
    }

    pub(crate) fn remove(&mut self, packet_id: u16) -> Option<InflightMessage> {
        let order = self.index.remove(&packet_id)?;
        self.records.remove(&order)
    }

    pub fn contains(&self, packet_id: u16) -> bool {
        self.index.contains_key(&packet_id)
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Records in enqueue order
    pub fn iter(&self) -> impl Iterator<Item = &InflightMessage> {
        self.records.values()
    }

    pub(crate) fn iter_mut(&mut self) -> impl Iterator<Item = &mut InflightMessage> {
        self.records.values_mut()
    }

    /// Packet ids in enqueue order
    pub fn packet_ids(&self) -> Vec<u16> {
        self.records.values().map(|message| message.packet_id).collect()
    }

    /// Removes every record, in enqueue order
    pub(crate) fn drain(&mut self) -> Vec<InflightMessage> {
        self.index.clear();
        let records = std::mem::take(&mut self.records);
        records.into_values().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;

    fn build_outbound(packet_id: u16, qos: QualityOfService, now: Instant) -> InflightMessage {
        let publication = Publication::acquire("hello/world", "hello".as_bytes().to_vec());
        InflightMessage::new_outbound(packet_id, qos, false, ProtocolVersion::Mqtt5, MessageProperties::default(), publication, now).unwrap()
    }

    fn build_inbound_publish(packet_id: u16) -> InboundPublish {
        InboundPublish {
            packet_id,
            qos: QualityOfService::ExactlyOnce,
            retain: false,
            duplicate: false,
            topic: "inbound".to_string(),
            payload: vec![1, 2, 3],
            properties: MessageProperties::default(),
        }
    }

    #[test]
    fn qos1_outbound_handshake() {
        let now = Instant::now();
        let mut message = build_outbound(1, QualityOfService::AtLeastOnce, now);
        assert_eq!(MessageStage::Puback, message.stage());

        assert_eq!(AckOutcome::Ignored, message.on_pubrec(now));
        assert_eq!(AckOutcome::Ignored, message.on_pubcomp(now));
        assert_eq!(AckOutcome::Completed, message.on_puback(now));
    }

    #[test]
    fn qos2_outbound_handshake_never_skips_a_stage() {
        let now = Instant::now();
        let mut message = build_outbound(2, QualityOfService::ExactlyOnce, now);
        assert_eq!(MessageStage::Pubrec, message.stage());

        assert_matches!(message.transmit(now), OutboundPacket::Publish(_));
        assert_eq!(MessageStage::Pubrec, message.stage());

        // pubcomp before pubrec would skip two stages
        assert_eq!(AckOutcome::Ignored, message.on_pubcomp(now));
        assert_eq!(AckOutcome::Ignored, message.on_puback(now));
        assert_eq!(MessageStage::Pubrec, message.stage());

        assert_eq!(AckOutcome::Advanced, message.on_pubrec(now));
        assert_eq!(MessageStage::Pubrel, message.stage());
        assert!(message.needs_pubrel());

        // pubcomp before pubrel has been written would skip a stage
        assert_eq!(AckOutcome::Ignored, message.on_pubcomp(now));
        assert_eq!(MessageStage::Pubrel, message.stage());

        assert_matches!(message.transmit(now), OutboundPacket::Pubrel(PubrelPacket { packet_id: 2, .. }));
        assert_eq!(MessageStage::Pubcomp, message.stage());

        assert_eq!(AckOutcome::Completed, message.on_pubcomp(now));
    }

    #[test]
    fn duplicate_pubrec_is_idempotent() {
        let now = Instant::now();
        let mut message = build_outbound(3, QualityOfService::ExactlyOnce, now);
        message.transmit(now);

        assert_eq!(AckOutcome::Advanced, message.on_pubrec(now));
        assert_eq!(AckOutcome::Ignored, message.on_pubrec(now));
        assert_eq!(MessageStage::Pubrel, message.stage());

        message.transmit(now);
        assert_eq!(AckOutcome::Ignored, message.on_pubrec(now));
        assert_eq!(MessageStage::Pubcomp, message.stage());
    }

    #[test]
    fn transmit_sets_duplicate_after_first_write() {
        let now = Instant::now();
        let mut message = build_outbound(4, QualityOfService::AtLeastOnce, now);

        assert_matches!(message.transmit(now), OutboundPacket::Publish(OutboundPublish { duplicate: false, packet_id: 4, .. }));
        assert_matches!(message.transmit(now), OutboundPacket::Publish(OutboundPublish { duplicate: true, packet_id: 4, .. }));
    }

    #[test]
    fn transmit_shares_the_publication() {
        let now = Instant::now();
        let message = build_outbound(5, QualityOfService::AtLeastOnce, now);
        let tracker = message.publication().tracker();

        let mut message = message;
        let packet = message.transmit(now);
        assert_eq!(2, tracker.reference_count());

        drop(packet);
        assert_eq!(1, tracker.reference_count());

        drop(message);
        assert!(tracker.is_freed());
    }

    #[test]
    fn retry_timing() {
        let now = Instant::now();
        let retry_interval = Duration::from_secs(20);
        let mut message = build_outbound(6, QualityOfService::AtLeastOnce, now);

        // never written, nothing to retry
        assert!(!message.is_retry_due(now + Duration::from_secs(60), retry_interval));

        message.transmit(now);
        assert!(!message.is_retry_due(now + Duration::from_secs(19), retry_interval));
        assert!(message.is_retry_due(now + Duration::from_secs(20), retry_interval));
        assert!(!message.is_retry_due(now + Duration::from_secs(60), Duration::ZERO));

        let later = now + Duration::from_secs(20);
        message.transmit(later);
        assert_eq!(Some(later + retry_interval), message.retry_time(retry_interval));
    }

    #[test]
    fn expiry_only_applies_to_mqtt5() {
        let now = Instant::now();
        let properties = MessageProperties {
            message_expiry_interval_seconds: Some(5),
            ..Default::default()
        };

        let mut message = InflightMessage::new_outbound(7, QualityOfService::AtLeastOnce, false, ProtocolVersion::Mqtt5, properties.clone(), Publication::acquire("a", vec![]), now).unwrap();
        assert!(!message.is_expired(now + Duration::from_secs(4)));
        assert!(message.is_expired(now + Duration::from_secs(5)));

        if let OutboundPacket::Publish(publish) = message.transmit(now + Duration::from_secs(3)) {
            assert_eq!(Some(2), publish.properties.message_expiry_interval_seconds);
        } else {
            panic!("expected a publish");
        }

        let message = InflightMessage::new_outbound(8, QualityOfService::AtLeastOnce, false, ProtocolVersion::Mqtt311, properties, Publication::acquire("a", vec![]), now).unwrap();
        assert!(message.properties().is_empty());
        assert!(!message.is_expired(now + Duration::from_secs(3600)));
    }

    #[test]
    fn inbound_qos2_handshake() {
        let now = Instant::now();
        let publish = build_inbound_publish(9);
        let mut message = InflightMessage::new_inbound(&publish, ProtocolVersion::Mqtt311, Publication::acquire(&publish.topic, publish.payload.clone()), now).unwrap();

        assert_eq!(MessageStage::Pubrel, message.stage());
        assert_matches!(message.transmit(now), OutboundPacket::Pubrec(PubrecPacket { packet_id: 9, .. }));
        assert_eq!(AckOutcome::Ignored, message.on_pubrec(now));
        assert_eq!(AckOutcome::Completed, message.on_pubrel(now));
    }

    #[test]
    fn invalid_records_are_rejected() {
        let now = Instant::now();
        assert_matches!(InflightMessage::new_outbound(0, QualityOfService::AtLeastOnce, false, ProtocolVersion::Mqtt5, MessageProperties::default(), Publication::acquire("a", vec![]), now), Err(SessionError::InternalStateError(_)));
        assert_matches!(InflightMessage::new_outbound(1, QualityOfService::AtMostOnce, false, ProtocolVersion::Mqtt5, MessageProperties::default(), Publication::acquire("a", vec![]), now), Err(SessionError::InternalStateError(_)));

        let mut publish = build_inbound_publish(1);
        publish.qos = QualityOfService::AtLeastOnce;
        assert_matches!(InflightMessage::new_inbound(&publish, ProtocolVersion::Mqtt5, Publication::acquire("a", vec![]), now), Err(SessionError::InternalStateError(_)));
    }

    #[test]
    fn queue_preserves_enqueue_order_and_unique_ids() {
        let now = Instant::now();
        let mut queue = InflightQueue::new();

        for packet_id in [5, 3, 9, 1] {
            queue.insert(build_outbound(packet_id, QualityOfService::AtLeastOnce, now)).unwrap();
        }

        assert_matches!(queue.insert(build_outbound(3, QualityOfService::AtLeastOnce, now)), Err(SessionError::InternalStateError(_)));
        assert_eq!(vec![5, 3, 9, 1], queue.packet_ids());

        let removed = queue.remove(9).unwrap();
        assert_eq!(9, removed.packet_id());
        assert!(!queue.contains(9));
        assert_eq!(vec![5, 3, 1], queue.packet_ids());

        queue.insert(build_outbound(9, QualityOfService::AtLeastOnce, now)).unwrap();
        assert_eq!(vec![5, 3, 1, 9], queue.packet_ids());

        let drained : Vec<u16> = queue.drain().iter().map(|message| message.packet_id()).collect();
        assert_eq!(vec![5, 3, 1, 9], drained);
        assert!(queue.is_empty());
    }

    #[test]
    fn queue_restored_records_keep_their_order() {
        let now = Instant::now();
        let mut queue = InflightQueue::new();

        let mut later = build_outbound(2, QualityOfService::AtLeastOnce, now);
        later.order = 10;
        let mut earlier = build_outbound(7, QualityOfService::AtLeastOnce, now);
        earlier.order = 4;

        queue.insert_restored(later).unwrap();
        queue.insert_restored(earlier).unwrap();
        queue.insert(build_outbound(1, QualityOfService::AtLeastOnce, now)).unwrap();

        assert_eq!(vec![7, 2, 1], queue.packet_ids());
        assert_eq!(11, queue.get(1).unwrap().order);
    }
}

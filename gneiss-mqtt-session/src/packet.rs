/*
 * Copyright Bret Ambrose. All Rights Reserved.
 * SPDX-License-Identifier: Apache-2.0.
 */

/*!
Logical (already decoded) MQTT packets exchanged between the session and the packet codec
collaborator.  Byte-level encoding is the codec's concern; these types carry only what the
session layer reads or produces.
 */

use crate::logging::*;
use crate::mqtt::*;
use crate::publication::Publication;
use crate::will::WillMessage;

use std::fmt;

/// Connect packet built by the session when the transport reaches the CONNACK-wait stage
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct ConnectPacket {
    pub protocol_version: ProtocolVersion,
    pub client_id: String,
    pub username: Option<String>,
    pub password: Option<Vec<u8>>,

    /// Clean start for MQTT5, clean session for 3.x
    pub clean_start: bool,
    pub keep_alive_interval_seconds: u16,

    /// MQTT5 only
    pub session_expiry_interval_seconds: Option<u32>,
    pub will: Option<WillMessage>,
}

/// Outbound publish.  The topic and payload are shared with the in-flight record, never copied.
#[derive(Clone, Debug)]
pub struct OutboundPublish {
    pub packet_id: u16,
    pub qos: QualityOfService,
    pub retain: bool,
    pub duplicate: bool,
    pub publication: Publication,
    pub properties: MessageProperties,
}

/// Subscription within a Subscribe packet
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Subscription {
    pub topic_filter: String,
    pub qos: QualityOfService,
}

impl Subscription {
    pub fn new(topic_filter: &str, qos: QualityOfService) -> Self {
        Subscription {
            topic_filter: topic_filter.to_string(),
            qos,
        }
    }
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct SubscribePacket {
    pub packet_id: u16,
    pub subscriptions: Vec<Subscription>,
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct UnsubscribePacket {
    pub packet_id: u16,
    pub topic_filters: Vec<String>,
}

#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct DisconnectPacket {
    pub reason_code: u8,

    /// MQTT5 only
    pub session_expiry_interval_seconds: Option<u32>,
}

#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct PubackPacket {
    pub packet_id: u16,
    pub reason_code: u8,
}

#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct PubrecPacket {
    pub packet_id: u16,
    pub reason_code: u8,
}

#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct PubrelPacket {
    pub packet_id: u16,
    pub reason_code: u8,
}

#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct PubcompPacket {
    pub packet_id: u16,
    pub reason_code: u8,
}

/// Connack as seen by the session
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct ConnackPacket {
    pub session_present: bool,

    /// Connect return code (3.x) or connect reason code (5).  Zero is success.
    pub reason_code: u8,

    /// MQTT5 only; overrides the keep alive interval the session asked for
    pub server_keep_alive: Option<u16>,
    pub assigned_client_identifier: Option<String>,
}

impl ConnackPacket {
    pub fn is_success(&self) -> bool {
        self.reason_code == 0
    }
}

/// Publish received from the broker
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct InboundPublish {
    pub packet_id: u16,
    pub qos: QualityOfService,
    pub retain: bool,
    pub duplicate: bool,
    pub topic: String,
    pub payload: Vec<u8>,
    pub properties: MessageProperties,
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct SubackPacket {
    pub packet_id: u16,
    pub reason_codes: Vec<u8>,
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct UnsubackPacket {
    pub packet_id: u16,
    pub reason_codes: Vec<u8>,
}

/// Packets the session hands to the codec for encoding
#[derive(Clone, Debug)]
pub enum OutboundPacket {
    Connect(ConnectPacket),
    Publish(OutboundPublish),
    Puback(PubackPacket),
    Pubrec(PubrecPacket),
    Pubrel(PubrelPacket),
    Pubcomp(PubcompPacket),
    Subscribe(SubscribePacket),
    Unsubscribe(UnsubscribePacket),
    Pingreq,
    Disconnect(DisconnectPacket),
}

impl OutboundPacket {
    pub fn packet_type(&self) -> PacketType {
        match self {
            OutboundPacket::Connect(_) => { PacketType::Connect }
            OutboundPacket::Publish(_) => { PacketType::Publish }
            OutboundPacket::Puback(_) => { PacketType::Puback }
            OutboundPacket::Pubrec(_) => { PacketType::Pubrec }
            OutboundPacket::Pubrel(_) => { PacketType::Pubrel }
            OutboundPacket::Pubcomp(_) => { PacketType::Pubcomp }
            OutboundPacket::Subscribe(_) => { PacketType::Subscribe }
            OutboundPacket::Unsubscribe(_) => { PacketType::Unsubscribe }
            OutboundPacket::Pingreq => { PacketType::Pingreq }
            OutboundPacket::Disconnect(_) => { PacketType::Disconnect }
        }
    }

    /// Packet id carried by the packet, if its kind has one
    pub fn packet_id(&self) -> Option<u16> {
        match self {
            OutboundPacket::Publish(publish) => {
                if publish.qos == QualityOfService::AtMostOnce {
                    None
                } else {
                    Some(publish.packet_id)
                }
            }
            OutboundPacket::Puback(puback) => { Some(puback.packet_id) }
            OutboundPacket::Pubrec(pubrec) => { Some(pubrec.packet_id) }
            OutboundPacket::Pubrel(pubrel) => { Some(pubrel.packet_id) }
            OutboundPacket::Pubcomp(pubcomp) => { Some(pubcomp.packet_id) }
            OutboundPacket::Subscribe(subscribe) => { Some(subscribe.packet_id) }
            OutboundPacket::Unsubscribe(unsubscribe) => { Some(unsubscribe.packet_id) }
            _ => { None }
        }
    }
}

/// Packets the codec produces from incoming bytes
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum InboundPacket {
    Connack(ConnackPacket),
    Publish(InboundPublish),
    Puback(PubackPacket),
    Pubrec(PubrecPacket),
    Pubrel(PubrelPacket),
    Pubcomp(PubcompPacket),
    Suback(SubackPacket),
    Unsuback(UnsubackPacket),
    Pingresp,
    Disconnect(DisconnectPacket),
}

impl InboundPacket {
    pub fn packet_type(&self) -> PacketType {
        match self {
            InboundPacket::Connack(_) => { PacketType::Connack }
            InboundPacket::Publish(_) => { PacketType::Publish }
            InboundPacket::Puback(_) => { PacketType::Puback }
            InboundPacket::Pubrec(_) => { PacketType::Pubrec }
            InboundPacket::Pubrel(_) => { PacketType::Pubrel }
            InboundPacket::Pubcomp(_) => { PacketType::Pubcomp }
            InboundPacket::Suback(_) => { PacketType::Suback }
            InboundPacket::Unsuback(_) => { PacketType::Unsuback }
            InboundPacket::Pingresp => { PacketType::Pingresp }
            InboundPacket::Disconnect(_) => { PacketType::Disconnect }
        }
    }
}

define_ack_packet_display_trait!(PubackPacket, "PubackPacket");
define_ack_packet_display_trait!(PubrecPacket, "PubrecPacket");
define_ack_packet_display_trait!(PubrelPacket, "PubrelPacket");
define_ack_packet_display_trait!(PubcompPacket, "PubcompPacket");

impl fmt::Display for ConnectPacket {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "ConnectPacket {{")?;
        log_primitive_value!(self.protocol_version, f, "protocol_version");
        log_string!(self.client_id, f, "client_id");
        log_optional_string!(self.username, f, "username", value);
        log_optional_binary_data_sensitive!(self.password, f, "password");
        log_primitive_value!(self.clean_start, f, "clean_start");
        log_primitive_value!(self.keep_alive_interval_seconds, f, "keep_alive_interval_seconds");
        log_optional_primitive_value!(self.session_expiry_interval_seconds, f, "session_expiry_interval_seconds", value);
        log_optional_primitive_value!(self.will, f, "will", value);
        write!(f, " }}")
    }
}

impl fmt::Display for OutboundPublish {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "PublishPacket {{")?;
        log_primitive_value!(self.packet_id, f, "packet_id");
        log_primitive_value!(self.qos, f, "qos");
        log_primitive_value!(self.retain, f, "retain");
        log_primitive_value!(self.duplicate, f, "duplicate");
        log_string!(self.publication.topic(), f, "topic");
        log_binary_data!(self.publication.payload(), f, "payload");
        log_message_properties!(self.properties, f);
        write!(f, " }}")
    }
}

impl fmt::Display for InboundPublish {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "PublishPacket {{")?;
        log_primitive_value!(self.packet_id, f, "packet_id");
        log_primitive_value!(self.qos, f, "qos");
        log_primitive_value!(self.retain, f, "retain");
        log_primitive_value!(self.duplicate, f, "duplicate");
        log_string!(self.topic, f, "topic");
        log_binary_data!(self.payload, f, "payload");
        log_message_properties!(self.properties, f);
        write!(f, " }}")
    }
}

impl fmt::Display for SubscribePacket {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "SubscribePacket {{")?;
        log_primitive_value!(self.packet_id, f, "packet_id");
        write!(f, " subscriptions: [")?;
        for subscription in &self.subscriptions {
            write!(f, " (\"{}\", {})", subscription.topic_filter, subscription.qos)?;
        }
        write!(f, " ] }}")
    }
}

impl fmt::Display for UnsubscribePacket {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "UnsubscribePacket {{")?;
        log_primitive_value!(self.packet_id, f, "packet_id");
        write!(f, " topic_filters: [")?;
        for topic_filter in &self.topic_filters {
            write!(f, " \"{}\"", topic_filter)?;
        }
        write!(f, " ] }}")
    }
}

impl fmt::Display for DisconnectPacket {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "DisconnectPacket {{")?;
        log_primitive_value!(self.reason_code, f, "reason_code");
        log_optional_primitive_value!(self.session_expiry_interval_seconds, f, "session_expiry_interval_seconds", value);
        write!(f, " }}")
    }
}

impl fmt::Display for ConnackPacket {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "ConnackPacket {{")?;
        log_primitive_value!(self.session_present, f, "session_present");
        log_primitive_value!(self.reason_code, f, "reason_code");
        log_optional_primitive_value!(self.server_keep_alive, f, "server_keep_alive", value);
        log_optional_string!(self.assigned_client_identifier, f, "assigned_client_identifier", value);
        write!(f, " }}")
    }
}

impl fmt::Display for SubackPacket {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "SubackPacket {{")?;
        log_primitive_value!(self.packet_id, f, "packet_id");
        log_primitive_value!(create_reason_codes_log_string(&self.reason_codes), f, "reason_codes");
        write!(f, " }}")
    }
}

impl fmt::Display for UnsubackPacket {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "UnsubackPacket {{")?;
        log_primitive_value!(self.packet_id, f, "packet_id");
        log_primitive_value!(create_reason_codes_log_string(&self.reason_codes), f, "reason_codes");
        write!(f, " }}")
    }
}

impl fmt::Display for OutboundPacket {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            OutboundPacket::Connect(packet) => { packet.fmt(f) }
            OutboundPacket::Publish(packet) => { packet.fmt(f) }
            OutboundPacket::Puback(packet) => { packet.fmt(f) }
            OutboundPacket::Pubrec(packet) => { packet.fmt(f) }
            OutboundPacket::Pubrel(packet) => { packet.fmt(f) }
            OutboundPacket::Pubcomp(packet) => { packet.fmt(f) }
            OutboundPacket::Subscribe(packet) => { packet.fmt(f) }
            OutboundPacket::Unsubscribe(packet) => { packet.fmt(f) }
            OutboundPacket::Pingreq => { write!(f, "PingreqPacket {{ }}") }
            OutboundPacket::Disconnect(packet) => { packet.fmt(f) }
        }
    }
}

impl fmt::Display for InboundPacket {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            InboundPacket::Connack(packet) => { packet.fmt(f) }
            InboundPacket::Publish(packet) => { packet.fmt(f) }
            InboundPacket::Puback(packet) => { packet.fmt(f) }
            InboundPacket::Pubrec(packet) => { packet.fmt(f) }
            InboundPacket::Pubrel(packet) => { packet.fmt(f) }
            InboundPacket::Pubcomp(packet) => { packet.fmt(f) }
            InboundPacket::Suback(packet) => { packet.fmt(f) }
            InboundPacket::Unsuback(packet) => { packet.fmt(f) }
            InboundPacket::Pingresp => { write!(f, "PingrespPacket {{ }}") }
            InboundPacket::Disconnect(packet) => { packet.fmt(f) }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn connect_display_redacts_password() {
        let connect = ConnectPacket {
            protocol_version: ProtocolVersion::Mqtt5,
            client_id: "device-1".to_string(),
            username: Some("user".to_string()),
            password: Some("hunter2".as_bytes().to_vec()),
            clean_start: true,
            keep_alive_interval_seconds: 30,
            session_expiry_interval_seconds: Some(3600),
            will: None,
        };

        let rendered = connect.to_string();
        assert!(rendered.contains("client_id:\"device-1\""));
        assert!(rendered.contains("password:<...redacted>"));
        assert!(!rendered.contains("hunter2"));
    }

    #[test]
    fn publish_display_logs_payload_length_only() {
        let publish = OutboundPublish {
            packet_id: 7,
            qos: QualityOfService::ExactlyOnce,
            retain: false,
            duplicate: true,
            publication: Publication::acquire("a/b", "hello".as_bytes().to_vec()),
            properties: MessageProperties {
                message_expiry_interval_seconds: Some(10),
                ..Default::default()
            },
        };

        let rendered = publish.to_string();
        assert!(rendered.contains("packet_id:7"));
        assert!(rendered.contains("payload:<5 Bytes>"));
        assert!(rendered.contains("message_expiry_interval_seconds:10"));
        assert!(!rendered.contains("hello"));
    }

    #[test]
    fn outbound_packet_ids() {
        let qos0 = OutboundPacket::Publish(OutboundPublish {
            packet_id: 0,
            qos: QualityOfService::AtMostOnce,
            retain: false,
            duplicate: false,
            publication: Publication::acquire("a", vec![]),
            properties: MessageProperties::default(),
        });

        assert_eq!(None, qos0.packet_id());
        assert_eq!(Some(3), OutboundPacket::Pubrel(PubrelPacket { packet_id: 3, reason_code: 0 }).packet_id());
        assert_eq!(None, OutboundPacket::Pingreq.packet_id());
        assert_eq!(PacketType::Pingreq, OutboundPacket::Pingreq.packet_type());
    }
}

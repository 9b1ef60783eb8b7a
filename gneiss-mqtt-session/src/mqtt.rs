/*
 * Copyright Bret Ambrose. All Rights Reserved.
 * SPDX-License-Identifier: Apache-2.0.
 */

/*!
Module containing the MQTT protocol vocabulary the session layer works in terms of: quality of
service, protocol versions, packet kinds, and the MQTT5 message property set carried by
in-flight publishes.
 */

use crate::error::{SessionError, SessionResult};

use log::*;
use std::fmt;

/// MQTT message delivery quality of service.
///
/// Enum values match [MQTT5 spec](https://docs.oasis-open.org/mqtt/mqtt/v5.0/os/mqtt-v5.0-os.html#_Toc3901234) encoding values.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Hash, PartialOrd, Ord)]
pub enum QualityOfService {

    /// The message is delivered according to the capabilities of the underlying network. No response is sent by the
    /// receiver and no retry is performed by the sender. The message arrives at the receiver either once or not at all.
    #[default]
    AtMostOnce = 0,

    /// A level of service that ensures that the message arrives at the receiver at least once.
    AtLeastOnce = 1,

    /// A level of service that ensures that the message arrives at the receiver exactly once.
    ExactlyOnce = 2,
}

impl TryFrom<u8> for QualityOfService {
    type Error = SessionError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => { Ok(QualityOfService::AtMostOnce) }
            1 => { Ok(QualityOfService::AtLeastOnce) }
            2 => { Ok(QualityOfService::ExactlyOnce) }
            _ => {
                error!("QualityOfService::try_from - invalid value {}", value);
                Err(SessionError::new_decoding_failure("invalid quality of service value"))
            }
        }
    }
}

impl fmt::Display for QualityOfService {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            QualityOfService::AtMostOnce => { write!(f, "AtMostOnce") }
            QualityOfService::AtLeastOnce => { write!(f, "AtLeastOnce") }
            QualityOfService::ExactlyOnce => { write!(f, "ExactlyOnce") }
        }
    }
}

/// MQTT protocol revision in effect for a session.
///
/// Enum values match the protocol level byte of the Connect packet.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Hash)]
pub enum ProtocolVersion {

    /// MQTT 3.1
    Mqtt31 = 3,

    /// MQTT 3.1.1
    #[default]
    Mqtt311 = 4,

    /// MQTT 5
    Mqtt5 = 5,
}

impl ProtocolVersion {

    /// Returns true if the protocol version supports packet properties (message expiry,
    /// user properties, session expiry, etc...)
    pub fn supports_properties(&self) -> bool {
        *self == ProtocolVersion::Mqtt5
    }
}

impl TryFrom<u8> for ProtocolVersion {
    type Error = SessionError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            3 => { Ok(ProtocolVersion::Mqtt31) }
            4 => { Ok(ProtocolVersion::Mqtt311) }
            5 => { Ok(ProtocolVersion::Mqtt5) }
            _ => {
                error!("ProtocolVersion::try_from - invalid value {}", value);
                Err(SessionError::new_decoding_failure("invalid protocol version value"))
            }
        }
    }
}

impl fmt::Display for ProtocolVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProtocolVersion::Mqtt31 => { write!(f, "3.1") }
            ProtocolVersion::Mqtt311 => { write!(f, "3.1.1") }
            ProtocolVersion::Mqtt5 => { write!(f, "5") }
        }
    }
}

/// Optional property describing a PUBLISH payload's format.
///
/// Enum values match [MQTT5 spec](https://docs.oasis-open.org/mqtt/mqtt/v5.0/os/mqtt-v5.0-os.html#_Toc3901111) encoding values.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub enum PayloadFormatIndicator {

    /// The payload is arbitrary binary data
    #[default]
    Bytes = 0,

    /// The payload is a well-formed utf-8 string value.
    Utf8 = 1,
}

impl TryFrom<u8> for PayloadFormatIndicator {
    type Error = SessionError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => { Ok(PayloadFormatIndicator::Bytes) }
            1 => { Ok(PayloadFormatIndicator::Utf8) }
            _ => {
                error!("PayloadFormatIndicator::try_from - invalid value {}", value);
                Err(SessionError::new_decoding_failure("invalid payload format indicator value"))
            }
        }
    }
}

impl fmt::Display for PayloadFormatIndicator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PayloadFormatIndicator::Bytes => { write!(f, "Bytes") }
            PayloadFormatIndicator::Utf8 => { write!(f, "Utf8") }
        }
    }
}

/// A user property is a name-value pair of utf-8 strings that can be added to mqtt5 packets. Names are
/// not unique; a given name value can appear more than once in a packet.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct UserProperty {

    /// User property name
    pub name: String,

    /// User property value
    pub value: String,
}

/// MQTT5 properties attached to a publish.  Ignored (and never persisted) for 3.x sessions.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct MessageProperties {

    /// Property specifying the format of the payload data.
    pub payload_format: Option<PayloadFormatIndicator>,

    /// Sent publishes - indicates the maximum amount of time allowed to elapse for message delivery before the
    /// message is discarded.
    pub message_expiry_interval_seconds: Option<u32>,

    /// Property specifying the content type of the payload.
    pub content_type: Option<String>,

    /// Opaque topic string intended to assist with request/response implementations.
    pub response_topic: Option<String>,

    /// Opaque binary data used to correlate between publish messages, as a potential method for request-response
    /// implementation.
    pub correlation_data: Option<Vec<u8>>,

    /// Set of MQTT5 user properties included with the packet.
    pub user_properties: Option<Vec<UserProperty>>,
}

impl MessageProperties {

    /// Returns true if no property is set
    pub fn is_empty(&self) -> bool {
        self.payload_format.is_none() &&
            self.message_expiry_interval_seconds.is_none() &&
            self.content_type.is_none() &&
            self.response_topic.is_none() &&
            self.correlation_data.is_none() &&
            self.user_properties.is_none()
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
/// An enum indicating the kind of MQTT packet
pub enum PacketType {
    /// A Connect packet
    Connect,

    /// A Connack packet
    Connack,

    /// A Publish packet
    Publish,

    /// A Puback packet
    Puback,

    /// A Pubrec packet
    Pubrec,

    /// A Pubrel packet
    Pubrel,

    /// A Pubcomp packet
    Pubcomp,

    /// A Subscribe packet
    Subscribe,

    /// A Suback packet
    Suback,

    /// An Unsubscribe packet
    Unsubscribe,

    /// An Unsuback packet
    Unsuback,

    /// A Pingreq packet
    Pingreq,

    /// A Pingresp packet
    Pingresp,

    /// A Disconnect packet
    Disconnect,
}

impl fmt::Display for PacketType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PacketType::Connect => { write!(f, "ConnectPacket") }
            PacketType::Connack => { write!(f, "ConnackPacket") }
            PacketType::Publish => { write!(f, "PublishPacket") }
            PacketType::Puback => { write!(f, "PubackPacket") }
            PacketType::Pubrec => { write!(f, "PubrecPacket") }
            PacketType::Pubrel => { write!(f, "PubrelPacket") }
            PacketType::Pubcomp => { write!(f, "PubcompPacket") }
            PacketType::Subscribe => { write!(f, "SubscribePacket") }
            PacketType::Suback => { write!(f, "SubackPacket") }
            PacketType::Unsubscribe => { write!(f, "UnsubscribePacket") }
            PacketType::Unsuback => { write!(f, "UnsubackPacket") }
            PacketType::Pingreq => { write!(f, "PingreqPacket") }
            PacketType::Pingresp => { write!(f, "PingrespPacket") }
            PacketType::Disconnect => { write!(f, "DisconnectPacket") }
        }
    }
}

pub(crate) fn convert_u8_to_quality_of_service(value: u8) -> SessionResult<QualityOfService> {
    QualityOfService::try_from(value)
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;

    #[test]
    fn quality_of_service_conversion() {
        assert_eq!(QualityOfService::AtMostOnce, convert_u8_to_quality_of_service(0).unwrap());
        assert_eq!(QualityOfService::AtLeastOnce, convert_u8_to_quality_of_service(1).unwrap());
        assert_eq!(QualityOfService::ExactlyOnce, convert_u8_to_quality_of_service(2).unwrap());
        assert_matches!(convert_u8_to_quality_of_service(3), Err(SessionError::DecodingFailure(_)));
    }

    #[test]
    fn protocol_version_conversion() {
        assert_eq!(ProtocolVersion::Mqtt31, ProtocolVersion::try_from(3).unwrap());
        assert_eq!(ProtocolVersion::Mqtt311, ProtocolVersion::try_from(4).unwrap());
        assert_eq!(ProtocolVersion::Mqtt5, ProtocolVersion::try_from(5).unwrap());
        assert_matches!(ProtocolVersion::try_from(6), Err(SessionError::DecodingFailure(_)));

        assert!(ProtocolVersion::Mqtt5.supports_properties());
        assert!(!ProtocolVersion::Mqtt311.supports_properties());
    }

    #[test]
    fn message_properties_is_empty() {
        let mut properties = MessageProperties::default();
        assert!(properties.is_empty());

        properties.correlation_data = Some(vec![1, 2, 3]);
        assert!(!properties.is_empty());
    }
}

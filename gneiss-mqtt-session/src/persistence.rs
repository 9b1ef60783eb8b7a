/*
 * Copyright Bret Ambrose. All Rights Reserved.
 * SPDX-License-Identifier: Apache-2.0.
 */

/*!
Durable storage of in-flight records.

The storage backend is supplied by the application through [`PersistenceStore`].  Records are
written in a small versioned binary layout (big-endian integers, length-prefixed strings) and may
be passed through optional [`RecordTransform`]s right before they are written and right after
they are read back, e.g. to encrypt them at rest.

Keys combine the client id, the record's direction and its packet id:

| Direction | MQTT 3.x | MQTT 5 |
|---|---|---|
| Outbound | `<client id>/s-<packet id>` | `<client id>/s5-<packet id>` |
| Inbound | `<client id>/r-<packet id>` | `<client id>/r5-<packet id>` |
 */

use crate::error::{SessionError, SessionResult};
use crate::message::{Direction, InflightMessage, MessageStage};
use crate::mqtt::*;
use crate::publication::Publication;

use log::*;
use std::error::Error;
use std::fmt;
use std::sync::Arc;
use std::time::Instant;

const RECORD_FORMAT_VERSION : u8 = 1;

const DIRECTION_OUTBOUND : u8 = 0;
const DIRECTION_INBOUND : u8 = 1;

const PROPERTY_PAYLOAD_FORMAT : u8 = 1 << 0;
const PROPERTY_MESSAGE_EXPIRY : u8 = 1 << 1;
const PROPERTY_CONTENT_TYPE : u8 = 1 << 2;
const PROPERTY_RESPONSE_TOPIC : u8 = 1 << 3;
const PROPERTY_CORRELATION_DATA : u8 = 1 << 4;
const PROPERTY_USER_PROPERTIES : u8 = 1 << 5;

// format, direction, qos, retain, duplicate, protocol version, stage, packet id, order, mask
const RECORD_FIXED_LENGTH : usize = 1 + 1 + 1 + 1 + 1 + 1 + 1 + 2 + 8 + 4;

/// Error type returned by persistence collaborators
pub type PersistenceError = Box<dyn Error + Send + Sync + 'static>;

/// Identifies one persisted in-flight record
#[derive(Clone, Debug, Eq, PartialEq, Hash)]
pub struct PersistenceKey {
    client_id: String,
    direction: Direction,
    mqtt5: bool,
    packet_id: u16,
}

impl PersistenceKey {
    pub fn new(client_id: &str, direction: Direction, protocol_version: ProtocolVersion, packet_id: u16) -> Self {
        PersistenceKey {
            client_id: client_id.to_string(),
            direction,
            mqtt5: protocol_version.supports_properties(),
            packet_id,
        }
    }

    pub(crate) fn for_message(client_id: &str, message: &InflightMessage) -> Self {
        PersistenceKey::new(client_id, message.direction, message.protocol_version, message.packet_id)
    }

    /// Parses a key produced by this crate.  Returns None for anything else.
    pub fn parse(key: &str) -> Option<PersistenceKey> {
        let (client_id, record_id) = key.rsplit_once('/')?;
        let (prefix, packet_id) = record_id.split_once('-')?;

        let (direction, mqtt5) = match prefix {
            "s" => { (Direction::Outbound, false) }
            "s5" => { (Direction::Outbound, true) }
            "r" => { (Direction::Inbound, false) }
            "r5" => { (Direction::Inbound, true) }
            _ => { return None; }
        };

        let packet_id = packet_id.parse::<u16>().ok()?;
        if packet_id == 0 {
            return None;
        }

        Some(PersistenceKey {
            client_id: client_id.to_string(),
            direction,
            mqtt5,
            packet_id,
        })
    }

    pub fn client_id(&self) -> &str {
        self.client_id.as_str()
    }

    pub fn direction(&self) -> Direction {
        self.direction
    }

    pub fn packet_id(&self) -> u16 {
        self.packet_id
    }

    pub fn is_mqtt5(&self) -> bool {
        self.mqtt5
    }
}

impl fmt::Display for PersistenceKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let direction = match self.direction {
            Direction::Outbound => { "s" }
            Direction::Inbound => { "r" }
        };

        let version = if self.mqtt5 { "5" } else { "" };

        write!(f, "{}/{}{}-{}", self.client_id, direction, version, self.packet_id)
    }
}

/// Storage backend for persisted records.  Implementations own the actual disk or database
/// operations; the session only moves opaque byte records through them.
pub trait PersistenceStore : Send {
    fn put(&mut self, key: &str, record: Vec<u8>) -> Result<(), PersistenceError>;

    /// Returns None if no record is stored under the key
    fn get(&mut self, key: &str) -> Result<Option<Vec<u8>>, PersistenceError>;

    fn delete(&mut self, key: &str) -> Result<(), PersistenceError>;

    fn keys(&mut self) -> Result<Vec<String>, PersistenceError>;
}

/// Transformation applied to a serialized record just before it is written or just after it is
/// read.  Any closure with a matching signature implements it.
pub trait RecordTransform : Send + Sync {
    fn transform(&self, key: &PersistenceKey, record: Vec<u8>) -> Result<Vec<u8>, PersistenceError>;
}

impl<F> RecordTransform for F where F : Fn(&PersistenceKey, Vec<u8>) -> Result<Vec<u8>, PersistenceError> + Send + Sync {
    fn transform(&self, key: &PersistenceKey, record: Vec<u8>) -> Result<Vec<u8>, PersistenceError> {
        self(key, record)
    }
}

/// A session's persistence handle: the store plus the optional before-write and after-read hooks
pub struct SessionPersistence {
    store: Box<dyn PersistenceStore>,
    before_write: Option<Arc<dyn RecordTransform>>,
    after_read: Option<Arc<dyn RecordTransform>>,
}

impl SessionPersistence {
    pub fn new(store: Box<dyn PersistenceStore>) -> Self {
        SessionPersistence {
            store,
            before_write: None,
            after_read: None,
        }
    }

    /// Sets the transform invoked on every record immediately before it is written
    pub fn with_before_write(mut self, transform: Arc<dyn RecordTransform>) -> Self {
        self.before_write = Some(transform);
        self
    }

    /// Sets the transform invoked on every record immediately after it is read back
    pub fn with_after_read(mut self, transform: Arc<dyn RecordTransform>) -> Self {
        self.after_read = Some(transform);
        self
    }

    pub(crate) fn write_record(&mut self, client_id: &str, message: &InflightMessage) -> SessionResult<()> {
        let key = PersistenceKey::for_message(client_id, message);

        let mut record = Vec::with_capacity(message.serialized_length);
        encode_record(message, &mut record).map_err(|error| SessionError::new_persistence_failure(Some(key.clone()), error))?;

        if let Some(before_write) = &self.before_write {
            record = before_write.transform(&key, record).map_err(|error| {
                warn!("write_record - before-write transform failed for {}: {}", key, error);
                SessionError::new_persistence_failure(Some(key.clone()), error)
            })?;
        }

        self.store.put(key.to_string().as_str(), record).map_err(|error| {
            warn!("write_record - store rejected {}: {}", key, error);
            SessionError::new_persistence_failure(Some(key.clone()), error)
        })?;

        debug!("write_record - persisted {}", key);
        Ok(())
    }

    pub(crate) fn remove_record(&mut self, client_id: &str, message: &InflightMessage) -> SessionResult<()> {
        let key = PersistenceKey::for_message(client_id, message);

        self.store.delete(key.to_string().as_str()).map_err(|error| {
            warn!("remove_record - failed to delete {}: {}", key, error);
            SessionError::new_persistence_failure(Some(key.clone()), error)
        })
    }

    /// Reads back every record stored for a client, ordered by original enqueue order.
    /// Records that cannot be read are reported individually and skipped.
    pub(crate) fn restore(&mut self, client_id: &str, now: Instant) -> (Vec<InflightMessage>, Vec<SessionError>) {
        let mut messages = Vec::new();
        let mut errors = Vec::new();

        let keys = match self.store.keys() {
            Ok(keys) => { keys }
            Err(error) => {
                error!("restore - failed to enumerate persisted records: {}", error);
                errors.push(SessionError::new_persistence_failure(None, error));
                return (messages, errors);
            }
        };

        for key_string in keys {
            let Some(key) = PersistenceKey::parse(key_string.as_str()) else {
                continue;
            };

            if key.client_id != client_id {
                continue;
            }

            match self.restore_record(&key, key_string.as_str(), now) {
                Ok(Some(message)) => {
                    messages.push(message);
                }
                Ok(None) => {}
                Err(error) => {
                    warn!("restore - skipping record {}: {}", key, error);
                    errors.push(error);
                }
            }
        }

        messages.sort_by_key(|message| message.order);
        info!("restore - restored {} in-flight records for client \"{}\"", messages.len(), client_id);

        (messages, errors)
    }

    /// Deletes every record stored for a client
    pub(crate) fn clear(&mut self, client_id: &str) -> SessionResult<()> {
        let keys = self.store.keys().map_err(|error| SessionError::new_persistence_failure(None, error))?;

        let mut result = Ok(());
        for key_string in keys {
            if let Some(key) = PersistenceKey::parse(key_string.as_str()) {
                if key.client_id == client_id {
                    if let Err(error) = self.store.delete(key_string.as_str()) {
                        warn!("clear - failed to delete {}: {}", key, error);
                        result = Err(SessionError::new_persistence_failure(Some(key), error));
                    }
                }
            }
        }

        result
    }

    fn restore_record(&mut self, key: &PersistenceKey, key_string: &str, now: Instant) -> SessionResult<Option<InflightMessage>> {
        let record = self.store.get(key_string).map_err(|error| SessionError::new_persistence_failure(Some(key.clone()), error))?;
        let Some(mut record) = record else {
            return Ok(None);
        };

        if let Some(after_read) = &self.after_read {
            record = after_read.transform(key, record).map_err(|error| SessionError::new_persistence_failure(Some(key.clone()), error))?;
        }

        let message = decode_record(record.as_slice(), now).map_err(|error| SessionError::new_persistence_failure(Some(key.clone()), error))?;
        if message.direction != key.direction || message.packet_id != key.packet_id || message.protocol_version.supports_properties() != key.mqtt5 {
            return Err(SessionError::new_persistence_failure(Some(key.clone()), "record contents do not match its key"));
        }

        Ok(Some(message))
    }
}

fn compute_length_prefixed_length(value: &[u8]) -> usize {
    2 + value.len()
}

fn compute_optional_length_prefixed_length(value: &Option<impl AsRef<[u8]>>) -> usize {
    value.as_ref().map_or(0, |value| compute_length_prefixed_length(value.as_ref()))
}

fn compute_properties_length(properties: &MessageProperties) -> usize {
    let mut length = 1;

    if properties.payload_format.is_some() {
        length += 1;
    }

    if properties.message_expiry_interval_seconds.is_some() {
        length += 4;
    }

    length += compute_optional_length_prefixed_length(&properties.content_type);
    length += compute_optional_length_prefixed_length(&properties.response_topic);
    length += compute_optional_length_prefixed_length(&properties.correlation_data);

    if let Some(user_properties) = &properties.user_properties {
        length += 2;
        for property in user_properties {
            length += compute_length_prefixed_length(property.name.as_bytes());
            length += compute_length_prefixed_length(property.value.as_bytes());
        }
    }

    length
}

/// Size of a record's persisted representation
pub(crate) fn compute_record_length(message: &InflightMessage) -> usize {
    RECORD_FIXED_LENGTH
        + compute_length_prefixed_length(message.publication.topic().as_bytes())
        + 4 + message.publication.payload().len()
        + compute_properties_length(&message.properties)
}

fn encode_length_prefixed_bytes(value: &[u8], dest: &mut Vec<u8>) -> SessionResult<()> {
    let length : u16 = value.len().try_into().map_err(|_| SessionError::new_encoding_failure("length-prefixed value too long"))?;
    dest.extend_from_slice(&length.to_be_bytes());
    dest.extend_from_slice(value);
    Ok(())
}

fn encode_record(message: &InflightMessage, dest: &mut Vec<u8>) -> SessionResult<()> {
    dest.push(RECORD_FORMAT_VERSION);
    dest.push(match message.direction {
        Direction::Outbound => { DIRECTION_OUTBOUND }
        Direction::Inbound => { DIRECTION_INBOUND }
    });
    dest.push(message.qos as u8);
    dest.push(message.retain as u8);
    dest.push(message.duplicate as u8);
    dest.push(message.protocol_version as u8);
    dest.push(message.stage as u8);
    dest.extend_from_slice(&message.packet_id.to_be_bytes());
    dest.extend_from_slice(&message.order.to_be_bytes());
    dest.extend_from_slice(&message.publication.mask());

    encode_length_prefixed_bytes(message.publication.topic().as_bytes(), dest)?;

    let payload = message.publication.payload();
    let payload_length : u32 = payload.len().try_into().map_err(|_| SessionError::new_encoding_failure("payload too long"))?;
    dest.extend_from_slice(&payload_length.to_be_bytes());
    dest.extend_from_slice(payload);

    let properties = &message.properties;
    let mut property_flags = 0;
    if properties.payload_format.is_some() { property_flags |= PROPERTY_PAYLOAD_FORMAT; }
    if properties.message_expiry_interval_seconds.is_some() { property_flags |= PROPERTY_MESSAGE_EXPIRY; }
    if properties.content_type.is_some() { property_flags |= PROPERTY_CONTENT_TYPE; }
    if properties.response_topic.is_some() { property_flags |= PROPERTY_RESPONSE_TOPIC; }
    if properties.correlation_data.is_some() { property_flags |= PROPERTY_CORRELATION_DATA; }
    if properties.user_properties.is_some() { property_flags |= PROPERTY_USER_PROPERTIES; }
    dest.push(property_flags);

    if let Some(payload_format) = properties.payload_format {
        dest.push(payload_format as u8);
    }

    if let Some(message_expiry_interval_seconds) = properties.message_expiry_interval_seconds {
        dest.extend_from_slice(&message_expiry_interval_seconds.to_be_bytes());
    }

    if let Some(content_type) = &properties.content_type {
        encode_length_prefixed_bytes(content_type.as_bytes(), dest)?;
    }

    if let Some(response_topic) = &properties.response_topic {
        encode_length_prefixed_bytes(response_topic.as_bytes(), dest)?;
    }

    if let Some(correlation_data) = &properties.correlation_data {
        encode_length_prefixed_bytes(correlation_data.as_slice(), dest)?;
    }

    if let Some(user_properties) = &properties.user_properties {
        let count : u16 = user_properties.len().try_into().map_err(|_| SessionError::new_encoding_failure("too many user properties"))?;
        dest.extend_from_slice(&count.to_be_bytes());
        for property in user_properties {
            encode_length_prefixed_bytes(property.name.as_bytes(), dest)?;
            encode_length_prefixed_bytes(property.value.as_bytes(), dest)?;
        }
    }

    Ok(())
}

fn split_bytes(bytes: &[u8], length: usize) -> SessionResult<(&[u8], &[u8])> {
    if bytes.len() < length {
        error!("Record Decode - record truncated");
        return Err(SessionError::new_decoding_failure("persisted record truncated"));
    }

    Ok(bytes.split_at(length))
}

fn decode_u8<'a>(bytes: &'a[u8], value: &mut u8) -> SessionResult<&'a[u8]> {
    let (value_bytes, remaining) = split_bytes(bytes, 1)?;
    *value = value_bytes[0];
    Ok(remaining)
}

fn decode_bool<'a>(bytes: &'a[u8], value: &mut bool) -> SessionResult<&'a[u8]> {
    let mut byte = 0;
    let remaining = decode_u8(bytes, &mut byte)?;
    match byte {
        0 => { *value = false; }
        1 => { *value = true; }
        _ => {
            error!("Record Decode - invalid boolean value {}", byte);
            return Err(SessionError::new_decoding_failure("invalid boolean value"));
        }
    }

    Ok(remaining)
}

fn decode_u16<'a>(bytes: &'a[u8], value: &mut u16) -> SessionResult<&'a[u8]> {
    let (value_bytes, remaining) = split_bytes(bytes, 2)?;
    *value = u16::from_be_bytes([value_bytes[0], value_bytes[1]]);
    Ok(remaining)
}

fn decode_u32<'a>(bytes: &'a[u8], value: &mut u32) -> SessionResult<&'a[u8]> {
    let (value_bytes, remaining) = split_bytes(bytes, 4)?;
    let mut buffer = [0u8; 4];
    buffer.copy_from_slice(value_bytes);
    *value = u32::from_be_bytes(buffer);
    Ok(remaining)
}

fn decode_u64<'a>(bytes: &'a[u8], value: &mut u64) -> SessionResult<&'a[u8]> {
    let (value_bytes, remaining) = split_bytes(bytes, 8)?;
    let mut buffer = [0u8; 8];
    buffer.copy_from_slice(value_bytes);
    *value = u64::from_be_bytes(buffer);
    Ok(remaining)
}

fn decode_length_prefixed_bytes<'a>(bytes: &'a[u8], value: &mut Vec<u8>) -> SessionResult<&'a[u8]> {
    let mut length : u16 = 0;
    let remaining = decode_u16(bytes, &mut length)?;
    let (value_bytes, remaining) = split_bytes(remaining, length as usize)?;
    *value = value_bytes.to_vec();
    Ok(remaining)
}

fn decode_length_prefixed_string<'a>(bytes: &'a[u8], value: &mut String) -> SessionResult<&'a[u8]> {
    let mut length : u16 = 0;
    let remaining = decode_u16(bytes, &mut length)?;
    let (value_bytes, remaining) = split_bytes(remaining, length as usize)?;
    *value = std::str::from_utf8(value_bytes)?.to_string();
    Ok(remaining)
}

fn decode_properties<'a>(bytes: &'a[u8], properties: &mut MessageProperties) -> SessionResult<&'a[u8]> {
    let mut property_flags = 0;
    let mut mutable_bytes = decode_u8(bytes, &mut property_flags)?;

    if property_flags & PROPERTY_PAYLOAD_FORMAT != 0 {
        let mut payload_format = 0;
        mutable_bytes = decode_u8(mutable_bytes, &mut payload_format)?;
        properties.payload_format = Some(PayloadFormatIndicator::try_from(payload_format)?);
    }

    if property_flags & PROPERTY_MESSAGE_EXPIRY != 0 {
        let mut message_expiry_interval_seconds = 0;
        mutable_bytes = decode_u32(mutable_bytes, &mut message_expiry_interval_seconds)?;
        properties.message_expiry_interval_seconds = Some(message_expiry_interval_seconds);
    }

    if property_flags & PROPERTY_CONTENT_TYPE != 0 {
        let mut content_type = String::new();
        mutable_bytes = decode_length_prefixed_string(mutable_bytes, &mut content_type)?;
        properties.content_type = Some(content_type);
    }

    if property_flags & PROPERTY_RESPONSE_TOPIC != 0 {
        let mut response_topic = String::new();
        mutable_bytes = decode_length_prefixed_string(mutable_bytes, &mut response_topic)?;
        properties.response_topic = Some(response_topic);
    }

    if property_flags & PROPERTY_CORRELATION_DATA != 0 {
        let mut correlation_data = Vec::new();
        mutable_bytes = decode_length_prefixed_bytes(mutable_bytes, &mut correlation_data)?;
        properties.correlation_data = Some(correlation_data);
    }

    if property_flags & PROPERTY_USER_PROPERTIES != 0 {
        let mut count : u16 = 0;
        mutable_bytes = decode_u16(mutable_bytes, &mut count)?;

        let mut user_properties = Vec::with_capacity(count as usize);
        for _ in 0..count {
            let mut property = UserProperty::default();
            mutable_bytes = decode_length_prefixed_string(mutable_bytes, &mut property.name)?;
            mutable_bytes = decode_length_prefixed_string(mutable_bytes, &mut property.value)?;
            user_properties.push(property);
        }

        properties.user_properties = Some(user_properties);
    }

    Ok(mutable_bytes)
}

fn validate_stage(direction: Direction, qos: QualityOfService, stage: MessageStage) -> SessionResult<()> {
    let valid = match (direction, qos) {
        (Direction::Outbound, QualityOfService::AtLeastOnce) => {
            stage == MessageStage::Puback
        }
        (Direction::Outbound, QualityOfService::ExactlyOnce) => {
            matches!(stage, MessageStage::Pubrec | MessageStage::Pubrel | MessageStage::Pubcomp)
        }
        (Direction::Inbound, QualityOfService::ExactlyOnce) => {
            stage == MessageStage::Pubrel
        }
        _ => { false }
    };

    if !valid {
        error!("Record Decode - stage {} is not valid for a {} qos {} record", stage, direction, qos);
        return Err(SessionError::new_decoding_failure("record stage inconsistent with its direction and qos"));
    }

    Ok(())
}

fn decode_record(bytes: &[u8], now: Instant) -> SessionResult<InflightMessage> {
    let mut format_version = 0;
    let mut mutable_bytes = decode_u8(bytes, &mut format_version)?;
    if format_version != RECORD_FORMAT_VERSION {
        error!("Record Decode - unsupported record format version {}", format_version);
        return Err(SessionError::new_decoding_failure("unsupported record format version"));
    }

    let mut direction_byte = 0;
    mutable_bytes = decode_u8(mutable_bytes, &mut direction_byte)?;
    let direction = match direction_byte {
        DIRECTION_OUTBOUND => { Direction::Outbound }
        DIRECTION_INBOUND => { Direction::Inbound }
        _ => {
            return Err(SessionError::new_decoding_failure("invalid record direction"));
        }
    };

    let mut qos_byte = 0;
    mutable_bytes = decode_u8(mutable_bytes, &mut qos_byte)?;
    let qos = convert_u8_to_quality_of_service(qos_byte)?;

    let mut retain = false;
    mutable_bytes = decode_bool(mutable_bytes, &mut retain)?;

    let mut duplicate = false;
    mutable_bytes = decode_bool(mutable_bytes, &mut duplicate)?;

    let mut version_byte = 0;
    mutable_bytes = decode_u8(mutable_bytes, &mut version_byte)?;
    let protocol_version = ProtocolVersion::try_from(version_byte)?;

    let mut stage_byte = 0;
    mutable_bytes = decode_u8(mutable_bytes, &mut stage_byte)?;
    let stage = MessageStage::try_from(stage_byte)?;
    validate_stage(direction, qos, stage)?;

    let mut packet_id = 0;
    mutable_bytes = decode_u16(mutable_bytes, &mut packet_id)?;
    if packet_id == 0 {
        return Err(SessionError::new_decoding_failure("persisted record has a zero packet id"));
    }

    let mut order = 0;
    mutable_bytes = decode_u64(mutable_bytes, &mut order)?;

    let (mask_bytes, remaining) = split_bytes(mutable_bytes, 4)?;
    let mask = [mask_bytes[0], mask_bytes[1], mask_bytes[2], mask_bytes[3]];
    mutable_bytes = remaining;

    let mut topic = String::new();
    mutable_bytes = decode_length_prefixed_string(mutable_bytes, &mut topic)?;

    let mut payload_length = 0;
    mutable_bytes = decode_u32(mutable_bytes, &mut payload_length)?;
    let (payload, remaining) = split_bytes(mutable_bytes, payload_length as usize)?;
    mutable_bytes = remaining;

    let mut properties = MessageProperties::default();
    mutable_bytes = decode_properties(mutable_bytes, &mut properties)?;

    if !mutable_bytes.is_empty() {
        error!("Record Decode - {} unexpected bytes after record", mutable_bytes.len());
        return Err(SessionError::new_decoding_failure("unexpected bytes after persisted record"));
    }

    let mut message = InflightMessage {
        direction,
        qos,
        retain,
        packet_id,
        protocol_version,
        properties,
        publication: Publication::acquire_with_mask(topic.as_str(), payload.to_vec(), mask),
        created: now,
        last_touch: now,
        stage,
        duplicate,
        serialized_length: 0,
        order,
        queue_sequence: None,
        pubrel_hold: None,
    };

    message.serialized_length = compute_record_length(&message);
    Ok(message)
}

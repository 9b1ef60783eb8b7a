/*
 * Copyright Bret Ambrose. All Rights Reserved.
 * SPDX-License-Identifier: Apache-2.0.
 */

use crate::mqtt::*;
use log::*;
use std::fmt;
use std::fmt::Write;

impl fmt::Display for UserProperty {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "({}, {}) ", self.name, self.value)
    }
}

pub(crate) fn create_user_properties_log_string(properties: &Vec<UserProperty>) -> String {
    let mut val : String = "[ ".to_string();
    for property in properties {
        write!(&mut val, " (\"{}\",\"{}\")", property.name, property.value).ok();
    }
    write!(&mut val, " ]").ok();
    val
}

pub(crate) fn create_reason_codes_log_string(reason_codes: &[u8]) -> String {
    let mut val : String = "[".to_string();
    for reason_code in reason_codes {
        write!(&mut val, " {}", reason_code).ok();
    }
    write!(&mut val, " ]").ok();
    val
}

macro_rules! log_primitive_value {
    ($integral_value: expr, $formatter: expr, $log_field: expr) => {
        write!($formatter, " {}:{}", $log_field, $integral_value)?;
    };
}

pub(crate) use log_primitive_value;

macro_rules! log_optional_primitive_value {
    ($optional_integral_value: expr, $formatter: expr, $log_field: expr, $value: ident) => {
        if let Some($value) = &$optional_integral_value {
            write!($formatter, " {}:{}", $log_field, $value)?;
        }
    };
}

pub(crate) use log_optional_primitive_value;

macro_rules! log_string {
    ($value: expr, $formatter: expr, $log_field: expr) => {
        write!($formatter, " {}:\"{}\"", $log_field, $value)?;
    };
}

pub(crate) use log_string;

macro_rules! log_optional_string {
    ($optional_string: expr, $formatter: expr, $log_field: expr, $value:ident) => {
        if let Some($value) = &$optional_string {
            write!($formatter, " {}:\"{}\"", $log_field, $value)?;
        }
    };
}

pub(crate) use log_optional_string;

macro_rules! log_binary_data {
    ($data: expr, $formatter: expr, $log_field: expr) => {
        write!($formatter, " {}:<{} Bytes>", $log_field, $data.len())?;
    };
}

pub(crate) use log_binary_data;

macro_rules! log_optional_binary_data {
    ($optional_data: expr, $formatter: expr, $log_field: expr, $value:ident) => {
        if let Some($value) = &$optional_data {
            write!($formatter, " {}:<{} Bytes>",  $log_field, $value.len())?;
        }
    };
}

pub(crate) use log_optional_binary_data;

macro_rules! log_optional_binary_data_sensitive {
    ($optional_data: expr, $formatter: expr, $log_field: expr) => {
        if let Some(_) = &$optional_data {
            write!($formatter, " {}:<...redacted>", $log_field)?;
        }
    };
}

pub(crate) use log_optional_binary_data_sensitive;

macro_rules! log_user_properties {
    ($user_properties: expr, $formatter: expr, $log_field: expr, $value:ident) => {
        if let Some($value) = &$user_properties {
            write!($formatter, " {}:{}", $log_field, create_user_properties_log_string($value))?;
        }
    };
}

pub(crate) use log_user_properties;

macro_rules! log_message_properties {
    ($properties: expr, $formatter: expr) => {
        log_optional_primitive_value!($properties.payload_format, $formatter, "payload_format", value);
        log_optional_primitive_value!($properties.message_expiry_interval_seconds, $formatter, "message_expiry_interval_seconds", value);
        log_optional_string!($properties.content_type, $formatter, "content_type", value);
        log_optional_string!($properties.response_topic, $formatter, "response_topic", value);
        log_optional_binary_data!($properties.correlation_data, $formatter, "correlation_data", value);
        log_user_properties!($properties.user_properties, $formatter, "user_properties", value);
    };
}

pub(crate) use log_message_properties;

macro_rules! define_ack_packet_display_trait {
    ($packet_type: ident, $packet_name: expr) => {
        impl fmt::Display for $packet_type {
            fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
                write!(f, "{} {{", $packet_name)?;
                log_primitive_value!(self.packet_id, f, "packet_id");
                log_primitive_value!(self.reason_code, f, "reason_code");
                write!(f, " }}")
            }
        }
    };
}

pub(crate) use define_ack_packet_display_trait;

/// Logs the packet kind at Info and the full packet rendering at Debug/Trace
pub(crate) fn log_packet<T>(prefix: &str, packet_type: PacketType, packet: &T) where T : fmt::Display {
    let level = log::max_level();
    match level {
        LevelFilter::Info => {
            info!("{}{}{{...}}", prefix, packet_type);
        }
        LevelFilter::Debug | LevelFilter::Trace => {
            debug!("{}{}", prefix, packet);
        }
        _ => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn user_properties_log_string() {
        let properties = vec!(
            UserProperty { name: "hello".to_string(), value: "world".to_string() },
            UserProperty { name: "key".to_string(), value: "value".to_string() },
        );

        assert_eq!("[  (\"hello\",\"world\") (\"key\",\"value\") ]", create_user_properties_log_string(&properties));
    }

    #[test]
    fn reason_codes_log_string() {
        assert_eq!("[ 0 1 128 ]", create_reason_codes_log_string(&[0, 1, 128]));
        assert_eq!("[ ]", create_reason_codes_log_string(&[]));
    }
}

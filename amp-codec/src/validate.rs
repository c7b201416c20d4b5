//! Structural checks applied around deserialisation.

use amp_primitives::{
    ErrorPayload, Message, MessageType, PROTOCOL_NAME, RequestPayload, ResponsePayload,
};
use serde_json::{Map, Value};

use crate::{CodecError, CodecResult};

/// Splits an `AMP/<major>.<minor>` marker and checks the major version.
pub(crate) fn check_protocol(marker: &str, supported_major: u32) -> CodecResult<()> {
    let unsupported = || CodecError::UnsupportedProtocolVersion {
        marker: marker.to_owned(),
    };

    let (name, version) = marker.split_once('/').ok_or_else(unsupported)?;
    if name != PROTOCOL_NAME {
        return Err(unsupported());
    }
    let (major, minor) = version.split_once('.').ok_or_else(unsupported)?;
    let major: u32 = major.parse().map_err(|_| unsupported())?;
    minor.parse::<u32>().map_err(|_| unsupported())?;

    if major == supported_major {
        Ok(())
    } else {
        Err(unsupported())
    }
}

/// Checks envelope fields that must be present before the message is typed.
///
/// Returns the protocol marker and the inner message object.
pub(crate) fn split_envelope(root: &Value) -> CodecResult<(&str, &Map<String, Value>)> {
    let root = root
        .as_object()
        .ok_or_else(|| CodecError::schema("$", "envelope must be an object"))?;

    let marker = root
        .get("protocol")
        .ok_or_else(|| CodecError::schema("protocol", "field is required"))?
        .as_str()
        .ok_or_else(|| CodecError::schema("protocol", "must be a string"))?;

    let message = root
        .get("message")
        .ok_or_else(|| CodecError::schema("message", "field is required"))?
        .as_object()
        .ok_or_else(|| CodecError::schema("message", "must be an object"))?;

    Ok((marker, message))
}

/// Checks presence and primitive type of required message fields.
pub(crate) fn check_required(message: &Map<String, Value>) -> CodecResult<()> {
    for field in ["id", "type", "timestamp"] {
        match message.get(field) {
            None => return Err(CodecError::schema(format!("message.{field}"), "field is required")),
            Some(Value::String(s)) if !s.is_empty() => {}
            Some(_) => {
                return Err(CodecError::schema(
                    format!("message.{field}"),
                    "must be a non-empty string",
                ));
            }
        }
    }

    if !message.contains_key("payload") {
        return Err(CodecError::schema("message.payload", "field is required"));
    }

    for field in ["source", "destination", "headers"] {
        if let Some(value) = message.get(field) {
            if !value.is_object() {
                return Err(CodecError::schema(
                    format!("message.{field}"),
                    "must be an object",
                ));
            }
        }
    }

    Ok(())
}

/// Checks the payload shape demanded by the message type.
pub(crate) fn check_payload(message: &Message) -> CodecResult<()> {
    let shape = |err: serde_json::Error| CodecError::schema("message.payload", err.to_string());

    match message.kind {
        MessageType::Request => {
            message.payload_as::<RequestPayload>().map_err(shape)?;
        }
        MessageType::Response => {
            require_correlation(message)?;
            message.payload_as::<ResponsePayload>().map_err(shape)?;
        }
        MessageType::Error => {
            require_correlation(message)?;
            message.payload_as::<ErrorPayload>().map_err(shape)?;
        }
        MessageType::Event => {
            if !message.payload.is_object() {
                return Err(CodecError::schema("message.payload", "must be an object"));
            }
        }
    }
    Ok(())
}

fn require_correlation(message: &Message) -> CodecResult<()> {
    match message.headers.correlation_id.as_deref() {
        Some(id) if !id.is_empty() => Ok(()),
        _ => Err(CodecError::schema(
            "message.headers.correlation_id",
            format!("required for {} messages", message.kind.as_str()),
        )),
    }
}

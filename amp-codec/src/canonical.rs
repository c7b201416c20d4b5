//! Canonical JSON rendering and the message signing string.

use std::fmt::Write as _;

use amp_primitives::Message;
use chrono::SecondsFormat;
use serde_json::Value;

/// Renders `value` as compact JSON with object keys sorted at every depth.
///
/// Output does not depend on whether `serde_json/preserve_order` is enabled.
#[must_use]
pub fn canonical_json(value: &Value) -> String {
    let mut out = String::new();
    write_value(&mut out, value);
    out
}

fn write_value(out: &mut String, value: &Value) {
    match value {
        Value::Object(map) => {
            let mut entries: Vec<_> = map.iter().collect();
            entries.sort_unstable_by(|(a, _), (b, _)| a.cmp(b));
            out.push('{');
            for (index, (key, item)) in entries.into_iter().enumerate() {
                if index > 0 {
                    out.push(',');
                }
                let _ = write!(out, "{}", Value::String(key.clone()));
                out.push(':');
                write_value(out, item);
            }
            out.push('}');
        }
        Value::Array(items) => {
            out.push('[');
            for (index, item) in items.iter().enumerate() {
                if index > 0 {
                    out.push(',');
                }
                write_value(out, item);
            }
            out.push(']');
        }
        scalar => {
            let _ = write!(out, "{scalar}");
        }
    }
}

/// Builds the string covered by message signatures: canonical payload,
/// message id, millisecond RFC 3339 timestamp, source agent id (empty when
/// absent) and replay nonce, separated by newlines.
#[must_use]
pub fn signing_string(message: &Message) -> String {
    format!(
        "{}\n{}\n{}\n{}\n{}",
        canonical_json(&message.payload),
        message.id,
        message
            .timestamp
            .to_rfc3339_opts(SecondsFormat::Millis, true),
        message
            .source
            .agent_id
            .as_ref()
            .map_or("", |agent| agent.as_str()),
        message.nonce()
    )
}

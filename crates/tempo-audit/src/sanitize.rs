//! JSON-safe sanitization of audit payloads.
//!
//! Sanitization never fails: a value whose serialization fails is replaced
//! by an `<unserializable:Type>` tag, nesting past the depth cap is
//! replaced by a marker string, a failure inside the sanitizer itself is
//! stored as `{"error": <reason>}`, and re-sanitizing any output is a
//! no-op.

use serde::Serialize;
use serde_json::{json, Map, Value};
use tempo_proto::Appointment;

/// Nesting depth cap for stored payloads.
pub const MAX_DEPTH: usize = 10;

/// Marker stored in place of over-deep nesting.
fn depth_marker(kind: &str) -> Value {
    Value::String(format!("<max_depth_exceeded:{kind}>"))
}

/// The base type name, without path or generic parameters.
fn type_label<T: ?Sized>() -> &'static str {
    let name = std::any::type_name::<T>();
    let base = name.split('<').next().unwrap_or(name);
    base.rsplit("::").next().unwrap_or(base)
}

/// Serialize any value into a sanitized JSON payload. A value whose
/// serialization fails becomes the `<unserializable:Type>` tag.
pub fn sanitize_field<T: Serialize>(value: &T) -> Value {
    match serde_json::to_value(value) {
        Ok(raw) => sanitize_value(&raw),
        Err(_) => Value::String(format!("<unserializable:{}>", type_label::<T>())),
    }
}

/// Depth-cap an already-JSON value. Idempotent. A failure inside the
/// sanitizer itself is stored as `{"error": <reason>}` instead of
/// escalating; the walk is currently infallible, so the guard is the
/// contract for anything fallible added to it.
pub fn sanitize_value(value: &Value) -> Value {
    match try_sanitize(value) {
        Ok(sanitized) => sanitized,
        Err(reason) => json!({"error": reason}),
    }
}

fn try_sanitize(value: &Value) -> Result<Value, String> {
    Ok(sanitize_at(value, 0))
}

fn sanitize_at(value: &Value, depth: usize) -> Value {
    match value {
        Value::Object(map) => {
            if depth >= MAX_DEPTH {
                return depth_marker("object");
            }
            let mut out = Map::with_capacity(map.len());
            for (key, val) in map {
                out.insert(key.clone(), sanitize_at(val, depth + 1));
            }
            Value::Object(out)
        }
        Value::Array(items) => {
            if depth >= MAX_DEPTH {
                return depth_marker("array");
            }
            Value::Array(items.iter().map(|v| sanitize_at(v, depth + 1)).collect())
        }
        other => other.clone(),
    }
}

/// Identifying projection of an appointment for audit payloads: enough to
/// find the record again, never the full event.
pub fn project_appointment(appointment: &Appointment) -> Value {
    json!({
        "_model_type": "Appointment",
        "_table_name": "appointments",
        "id": appointment.id,
        "external_id": appointment.external_id,
        "subject": appointment.subject,
        "start": appointment.start.to_rfc3339(),
        "end": appointment.end.to_rfc3339(),
    })
}

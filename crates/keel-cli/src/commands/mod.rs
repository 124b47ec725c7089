pub mod cluster;
pub mod keys;
pub mod watch;

use keel_client::ChangeInfo;
use serde_json::{json, Map, Value};

/// JSON view of a change, omitting unknown fields.
pub fn change_json(info: &ChangeInfo) -> Value {
    let mut out = Map::new();
    if let Some(action) = &info.action {
        out.insert("action".into(), json!(action.to_string()));
    }
    if let Some(key) = &info.key {
        out.insert("key".into(), json!(key));
    }
    if let Some(value) = &info.value {
        out.insert("value".into(), json!(value));
    }
    if let Some(index) = info.index {
        out.insert("index".into(), json!(index));
    }
    if let Some(new_key) = info.new_key {
        out.insert("newKey".into(), json!(new_key));
    }
    if let Some(dir) = info.dir {
        out.insert("dir".into(), json!(dir));
    }
    if let Some(prev) = &info.previous_value {
        out.insert("prevValue".into(), json!(prev));
    }
    if let Some(ttl) = info.ttl {
        out.insert("ttl".into(), json!(ttl));
    }
    if let Some(expiration) = info.expiration {
        out.insert("expiration".into(), json!(expiration.to_rfc3339()));
    }
    Value::Object(out)
}

/// One-line text view of a change.
pub fn change_line(info: &ChangeInfo) -> String {
    let mut line = format!(
        "[{}] {} {}",
        info.index.map(|i| i.to_string()).unwrap_or_else(|| "-".into()),
        info.action.as_ref().map(|a| a.to_string()).unwrap_or_else(|| "change".into()),
        info.key.as_deref().unwrap_or("?"),
    );
    if let Some(value) = &info.value {
        line.push_str(&format!(" = {value}"));
    }
    if let Some(prev) = &info.previous_value {
        line.push_str(&format!(" (was {prev})"));
    }
    line
}

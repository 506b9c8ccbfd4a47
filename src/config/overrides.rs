//! Dot-path overrides applied to the raw configuration document.
//!
//! An override address is a dot-delimited path into the document: integer
//! segments index into sequences, string segments into maps. Missing
//! intermediate containers are materialized with the type implied by the
//! segment, and sequences are extended with empty slots as needed.
//! Application is order-dependent across overrides but idempotent for a
//! single `(address, value)` pair.
//!
//! # Examples
//!
//! ```
//! use stableflow::config::{apply_override, Override};
//!
//! let mut doc = serde_json::json!({"host": {"localhost": {"acct_run": "alice"}}});
//! apply_override(&mut doc, "host.localhost.acct_run", serde_json::json!("bob")).unwrap();
//! assert_eq!(doc["host"]["localhost"]["acct_run"], "bob");
//!
//! // Integer segments index sequences and materialize missing slots.
//! let mut doc = serde_json::json!({});
//! let over = Override::parse("node.0.cfg.port=9000").unwrap();
//! apply_override(&mut doc, &over.addr, over.value).unwrap();
//! assert_eq!(doc["node"][0]["cfg"]["port"], 9000);
//! ```

use serde_json::Value;

use super::ConfigError;

/// One `(address, value)` override.
#[derive(Clone, Debug, PartialEq)]
pub struct Override {
    pub addr: String,
    pub value: Value,
}

impl Override {
    /// Parse the CLI form `addr=value`. The value parses as a JSON scalar
    /// when possible and falls back to a bare string.
    pub fn parse(text: &str) -> Result<Self, ConfigError> {
        let (addr, raw) = text
            .split_once('=')
            .ok_or_else(|| ConfigError::at(text, "override must have the form addr=value"))?;
        if addr.is_empty() {
            return Err(ConfigError::at(text, "override address is empty"));
        }
        let value = serde_json::from_str(raw).unwrap_or_else(|_| Value::String(raw.to_string()));
        Ok(Self {
            addr: addr.to_string(),
            value,
        })
    }
}

enum Seg<'a> {
    Index(usize),
    Key(&'a str),
}

fn segments(addr: &str) -> Result<Vec<Seg<'_>>, ConfigError> {
    if addr.is_empty() {
        return Err(ConfigError::at(addr, "empty override address"));
    }
    addr.split('.')
        .map(|part| {
            if part.is_empty() {
                return Err(ConfigError::at(addr, "empty segment in override address"));
            }
            Ok(match part.parse::<usize>() {
                Ok(index) => Seg::Index(index),
                Err(_) => Seg::Key(part),
            })
        })
        .collect()
}

/// Container access for one segment: materializes `Null` into the implied
/// container and rejects a mismatched existing one.
fn enter<'a>(
    node: &'a mut Value,
    seg: &Seg<'_>,
    prefix: &str,
) -> Result<&'a mut Value, ConfigError> {
    match seg {
        Seg::Key(key) => {
            if node.is_null() {
                *node = Value::Object(serde_json::Map::new());
            }
            let map = node.as_object_mut().ok_or_else(|| {
                ConfigError::at(prefix, "string segment does not address a map")
            })?;
            Ok(map.entry((*key).to_string()).or_insert(Value::Null))
        }
        Seg::Index(index) => {
            if node.is_null() {
                *node = Value::Array(Vec::new());
            }
            let seq = node.as_array_mut().ok_or_else(|| {
                ConfigError::at(prefix, "integer segment does not address a sequence")
            })?;
            while seq.len() <= *index {
                seq.push(Value::Null);
            }
            Ok(&mut seq[*index])
        }
    }
}

/// Apply one override to the document.
pub fn apply_override(doc: &mut Value, addr: &str, value: Value) -> Result<(), ConfigError> {
    let segs = segments(addr)?;
    let mut node = doc;
    let mut walked: Vec<&str> = Vec::with_capacity(segs.len());
    for seg in &segs {
        let prefix = walked.join(".");
        node = enter(node, seg, &prefix)?;
        walked.push(match seg {
            Seg::Key(key) => key,
            Seg::Index(_) => "?",
        });
    }
    *node = value;
    Ok(())
}

/// Apply an ordered list of overrides.
pub fn apply_overrides(doc: &mut Value, overrides: &[Override]) -> Result<(), ConfigError> {
    for over in overrides {
        apply_override(doc, &over.addr, over.value.clone())?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn replaces_existing_scalar() {
        let mut doc = json!({"host": {"localhost": {"acct_run": "alice"}}});
        apply_override(&mut doc, "host.localhost.acct_run", json!("bob")).unwrap();
        assert_eq!(doc["host"]["localhost"]["acct_run"], "bob");
    }

    #[test]
    fn extends_sequences_with_empty_slots() {
        let mut doc = json!({"node": []});
        apply_override(&mut doc, "node.2.id_node", json!("late")).unwrap();
        assert_eq!(doc["node"][0], Value::Null);
        assert_eq!(doc["node"][1], Value::Null);
        assert_eq!(doc["node"][2]["id_node"], "late");
    }

    #[test]
    fn materializes_by_next_segment_type() {
        let mut doc = json!({});
        apply_override(&mut doc, "a.0.b", json!(1)).unwrap();
        assert!(doc["a"].is_array());
        assert!(doc["a"][0].is_object());
    }

    #[test]
    fn rejects_type_conflicts() {
        let mut doc = json!({"node": {"not": "a list"}});
        let err = apply_override(&mut doc, "node.0.x", json!(1)).unwrap_err();
        assert_eq!(err.path(), "node");
    }

    #[test]
    fn single_override_is_idempotent() {
        let mut once = json!({});
        apply_override(&mut once, "system.tick_period_ms", json!(50)).unwrap();
        let mut twice = json!({});
        apply_override(&mut twice, "system.tick_period_ms", json!(50)).unwrap();
        apply_override(&mut twice, "system.tick_period_ms", json!(50)).unwrap();
        assert_eq!(once, twice);
    }

    #[test]
    fn parse_scalar_values() {
        assert_eq!(Override::parse("a.b=9000").unwrap().value, json!(9000));
        assert_eq!(Override::parse("a.b=bob").unwrap().value, json!("bob"));
        assert_eq!(Override::parse("a.b=true").unwrap().value, json!(true));
        assert!(Override::parse("no-equals").is_err());
    }
}

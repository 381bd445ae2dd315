//! Shadowing policy.
//!
//! # Responsibilities
//! - Decide which (client index, key) pairs get shadow traffic
//! - Track live range updates published through runtime vars
//!
//! # Design Decisions
//! - The policy data is an immutable snapshot swapped atomically; route
//!   handles read it once per request
//! - A malformed runtime-vars update is logged and ignored; the previous
//!   snapshot stays in force

use std::sync::{Arc, RwLock};

use serde_json::Value;

use crate::config::ConfigError;
use crate::runtime_vars::{ObservableRuntimeVars, RuntimeVarsData, SubscriptionHandle};

/// How shadow traffic is produced. Only the default fire-and-forget policy
/// is defined today.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ShadowType {
    #[default]
    Default,
}

/// Immutable policy snapshot.
#[derive(Debug, Clone, PartialEq)]
pub struct ShadowData {
    pub start_index: usize,
    pub end_index: usize,
    pub start_key_fraction: f64,
    pub end_key_fraction: f64,
    pub shadow_pool: Option<String>,
    pub shadow_type: ShadowType,
    pub validate_replies: bool,
    pub index_range_rv: String,
    pub key_fraction_range_rv: String,
}

impl Default for ShadowData {
    fn default() -> Self {
        Self {
            start_index: 0,
            end_index: 0,
            start_key_fraction: 0.0,
            end_key_fraction: 0.0,
            shadow_pool: None,
            shadow_type: ShadowType::Default,
            validate_replies: false,
            index_range_rv: String::new(),
            key_fraction_range_rv: String::new(),
        }
    }
}

fn check_logic(cond: bool, msg: &str) -> Result<(), ConfigError> {
    if cond {
        Ok(())
    } else {
        Err(ConfigError::Logic(msg.to_string()))
    }
}

fn parse_index_range(value: &Value) -> Result<(usize, usize), ConfigError> {
    let arr = value
        .as_array()
        .ok_or_else(|| ConfigError::Logic("index_range is not an array".into()))?;
    check_logic(arr.len() == 2, "index_range size is not 2")?;
    let start = arr[0]
        .as_u64()
        .ok_or_else(|| ConfigError::Logic("start_index is not a non-negative int".into()))?;
    let end = arr[1]
        .as_u64()
        .ok_or_else(|| ConfigError::Logic("end_index is not a non-negative int".into()))?;
    check_logic(start <= end, "index_range start > end")?;
    Ok((start as usize, end as usize))
}

fn parse_key_fraction_range(value: &Value) -> Result<(f64, f64), ConfigError> {
    let arr = value
        .as_array()
        .ok_or_else(|| ConfigError::Logic("key_fraction_range is not an array".into()))?;
    check_logic(arr.len() == 2, "key_fraction_range size is not 2")?;
    let start = arr[0]
        .as_f64()
        .ok_or_else(|| ConfigError::Logic("start_key_fraction is not a number".into()))?;
    let end = arr[1]
        .as_f64()
        .ok_or_else(|| ConfigError::Logic("end_key_fraction is not a number".into()))?;
    check_logic(
        (0.0..=1.0).contains(&start) && (0.0..=1.0).contains(&end) && start <= end,
        "invalid key_fraction_range",
    )?;
    Ok((start, end))
}

impl ShadowData {
    pub fn from_json(json: &Value) -> Result<Self, ConfigError> {
        check_logic(json.is_object(), "shadowing_policy is not object")?;
        let mut data = ShadowData::default();

        if let Some(value) = json.get("index_range") {
            let (start, end) = parse_index_range(value)?;
            data.start_index = start;
            data.end_index = end;
        }
        if let Some(value) = json.get("key_fraction_range") {
            let (start, end) = parse_key_fraction_range(value)?;
            data.start_key_fraction = start;
            data.end_key_fraction = end;
        }
        if let Some(value) = json.get("index_range_rv") {
            data.index_range_rv = value
                .as_str()
                .ok_or_else(|| ConfigError::Logic("index_range_rv is not string".into()))?
                .to_string();
        }
        if let Some(value) = json.get("key_fraction_range_rv") {
            data.key_fraction_range_rv = value
                .as_str()
                .ok_or_else(|| ConfigError::Logic("key_fraction_range_rv is not string".into()))?
                .to_string();
        }
        if let Some(value) = json.get("shadow_pool") {
            data.shadow_pool = Some(
                value
                    .as_str()
                    .ok_or_else(|| ConfigError::Logic("shadow_pool is not string".into()))?
                    .to_string(),
            );
        }
        if let Some(value) = json.get("validate_replies") {
            data.validate_replies = value
                .as_bool()
                .ok_or_else(|| ConfigError::Logic("validate_replies is not bool".into()))?;
        }
        Ok(data)
    }
}

type DataCell = RwLock<Arc<ShadowData>>;

/// Shadowing policy bound to an optional runtime-vars registry.
pub struct ShadowingPolicy {
    // Field order matters: the subscription is released before `data`, so an
    // in-flight delivery can never observe torn-down policy state.
    _subscription: Option<SubscriptionHandle>,
    data: Arc<DataCell>,
}

impl ShadowingPolicy {
    pub fn from_json(
        json: &Value,
        vars: Option<&ObservableRuntimeVars>,
    ) -> Result<Self, ConfigError> {
        Self::with_data(ShadowData::from_json(json)?, vars)
    }

    pub fn with_data(
        data: ShadowData,
        vars: Option<&ObservableRuntimeVars>,
    ) -> Result<Self, ConfigError> {
        let data = Arc::new(RwLock::new(Arc::new(data)));
        let subscription = vars.map(|vars| {
            let cell = Arc::clone(&data);
            vars.subscribe_and_call(move |_old, new| {
                if let Err(err) = apply_runtime_vars(&cell, new) {
                    tracing::error!(error = %err, "shadowing runtime vars update rejected");
                }
            })
        });
        Ok(Self {
            _subscription: subscription,
            data,
        })
    }

    /// Current immutable snapshot.
    pub fn data(&self) -> Arc<ShadowData> {
        Arc::clone(&self.data.read().expect("shadow data lock poisoned"))
    }

    /// Should a request for `key`, routed to the client at `client_index`,
    /// be copied to the shadow pool?
    pub fn should_shadow(&self, key: &str, client_index: usize) -> bool {
        let data = self.data();
        if client_index < data.start_index || client_index > data.end_index {
            return false;
        }
        let fraction = key_fraction(key);
        fraction >= data.start_key_fraction && fraction <= data.end_key_fraction
    }
}

/// Deterministic key → [0, 1] mapping shared with nothing else; shadow
/// selection must be stable across workers.
fn key_fraction(key: &str) -> f64 {
    crc32fast::hash(key.as_bytes()) as f64 / u32::MAX as f64
}

/// Apply one runtime-vars delivery. Reads the variable names from the
/// current snapshot, validates the bound values, and swaps in an updated
/// copy. Malformed values leave the snapshot untouched.
fn apply_runtime_vars(cell: &DataCell, new_vars: &Arc<RuntimeVarsData>) -> Result<(), ConfigError> {
    let current = Arc::clone(&cell.read().expect("shadow data lock poisoned"));

    let mut index_range = None;
    if !current.index_range_rv.is_empty() {
        if let Some(value) = new_vars.get(&current.index_range_rv) {
            index_range = Some(parse_index_range(value)?);
        }
    }

    let mut key_fraction_range = None;
    if !current.key_fraction_range_rv.is_empty() {
        if let Some(value) = new_vars.get(&current.key_fraction_range_rv) {
            key_fraction_range = Some(parse_key_fraction_range(value)?);
        }
    }

    let mut updated = (*current).clone();
    if let Some((start, end)) = index_range {
        updated.start_index = start;
        updated.end_index = end;
    }
    if let Some((start, end)) = key_fraction_range {
        updated.start_key_fraction = start;
        updated.end_key_fraction = end;
    }

    *cell.write().expect("shadow data lock poisoned") = Arc::new(updated);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn parse_full_policy() {
        let json = json!({
            "index_range": [0, 3],
            "key_fraction_range": [0.0, 0.5],
            "index_range_rv": "shadow_index",
            "key_fraction_range_rv": "shadow_fraction",
            "shadow_pool": "shadow",
            "validate_replies": true,
        });
        let data = ShadowData::from_json(&json).unwrap();
        assert_eq!((data.start_index, data.end_index), (0, 3));
        assert_eq!(data.shadow_pool.as_deref(), Some("shadow"));
        assert!(data.validate_replies);
    }

    #[test]
    fn parse_rejects_inverted_ranges() {
        assert!(ShadowData::from_json(&json!({"index_range": [3, 1]})).is_err());
        assert!(ShadowData::from_json(&json!({"key_fraction_range": [0.9, 0.1]})).is_err());
        assert!(ShadowData::from_json(&json!({"key_fraction_range": [0.0, 1.5]})).is_err());
        assert!(ShadowData::from_json(&json!("not an object")).is_err());
    }

    #[test]
    fn runtime_vars_update_ordering() {
        let vars = ObservableRuntimeVars::new();
        let policy = ShadowingPolicy::from_json(
            &json!({"index_range": [0, 0], "index_range_rv": "range_var"}),
            Some(&vars),
        )
        .unwrap();

        vars.publish_json(r#"{"range_var": [1, 1]}"#).unwrap();
        let d = policy.data();
        assert_eq!((d.start_index, d.end_index), (1, 1));

        vars.publish_json(r#"{"range_var": [0, 3]}"#).unwrap();
        let d = policy.data();
        assert_eq!((d.start_index, d.end_index), (0, 3));

        // inverted range: rejected, snapshot unchanged
        vars.publish_json(r#"{"range_var": [3, 1]}"#).unwrap();
        let d = policy.data();
        assert_eq!((d.start_index, d.end_index), (0, 3));
    }

    #[test]
    fn repeated_update_is_idempotent() {
        let vars = ObservableRuntimeVars::new();
        let policy = ShadowingPolicy::from_json(
            &json!({"index_range_rv": "range_var"}),
            Some(&vars),
        )
        .unwrap();

        vars.publish_json(r#"{"range_var": [2, 5]}"#).unwrap();
        let first = policy.data();
        vars.publish_json(r#"{"range_var": [2, 5]}"#).unwrap();
        let second = policy.data();
        assert_eq!(*first, *second);
    }

    #[test]
    fn unrelated_vars_leave_ranges_alone() {
        let vars = ObservableRuntimeVars::new();
        let policy = ShadowingPolicy::from_json(
            &json!({"index_range": [1, 2], "index_range_rv": "range_var"}),
            Some(&vars),
        )
        .unwrap();

        vars.publish_json(r#"{"other_var": [9, 9]}"#).unwrap();
        let d = policy.data();
        assert_eq!((d.start_index, d.end_index), (1, 2));
    }
}

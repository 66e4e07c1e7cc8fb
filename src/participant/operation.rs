//! Operations carried by transactions and the executors that run them
//!
//! Incoming operations arrive as loosely-typed JSON objects with a `type`
//! tag. The registry picks the executor for that tag, which validates the
//! fields into a typed [`Operation`]; applying a committed operation goes
//! through the same executor. An operation that fails to decode is what makes
//! a participant vote NO.

use crate::common::{Error, Result};
use crate::participant::store::KvStore;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "UPPERCASE")]
pub enum Operation {
    /// Unconditional overwrite
    Set { key: String, value: String },
    /// Move `amount` from one balance to another
    Transfer { from: String, to: String, amount: f64 },
}

impl Operation {
    pub fn kind(&self) -> OperationKind {
        match self {
            Operation::Set { .. } => OperationKind::Set,
            Operation::Transfer { .. } => OperationKind::Transfer,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum OperationKind {
    Set,
    Transfer,
}

impl FromStr for OperationKind {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_uppercase().as_str() {
            "SET" => Ok(OperationKind::Set),
            "TRANSFER" => Ok(OperationKind::Transfer),
            other => Err(Error::InvalidOperation(format!(
                "unknown operation type: {:?}",
                other
            ))),
        }
    }
}

impl fmt::Display for OperationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OperationKind::Set => f.write_str("SET"),
            OperationKind::Transfer => f.write_str("TRANSFER"),
        }
    }
}

/// Validator and applier for one operation kind.
pub trait OperationExecutor: Send + Sync {
    /// Validate raw fields into a typed operation.
    fn decode(&self, fields: &Map<String, Value>) -> Result<Operation>;

    /// Apply a committed operation to the store.
    fn apply(&self, operation: &Operation, store: &mut KvStore);
}

/// Scalar JSON field rendered as a string; objects, arrays and null are not
/// accepted.
fn scalar_field(fields: &Map<String, Value>, name: &str) -> Option<String> {
    match fields.get(name)? {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        Value::Bool(b) => Some(b.to_string()),
        _ => None,
    }
}

fn required_field(fields: &Map<String, Value>, name: &str) -> Result<String> {
    scalar_field(fields, name)
        .ok_or_else(|| Error::InvalidOperation(format!("missing field `{}`", name)))
}

pub struct SetExecutor;

impl OperationExecutor for SetExecutor {
    fn decode(&self, fields: &Map<String, Value>) -> Result<Operation> {
        let key = scalar_field(fields, "key").unwrap_or_default();
        if key.trim().is_empty() {
            return Err(Error::InvalidOperation("SET requires a non-empty key".into()));
        }
        let value = scalar_field(fields, "value").unwrap_or_default();
        Ok(Operation::Set { key, value })
    }

    fn apply(&self, operation: &Operation, store: &mut KvStore) {
        if let Operation::Set { key, value } = operation {
            store.set(key.clone(), value.clone());
        }
    }
}

pub struct TransferExecutor;

impl OperationExecutor for TransferExecutor {
    fn decode(&self, fields: &Map<String, Value>) -> Result<Operation> {
        let from = required_field(fields, "from")?;
        let to = required_field(fields, "to")?;
        let amount = match fields.get("amount") {
            Some(Value::Number(n)) => n.as_f64(),
            Some(Value::String(s)) => s.trim().parse::<f64>().ok(),
            _ => None,
        }
        .filter(|a| a.is_finite())
        .ok_or_else(|| Error::InvalidOperation("TRANSFER requires a numeric amount".into()))?;

        Ok(Operation::Transfer { from, to, amount })
    }

    fn apply(&self, operation: &Operation, store: &mut KvStore) {
        if let Operation::Transfer { from, to, amount } = operation {
            let debited = store.balance(from) - amount;
            store.set(from.clone(), debited.to_string());
            let credited = store.balance(to) + amount;
            store.set(to.clone(), credited.to_string());
        }
    }
}

/// Executor table keyed by operation kind.
pub struct ExecutorRegistry {
    executors: HashMap<OperationKind, Box<dyn OperationExecutor>>,
}

impl fmt::Debug for ExecutorRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_set().entries(self.executors.keys()).finish()
    }
}

impl Default for ExecutorRegistry {
    fn default() -> Self {
        Self::with_defaults()
    }
}

impl ExecutorRegistry {
    pub fn empty() -> Self {
        Self {
            executors: HashMap::new(),
        }
    }

    /// SET and TRANSFER.
    pub fn with_defaults() -> Self {
        let mut registry = Self::empty();
        registry.register(OperationKind::Set, SetExecutor);
        registry.register(OperationKind::Transfer, TransferExecutor);
        registry
    }

    pub fn register(&mut self, kind: OperationKind, executor: impl OperationExecutor + 'static) {
        self.executors.insert(kind, Box::new(executor));
    }

    /// Validate a raw operation object.
    pub fn decode(&self, raw: &Value) -> Result<Operation> {
        let fields = raw
            .as_object()
            .ok_or_else(|| Error::InvalidOperation("operation must be an object".into()))?;
        let kind: OperationKind = fields
            .get("type")
            .and_then(Value::as_str)
            .ok_or_else(|| Error::InvalidOperation("missing field `type`".into()))?
            .parse()?;
        let executor = self.executors.get(&kind).ok_or_else(|| {
            Error::InvalidOperation(format!("no executor registered for {}", kind))
        })?;

        let operation = executor.decode(fields)?;
        if operation.kind() != kind {
            return Err(Error::InvalidOperation(format!(
                "{} executor produced a {} operation",
                kind,
                operation.kind()
            )));
        }
        Ok(operation)
    }

    /// Apply a committed operation. Returns false if no executor handles it.
    pub fn apply(&self, operation: &Operation, store: &mut KvStore) -> bool {
        match self.executors.get(&operation.kind()) {
            Some(executor) => {
                executor.apply(operation, store);
                true
            }
            None => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_decode_set() {
        let registry = ExecutorRegistry::with_defaults();

        let op = registry
            .decode(&json!({"type": "set", "key": "x", "value": "1"}))
            .unwrap();
        assert_eq!(
            op,
            Operation::Set {
                key: "x".into(),
                value: "1".into()
            }
        );

        // Missing value defaults to empty
        let op = registry.decode(&json!({"type": "SET", "key": "y"})).unwrap();
        assert_eq!(
            op,
            Operation::Set {
                key: "y".into(),
                value: String::new()
            }
        );

        assert!(registry.decode(&json!({"type": "SET", "key": "  "})).is_err());
        assert!(registry.decode(&json!({"type": "SET"})).is_err());
    }

    #[test]
    fn test_decode_transfer() {
        let registry = ExecutorRegistry::with_defaults();

        let op = registry
            .decode(&json!({"type": "TRANSFER", "from": "a", "to": "b", "amount": "10"}))
            .unwrap();
        assert_eq!(
            op,
            Operation::Transfer {
                from: "a".into(),
                to: "b".into(),
                amount: 10.0
            }
        );

        // Negative amounts are structurally valid
        assert!(registry
            .decode(&json!({"type": "TRANSFER", "from": "a", "to": "b", "amount": -3.5}))
            .is_ok());

        assert!(registry
            .decode(&json!({"type": "TRANSFER", "from": "a", "amount": 1}))
            .is_err());
        assert!(registry
            .decode(&json!({"type": "TRANSFER", "from": "a", "to": "b", "amount": "ten"}))
            .is_err());
    }

    #[test]
    fn test_decode_rejects_unknown_shapes() {
        let registry = ExecutorRegistry::with_defaults();
        assert!(registry.decode(&json!(null)).is_err());
        assert!(registry.decode(&json!("SET x 1")).is_err());
        assert!(registry.decode(&json!({"type": "DELETE", "key": "x"})).is_err());
        assert!(registry.decode(&json!({"key": "x"})).is_err());
    }

    #[test]
    fn test_unregistered_kind_is_invalid() {
        let mut registry = ExecutorRegistry::empty();
        registry.register(OperationKind::Set, SetExecutor);

        assert!(registry
            .decode(&json!({"type": "TRANSFER", "from": "a", "to": "b", "amount": 1}))
            .is_err());

        let transfer = Operation::Transfer {
            from: "a".into(),
            to: "b".into(),
            amount: 1.0,
        };
        let mut store = KvStore::new();
        assert!(!registry.apply(&transfer, &mut store));
        assert!(store.is_empty());
    }

    #[test]
    fn test_apply_transfer() {
        let registry = ExecutorRegistry::with_defaults();
        let mut store = KvStore::new();
        store.set("a", "100");

        let op = Operation::Transfer {
            from: "a".into(),
            to: "b".into(),
            amount: 10.0,
        };
        assert!(registry.apply(&op, &mut store));
        assert_eq!(store.balance("a"), 90.0);
        assert_eq!(store.balance("b"), 10.0);
    }

    #[test]
    fn test_operation_serde_shape() {
        let op = Operation::Set {
            key: "x".into(),
            value: "1".into(),
        };
        assert_eq!(
            serde_json::to_value(&op).unwrap(),
            json!({"type": "SET", "key": "x", "value": "1"})
        );
    }
}

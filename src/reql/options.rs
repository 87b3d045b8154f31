//! Per-query run options.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use super::ast::Term;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Durability {
    Hard,
    Soft,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReadMode {
    Single,
    Majority,
    Outdated,
}

/// Options accepted by `run`; keys follow the camelCase configuration names.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RunOptions {
    pub db: Option<String>,
    pub noreply: bool,
    pub durability: Option<Durability>,
    pub profile: bool,
    pub read_mode: Option<ReadMode>,
    pub array_limit: Option<u64>,
    pub min_batch_rows: Option<u64>,
    pub max_batch_rows: Option<u64>,
    pub max_batch_bytes: Option<u64>,
    pub max_batch_seconds: Option<f64>,
    pub first_batch_scaledown_factor: Option<u64>,
}

impl RunOptions {
    pub fn noreply() -> Self {
        Self {
            noreply: true,
            ..Self::default()
        }
    }

    pub fn with_db(mut self, db: impl Into<String>) -> Self {
        self.db = Some(db.into());
        self
    }

    /// Global optargs sent with a START query, snake-cased.
    ///
    /// `db` travels as a `DB` term rather than a plain string.
    pub fn to_optargs(&self) -> Map<String, Value> {
        let mut optargs = Map::new();
        if let Some(db) = &self.db {
            optargs.insert("db".into(), Term::db(db.clone()).to_json());
        }
        if self.noreply {
            optargs.insert("noreply".into(), Value::Bool(true));
        }
        if let Some(durability) = self.durability {
            optargs.insert("durability".into(), enum_value(durability));
        }
        if self.profile {
            optargs.insert("profile".into(), Value::Bool(true));
        }
        if let Some(read_mode) = self.read_mode {
            optargs.insert("read_mode".into(), enum_value(read_mode));
        }
        let numbers = [
            ("array_limit", self.array_limit),
            ("min_batch_rows", self.min_batch_rows),
            ("max_batch_rows", self.max_batch_rows),
            ("max_batch_bytes", self.max_batch_bytes),
            ("first_batch_scaledown_factor", self.first_batch_scaledown_factor),
        ];
        for (key, value) in numbers {
            if let Some(value) = value {
                optargs.insert(key.into(), Value::from(value));
            }
        }
        if let Some(seconds) = self.max_batch_seconds {
            optargs.insert("max_batch_seconds".into(), Value::from(seconds));
        }
        optargs
    }
}

fn enum_value<T: Serialize>(value: T) -> Value {
    serde_json::to_value(value).unwrap_or(Value::Null)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_optargs_are_snake_cased() {
        let options = RunOptions {
            db: Some("app".into()),
            read_mode: Some(ReadMode::Majority),
            array_limit: Some(500),
            durability: Some(Durability::Soft),
            ..RunOptions::default()
        };

        let optargs = options.to_optargs();
        assert_eq!(optargs["db"], json!([14, ["app"]]));
        assert_eq!(optargs["read_mode"], json!("majority"));
        assert_eq!(optargs["array_limit"], json!(500));
        assert_eq!(optargs["durability"], json!("soft"));
        assert!(!optargs.contains_key("noreply"));
    }

    #[test]
    fn test_camel_case_keys() {
        let options: RunOptions =
            serde_json::from_value(json!({"readMode": "outdated", "arrayLimit": 10, "noreply": true}))
                .unwrap();
        assert_eq!(options.read_mode, Some(ReadMode::Outdated));
        assert_eq!(options.array_limit, Some(10));
        assert!(options.noreply);
    }
}

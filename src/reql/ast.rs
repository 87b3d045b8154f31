//! ReQL term tree.
//!
//! A query is a tree of [`Term`] nodes encoded as JSON on the wire:
//!
//! - an operation is `[type, [args...], {optargs}]`
//! - a literal object is a JSON object whose values are terms
//! - anything else is a scalar datum
//!
//! The driver does not build queries beyond the handful of helpers below; it
//! carries caller-built trees to the server and rewrites them in one place,
//! [`Term::qualify_tables`], which binds table references to a database.
//!
//! ```rust,ignore
//! use photondb_driver::reql::Term;
//!
//! // r.table("users").count()
//! let query = Term::count(Term::table("users"));
//! ```

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::{Map, Value};

use super::terms::TermType;
use crate::error::{Error, ErrorKind, Result};

/// A ReQL term.
#[derive(Debug, Clone, PartialEq)]
pub enum Term {
    /// `[type, [args...], {optargs}]`
    Op {
        term_type: TermType,
        args: Vec<Term>,
        optargs: BTreeMap<String, Term>,
    },
    /// Literal object of terms.
    Object(BTreeMap<String, Term>),
    /// Scalar datum (null, bool, number, string).
    Datum(Value),
}

impl Term {
    /// Create an operation term with no arguments.
    pub fn new(term_type: TermType) -> Self {
        Term::Op {
            term_type,
            args: Vec::new(),
            optargs: BTreeMap::new(),
        }
    }

    /// Create a datum term. Arrays become `MAKE_ARRAY`, objects literal objects.
    pub fn datum(value: impl Into<Value>) -> Self {
        match value.into() {
            Value::Array(items) => Term::make_array(items.into_iter().map(Term::datum).collect()),
            Value::Object(map) => Term::Object(
                map.into_iter()
                    .map(|(key, value)| (key, Term::datum(value)))
                    .collect(),
            ),
            scalar => Term::Datum(scalar),
        }
    }

    /// Add a positional argument. No-op on non-operation terms.
    pub fn with_arg(mut self, arg: Term) -> Self {
        if let Term::Op { args, .. } = &mut self {
            args.push(arg);
        }
        self
    }

    pub fn with_args(mut self, extra: impl IntoIterator<Item = Term>) -> Self {
        if let Term::Op { args, .. } = &mut self {
            args.extend(extra);
        }
        self
    }

    /// Add a named optional argument. No-op on non-operation terms.
    pub fn with_optarg(mut self, name: impl Into<String>, value: Term) -> Self {
        if let Term::Op { optargs, .. } = &mut self {
            optargs.insert(name.into(), value);
        }
        self
    }

    pub fn term_type(&self) -> Option<TermType> {
        match self {
            Term::Op { term_type, .. } => Some(*term_type),
            _ => None,
        }
    }

    pub fn args(&self) -> &[Term] {
        match self {
            Term::Op { args, .. } => args,
            _ => &[],
        }
    }

    pub fn optarg(&self, name: &str) -> Option<&Term> {
        match self {
            Term::Op { optargs, .. } => optargs.get(name),
            _ => None,
        }
    }

    pub fn db(name: impl Into<String>) -> Self {
        Term::new(TermType::DB).with_arg(Term::Datum(Value::String(name.into())))
    }

    /// Unqualified table reference; the database is bound at send time.
    pub fn table(name: impl Into<String>) -> Self {
        Term::new(TermType::TABLE).with_arg(Term::Datum(Value::String(name.into())))
    }

    pub fn table_in(db: impl Into<String>, name: impl Into<String>) -> Self {
        Term::new(TermType::TABLE)
            .with_arg(Term::db(db))
            .with_arg(Term::Datum(Value::String(name.into())))
    }

    pub fn table_list() -> Self {
        Term::new(TermType::TABLE_LIST)
    }

    pub fn make_array(items: Vec<Term>) -> Self {
        Term::new(TermType::MAKE_ARRAY).with_args(items)
    }

    pub fn count(sequence: Term) -> Self {
        Term::new(TermType::COUNT).with_arg(sequence)
    }

    pub fn insert(table: Term, documents: Term) -> Self {
        Term::new(TermType::INSERT).with_arg(table).with_arg(documents)
    }

    /// `r.error(message)`, used by the keep-alive ping.
    pub fn error(message: impl Into<String>) -> Self {
        Term::new(TermType::ERROR).with_arg(Term::Datum(Value::String(message.into())))
    }

    pub fn changes(sequence: Term) -> Self {
        Term::new(TermType::CHANGES).with_arg(sequence)
    }

    /// Bind every table reference that lacks a database to `db`.
    ///
    /// `TABLE`, `TABLE_CREATE`, `TABLE_DROP` and `TABLE_LIST` gain a leading
    /// `[DB, [db]]` argument unless their first argument already is a `DB`
    /// term. Qualified references are left alone and not descended into.
    pub fn qualify_tables(&mut self, db: &str) {
        match self {
            Term::Op {
                term_type,
                args,
                optargs,
            } => {
                if term_type.is_table_reference() {
                    let qualified = matches!(
                        args.first(),
                        Some(Term::Op { term_type: first, .. }) if *first == TermType::DB
                    );
                    if !qualified {
                        args.insert(0, Term::db(db));
                    }
                    return;
                }
                for arg in args.iter_mut() {
                    arg.qualify_tables(db);
                }
                for value in optargs.values_mut() {
                    value.qualify_tables(db);
                }
            }
            Term::Object(fields) => {
                for value in fields.values_mut() {
                    value.qualify_tables(db);
                }
            }
            Term::Datum(_) => {}
        }
    }

    /// Wire JSON for this term.
    pub fn to_json(&self) -> Value {
        match self {
            Term::Op {
                term_type,
                args,
                optargs,
            } => {
                let mut encoded = vec![
                    Value::from(term_type.code()),
                    Value::Array(args.iter().map(Term::to_json).collect()),
                ];
                if !optargs.is_empty() {
                    encoded.push(Value::Object(
                        optargs
                            .iter()
                            .map(|(key, value)| (key.clone(), value.to_json()))
                            .collect(),
                    ));
                }
                Value::Array(encoded)
            }
            Term::Object(fields) => Value::Object(
                fields
                    .iter()
                    .map(|(key, value)| (key.clone(), value.to_json()))
                    .collect::<Map<String, Value>>(),
            ),
            Term::Datum(value) => value.clone(),
        }
    }

    /// Parse wire JSON back into a term tree.
    pub fn from_json(value: Value) -> Result<Self> {
        match value {
            Value::Array(items) => {
                let mut items = items.into_iter();
                let term_type = items
                    .next()
                    .and_then(|code| code.as_u64())
                    .and_then(|code| u32::try_from(code).ok())
                    .map(TermType)
                    .ok_or_else(|| malformed("term arrays must start with a term type"))?;
                let args = match items.next() {
                    None => Vec::new(),
                    Some(Value::Array(args)) => args
                        .into_iter()
                        .map(Term::from_json)
                        .collect::<Result<Vec<_>>>()?,
                    Some(_) => return Err(malformed("term arguments must be an array")),
                };
                let optargs = match items.next() {
                    None => BTreeMap::new(),
                    Some(Value::Object(map)) => map
                        .into_iter()
                        .map(|(key, value)| Ok((key, Term::from_json(value)?)))
                        .collect::<Result<BTreeMap<_, _>>>()?,
                    Some(_) => return Err(malformed("term optargs must be an object")),
                };
                Ok(Term::Op {
                    term_type,
                    args,
                    optargs,
                })
            }
            Value::Object(map) => Ok(Term::Object(
                map.into_iter()
                    .map(|(key, value)| Ok((key, Term::from_json(value)?)))
                    .collect::<Result<BTreeMap<_, _>>>()?,
            )),
            scalar => Ok(Term::Datum(scalar)),
        }
    }
}

fn malformed(message: &str) -> Error {
    Error::new(ErrorKind::Parse, format!("Malformed term: {}", message))
}

impl From<Value> for Term {
    fn from(value: Value) -> Self {
        Term::datum(value)
    }
}

impl Serialize for Term {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        self.to_json().serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for Term {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let value = Value::deserialize(deserializer)?;
        Term::from_json(value).map_err(serde::de::Error::custom)
    }
}

impl fmt::Display for Term {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_json())
    }
}

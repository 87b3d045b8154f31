//! ReQL term type codes as they appear on the wire.
//!
//! Only the codes the driver itself needs to recognise or build are named
//! here; every other operation travels through [`TermType`] as a raw code.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Numeric term type (first element of a `[type, args, optargs]` array).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TermType(pub u32);

impl TermType {
    pub const DATUM: TermType = TermType(1);
    pub const MAKE_ARRAY: TermType = TermType(2);
    pub const MAKE_OBJ: TermType = TermType(3);
    pub const ERROR: TermType = TermType(12);
    pub const DB: TermType = TermType(14);
    pub const TABLE: TermType = TermType(15);
    pub const GET: TermType = TermType(16);
    pub const COUNT: TermType = TermType(43);
    pub const INSERT: TermType = TermType(56);
    pub const DB_CREATE: TermType = TermType(57);
    pub const DB_DROP: TermType = TermType(58);
    pub const DB_LIST: TermType = TermType(59);
    pub const TABLE_CREATE: TermType = TermType(60);
    pub const TABLE_DROP: TermType = TermType(61);
    pub const TABLE_LIST: TermType = TermType(62);
    pub const CHANGES: TermType = TermType(152);

    pub fn code(self) -> u32 {
        self.0
    }

    /// Terms that take an implicit database as their first argument.
    pub fn is_table_reference(self) -> bool {
        matches!(
            self,
            TermType::TABLE | TermType::TABLE_CREATE | TermType::TABLE_DROP | TermType::TABLE_LIST
        )
    }

    /// Upper-case name for logging, `None` for codes not named here.
    pub fn name(self) -> Option<&'static str> {
        let name = match self {
            TermType::DATUM => "DATUM",
            TermType::MAKE_ARRAY => "MAKE_ARRAY",
            TermType::MAKE_OBJ => "MAKE_OBJ",
            TermType::ERROR => "ERROR",
            TermType::DB => "DB",
            TermType::TABLE => "TABLE",
            TermType::GET => "GET",
            TermType::COUNT => "COUNT",
            TermType::INSERT => "INSERT",
            TermType::DB_CREATE => "DB_CREATE",
            TermType::DB_DROP => "DB_DROP",
            TermType::DB_LIST => "DB_LIST",
            TermType::TABLE_CREATE => "TABLE_CREATE",
            TermType::TABLE_DROP => "TABLE_DROP",
            TermType::TABLE_LIST => "TABLE_LIST",
            TermType::CHANGES => "CHANGES",
            _ => return None,
        };
        Some(name)
    }
}

impl From<u32> for TermType {
    fn from(code: u32) -> Self {
        TermType(code)
    }
}

impl fmt::Display for TermType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.name() {
            Some(name) => f.write_str(name),
            None => write!(f, "TERM({})", self.0),
        }
    }
}

//
// Copyright (c) The sysrepo2-rs Core Contributors
//
// SPDX-License-Identifier: MIT
//

//! Typed values carried by data tree leaves.

/// A typed YANG leaf value.
///
/// Covers the built-in YANG types exchanged with the datastore engine.
/// The canonical string representation (the one that appears in change
/// records and instance-identifier predicates) is produced by `Display`.
#[derive(Clone, Debug, PartialEq)]
pub enum DataValue {
    Int8(i8),
    Int16(i16),
    Int32(i32),
    Int64(i64),
    Uint8(u8),
    Uint16(u16),
    Uint32(u32),
    Uint64(u64),
    Bool(bool),
    String(String),
    Decimal64(f64),
    Enum(String),
    IdentityRef(String),
    InstanceId(String),
    Bits(String),
    Binary(String),
    /// YANG `empty` leaf. Presence is the value.
    Empty,
}

impl DataValue {
    /// Canonical string form of the value.
    pub fn to_canonical(&self) -> String {
        self.to_string()
    }
}

impl std::fmt::Display for DataValue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DataValue::Int8(v) => write!(f, "{}", v),
            DataValue::Int16(v) => write!(f, "{}", v),
            DataValue::Int32(v) => write!(f, "{}", v),
            DataValue::Int64(v) => write!(f, "{}", v),
            DataValue::Uint8(v) => write!(f, "{}", v),
            DataValue::Uint16(v) => write!(f, "{}", v),
            DataValue::Uint32(v) => write!(f, "{}", v),
            DataValue::Uint64(v) => write!(f, "{}", v),
            DataValue::Bool(v) => write!(f, "{}", v),
            DataValue::String(v)
            | DataValue::Enum(v)
            | DataValue::IdentityRef(v)
            | DataValue::InstanceId(v)
            | DataValue::Bits(v)
            | DataValue::Binary(v) => write!(f, "{}", v),
            DataValue::Decimal64(v) => write!(f, "{}", v),
            DataValue::Empty => Ok(()),
        }
    }
}

impl From<&str> for DataValue {
    fn from(v: &str) -> DataValue {
        DataValue::String(v.to_owned())
    }
}

impl From<String> for DataValue {
    fn from(v: String) -> DataValue {
        DataValue::String(v)
    }
}

impl From<bool> for DataValue {
    fn from(v: bool) -> DataValue {
        DataValue::Bool(v)
    }
}

impl From<i32> for DataValue {
    fn from(v: i32) -> DataValue {
        DataValue::Int32(v)
    }
}

impl From<i64> for DataValue {
    fn from(v: i64) -> DataValue {
        DataValue::Int64(v)
    }
}

impl From<u32> for DataValue {
    fn from(v: u32) -> DataValue {
        DataValue::Uint32(v)
    }
}

impl From<u64> for DataValue {
    fn from(v: u64) -> DataValue {
        DataValue::Uint64(v)
    }
}

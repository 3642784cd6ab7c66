//
// Copyright (c) The sysrepo2-rs Core Contributors
//
// SPDX-License-Identifier: MIT
//

use num_derive::FromPrimitive;
use num_traits::FromPrimitive;

/// A convenience wrapper around `Result` for `sysrepo2::Error`.
pub type Result<T> = std::result::Result<T, Error>;

/// Status codes exchanged with the datastore engine.
///
/// The numeric values are stable and match the engine's own error table.
/// `Ok` and `CallbackShelve` are not errors: `Ok` reports success and
/// `CallbackShelve` asks the engine to re-deliver the same event later.
#[derive(Clone, Copy, Debug, Eq, FromPrimitive, Hash, PartialEq)]
#[repr(i32)]
pub enum ErrorCode {
    Ok = 0,
    InvalArg = 1,
    Ly = 2,
    Sys = 3,
    Nomem = 4,
    NotFound = 5,
    Exists = 6,
    Internal = 7,
    Unsupported = 8,
    ValidationFailed = 9,
    OperationFailed = 10,
    Unauthorized = 11,
    Locked = 12,
    Timeout = 13,
    CallbackFailed = 14,
    CallbackShelve = 15,
}

impl ErrorCode {
    /// Numeric form of the status code.
    pub fn as_i32(self) -> i32 {
        self as i32
    }

    /// Decode a numeric status code received from an engine.
    pub fn from_i32(value: i32) -> Option<ErrorCode> {
        FromPrimitive::from_i32(value)
    }

    /// Static description of the status code, mirroring the engine's
    /// `strerror` table.
    pub fn strerror(self) -> &'static str {
        match self {
            ErrorCode::Ok => "Operation succeeded",
            ErrorCode::InvalArg => "Invalid argument",
            ErrorCode::Ly => "YANG library error",
            ErrorCode::Sys => "System function call failed",
            ErrorCode::Nomem => "Out of memory",
            ErrorCode::NotFound => "Item not found",
            ErrorCode::Exists => "Item already exists",
            ErrorCode::Internal => "Internal error",
            ErrorCode::Unsupported => "Unsupported operation",
            ErrorCode::ValidationFailed => "Validation failed",
            ErrorCode::OperationFailed => "Operation failed",
            ErrorCode::Unauthorized => "Operation not authorized",
            ErrorCode::Locked => "Requested resource is already locked",
            ErrorCode::Timeout => "Timeout expired",
            ErrorCode::CallbackFailed => "User callback failed",
            ErrorCode::CallbackShelve => "User callback shelved",
        }
    }
}

impl std::fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.strerror())
    }
}

/// Enum listing possible errors from sysrepo2-rs.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Error {
    pub errcode: ErrorCode,
    pub msg: Option<String>,
}

impl Error {
    pub fn new(errcode: ErrorCode, msg: impl Into<String>) -> Error {
        Error {
            errcode,
            msg: Some(msg.into()),
        }
    }

    pub fn from_code(errcode: ErrorCode) -> Error {
        Error { errcode, msg: None }
    }

    pub fn inval_arg(msg: impl Into<String>) -> Error {
        Error::new(ErrorCode::InvalArg, msg)
    }

    pub fn not_found(msg: impl Into<String>) -> Error {
        Error::new(ErrorCode::NotFound, msg)
    }

    pub fn internal(msg: impl Into<String>) -> Error {
        Error::new(ErrorCode::Internal, msg)
    }

    pub fn unsupported(msg: impl Into<String>) -> Error {
        Error::new(ErrorCode::Unsupported, msg)
    }

    pub fn validation_failed(msg: impl Into<String>) -> Error {
        Error::new(ErrorCode::ValidationFailed, msg)
    }

    pub fn operation_failed(msg: impl Into<String>) -> Error {
        Error::new(ErrorCode::OperationFailed, msg)
    }

    pub fn callback_failed(msg: impl Into<String>) -> Error {
        Error::new(ErrorCode::CallbackFailed, msg)
    }

    pub fn ly(msg: impl Into<String>) -> Error {
        Error::new(ErrorCode::Ly, msg)
    }

    /// The status code reported to the engine when this error crosses the
    /// callback boundary. `Ok` never crosses as an error.
    pub fn code(&self) -> ErrorCode {
        if self.errcode == ErrorCode::Ok {
            ErrorCode::OperationFailed
        } else {
            self.errcode
        }
    }

    pub fn message(&self) -> Option<&str> {
        self.msg.as_deref()
    }
}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.msg {
            Some(msg) => write!(f, "{}: {}", msg, self.errcode.strerror()),
            None => write!(f, "{}", self.errcode.strerror()),
        }
    }
}

impl std::error::Error for Error {}

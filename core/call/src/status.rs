// Copyright AGNTCY Contributors (https://github.com/agntcy)
// SPDX-License-Identifier: Apache-2.0

//! Status codes and the per-call status register.
//!
//! Status for a call can arrive from several racing subsystems; the
//! register keeps one set-once slot per source and consolidates them into
//! the single final status reported to the application.

// Standard library imports
use std::fmt;
use std::sync::Arc;
use std::sync::OnceLock;

// Third-party crates
use serde::{Deserialize, Serialize};
use tracing::debug;

// Local crate
use crate::error::OpError;

/// RPC status codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[repr(u16)]
pub enum Code {
    #[default]
    Ok = 0,
    Cancelled = 1,
    Unknown = 2,
    InvalidArgument = 3,
    DeadlineExceeded = 4,
    NotFound = 5,
    AlreadyExists = 6,
    PermissionDenied = 7,
    ResourceExhausted = 8,
    FailedPrecondition = 9,
    Aborted = 10,
    OutOfRange = 11,
    Unimplemented = 12,
    Internal = 13,
    Unavailable = 14,
    DataLoss = 15,
    Unauthenticated = 16,
}

impl Code {
    pub fn is_ok(&self) -> bool {
        matches!(self, Code::Ok)
    }

    pub fn from_i32(value: i32) -> Option<Self> {
        match value {
            0 => Some(Code::Ok),
            1 => Some(Code::Cancelled),
            2 => Some(Code::Unknown),
            3 => Some(Code::InvalidArgument),
            4 => Some(Code::DeadlineExceeded),
            5 => Some(Code::NotFound),
            6 => Some(Code::AlreadyExists),
            7 => Some(Code::PermissionDenied),
            8 => Some(Code::ResourceExhausted),
            9 => Some(Code::FailedPrecondition),
            10 => Some(Code::Aborted),
            11 => Some(Code::OutOfRange),
            12 => Some(Code::Unimplemented),
            13 => Some(Code::Internal),
            14 => Some(Code::Unavailable),
            15 => Some(Code::DataLoss),
            16 => Some(Code::Unauthenticated),
            _ => None,
        }
    }

    pub fn as_i32(&self) -> i32 {
        *self as i32
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Code::Ok => "OK",
            Code::Cancelled => "CANCELLED",
            Code::Unknown => "UNKNOWN",
            Code::InvalidArgument => "INVALID_ARGUMENT",
            Code::DeadlineExceeded => "DEADLINE_EXCEEDED",
            Code::NotFound => "NOT_FOUND",
            Code::AlreadyExists => "ALREADY_EXISTS",
            Code::PermissionDenied => "PERMISSION_DENIED",
            Code::ResourceExhausted => "RESOURCE_EXHAUSTED",
            Code::FailedPrecondition => "FAILED_PRECONDITION",
            Code::Aborted => "ABORTED",
            Code::OutOfRange => "OUT_OF_RANGE",
            Code::Unimplemented => "UNIMPLEMENTED",
            Code::Internal => "INTERNAL",
            Code::Unavailable => "UNAVAILABLE",
            Code::DataLoss => "DATA_LOSS",
            Code::Unauthenticated => "UNAUTHENTICATED",
        }
    }
}

impl fmt::Display for Code {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Where a received status came from. Numerically lower sources take
/// priority when computing the final status: application intent overrides
/// wire observation overrides internal surface errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(usize)]
pub enum StatusSource {
    /// Application layer overriding whatever the wire says.
    ApiOverride = 0,
    /// The wire, or anything below the surface layer.
    Wire = 1,
    /// Internal filter-stack operation.
    Core = 2,
    /// Surface-layer error.
    Surface = 3,
    /// The server sending status.
    ServerStatus = 4,
}

impl StatusSource {
    pub const COUNT: usize = 5;

    fn all() -> [StatusSource; Self::COUNT] {
        [
            StatusSource::ApiOverride,
            StatusSource::Wire,
            StatusSource::Core,
            StatusSource::Surface,
            StatusSource::ServerStatus,
        ]
    }
}

/// The single (code, details) pair reported to the application.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct FinalStatus {
    pub code: Code,
    pub details: String,
}

impl FinalStatus {
    pub fn is_ok(&self) -> bool {
        self.code.is_ok()
    }
}

/// One set-once slot per status source.
///
/// Each slot is CAS-installed and acquire-load readable; the first writer
/// per source wins and later writers' errors are dropped.
#[derive(Debug, Default)]
pub(crate) struct StatusRegister {
    slots: [OnceLock<Arc<OpError>>; StatusSource::COUNT],
}

impl StatusRegister {
    pub(crate) fn new() -> Self {
        StatusRegister::default()
    }

    /// Record an error under `source`. Returns false when the slot was
    /// already set (the argument is dropped).
    pub(crate) fn set(&self, source: StatusSource, error: Arc<OpError>) -> bool {
        self.slots[source as usize].set(error).is_ok()
    }

    pub(crate) fn get(&self, source: StatusSource) -> Option<&Arc<OpError>> {
        self.slots[source as usize].get()
    }

    pub(crate) fn is_set(&self, source: StatusSource) -> bool {
        self.get(source).is_some()
    }

    /// Consolidate all sources into the final status.
    ///
    /// Two passes: the first ignores OK statuses so that a failure
    /// recorded anywhere is reported, the second allows OK. Within each
    /// pass, sources carrying an explicit status code are preferred over
    /// ones whose code would have to be inferred. With nothing set the
    /// default is `Unknown` on a client and `Ok` on a server.
    pub(crate) fn final_status(&self, is_client: bool) -> FinalStatus {
        debug!(
            role = if is_client { "client" } else { "server" },
            "computing final status"
        );
        for source in StatusSource::all() {
            if let Some(error) = self.get(source) {
                debug!(source = ?source, error = %error, "status slot set");
            }
        }
        for allow_ok in [false, true] {
            for clear_only in [true, false] {
                for source in StatusSource::all() {
                    let error = match self.get(source) {
                        Some(e) => e,
                        None => continue,
                    };
                    if clear_only && !error.has_clear_status() {
                        continue;
                    }
                    let (code, details) = error.to_status();
                    if code.is_ok() && !allow_ok {
                        continue;
                    }
                    return FinalStatus { code, details };
                }
            }
        }
        FinalStatus {
            code: if is_client { Code::Unknown } else { Code::Ok },
            details: String::new(),
        }
    }
}

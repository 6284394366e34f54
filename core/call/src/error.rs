// Copyright AGNTCY Contributors (https://github.com/agntcy)
// SPDX-License-Identifier: Apache-2.0

// Standard library imports
use std::fmt;
use std::sync::Arc;

// Third-party crates
use thiserror::Error;

// Local crate
use crate::status::Code;

/// Errors returned synchronously by the batch API.
///
/// These report misuse of the call surface; asynchronous failures travel
/// through [`OpError`] and the status register instead.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallError {
    #[error("generic call error")]
    Error,
    #[error("operation is only legal on a server call")]
    NotOnClient,
    #[error("operation is only legal on a client call")]
    NotOnServer,
    #[error("call was already accepted")]
    AlreadyAccepted,
    #[error("call was already invoked")]
    AlreadyInvoked,
    #[error("call was already finished")]
    AlreadyFinished,
    #[error("an operation of this kind is already in flight")]
    TooManyOperations,
    #[error("invalid op flags")]
    InvalidFlags,
    #[error("invalid metadata")]
    InvalidMetadata,
    #[error("invalid message")]
    InvalidMessage,
    #[error("completion queue does not belong to the server")]
    NotServerCompletionQueue,
    #[error("batch exceeds the maximum batch size")]
    BatchTooBig,
    #[error("payload type does not match the call")]
    PayloadTypeMismatch,
    #[error("completion queue has been shut down")]
    CompletionQueueShutdown,
    #[error("call was not invoked")]
    NotInvoked,
}

impl CallError {
    /// Stable uppercase name, for diagnostics and logs.
    pub fn name(&self) -> &'static str {
        match self {
            CallError::Error => "ERROR",
            CallError::NotOnClient => "NOT_ON_CLIENT",
            CallError::NotOnServer => "NOT_ON_SERVER",
            CallError::AlreadyAccepted => "ALREADY_ACCEPTED",
            CallError::AlreadyInvoked => "ALREADY_INVOKED",
            CallError::AlreadyFinished => "ALREADY_FINISHED",
            CallError::TooManyOperations => "TOO_MANY_OPERATIONS",
            CallError::InvalidFlags => "INVALID_FLAGS",
            CallError::InvalidMetadata => "INVALID_METADATA",
            CallError::InvalidMessage => "INVALID_MESSAGE",
            CallError::NotServerCompletionQueue => "NOT_SERVER_COMPLETION_QUEUE",
            CallError::BatchTooBig => "BATCH_TOO_BIG",
            CallError::PayloadTypeMismatch => "PAYLOAD_TYPE_MISMATCH",
            CallError::CompletionQueueShutdown => "COMPLETION_QUEUE_SHUTDOWN",
            CallError::NotInvoked => "NOT_INVOKED",
        }
    }
}

/// Rich error value flowing through batch completions and the status
/// register.
///
/// An `OpError` optionally carries an explicit status code (the "clear
/// grpc-status" of the wire) and a wire-visible message; errors from
/// multiple sub-completions are consolidated into one carrying the others
/// as children. Shared as `Arc<OpError>` since several subsystems may
/// observe the same failure.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OpError {
    message: String,
    code: Option<Code>,
    wire_message: Option<String>,
    children: Vec<Arc<OpError>>,
}

impl OpError {
    pub fn new(message: impl Into<String>) -> Self {
        OpError {
            message: message.into(),
            code: None,
            wire_message: None,
            children: Vec::new(),
        }
    }

    /// The canonical cancellation error.
    pub fn cancelled() -> Self {
        OpError::new("Cancelled").with_code(Code::Cancelled)
    }

    /// An error equivalent to a (code, description) status pair.
    pub fn from_status(code: Code, description: impl Into<String>) -> Self {
        let description = description.into();
        OpError::new(description.clone())
            .with_code(code)
            .with_wire_message(description)
    }

    /// Consolidate several errors into one composite.
    pub fn composite(message: impl Into<String>, children: Vec<Arc<OpError>>) -> Self {
        OpError {
            message: message.into(),
            code: None,
            wire_message: None,
            children,
        }
    }

    pub fn with_code(mut self, code: Code) -> Self {
        self.code = Some(code);
        self
    }

    pub fn with_wire_message(mut self, message: impl Into<String>) -> Self {
        self.wire_message = Some(message.into());
        self
    }

    pub fn add_child(&mut self, child: Arc<OpError>) {
        self.children.push(child);
    }

    /// Whether the error carries an explicit status code, as opposed to
    /// one that would have to be inferred.
    pub fn has_clear_status(&self) -> bool {
        self.code.is_some()
    }

    pub fn children(&self) -> &[Arc<OpError>] {
        &self.children
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    pub fn wire_message(&self) -> Option<&str> {
        self.wire_message.as_deref()
    }

    /// Resolve to a (code, details) pair. Errors without an explicit code
    /// map to `Unknown`; the details fall back to the error message.
    pub fn to_status(&self) -> (Code, String) {
        let code = self.code.unwrap_or(Code::Unknown);
        let details = match &self.wire_message {
            Some(m) => m.clone(),
            None => self.message.clone(),
        };
        (code, details)
    }
}

impl fmt::Display for OpError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)?;
        if let Some(code) = self.code {
            write!(f, " (status: {})", code)?;
        }
        if !self.children.is_empty() {
            write!(f, " [")?;
            for (i, child) in self.children.iter().enumerate() {
                if i > 0 {
                    write!(f, "; ")?;
                }
                write!(f, "{}", child)?;
            }
            write!(f, "]")?;
        }
        Ok(())
    }
}

impl std::error::Error for OpError {}

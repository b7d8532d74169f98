//! Call outcome classification.
//!
//! Interceptors only ever look at the final status of a call. This module
//! turns that status into the label used by metrics and logs and into the
//! severity a call record is emitted with.

use crate::call::Protocol;
use http::{HeaderMap, StatusCode};
use std::borrow::Cow;
use std::fmt;
use tonic::Code;

pub const GRPC_STATUS_HEADER: &str = "grpc-status";

/// Status code reported by nginx and most proxies for a client that went
/// away before a response was written.
pub const HTTP_CLIENT_CLOSED_REQUEST: u16 = 499;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Severity {
    Info,
    Warn,
    Error,
}

/// Final status of a call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallOutcome {
    Grpc(Code),
    Http(StatusCode),
}

impl CallOutcome {
    /// Outcome for a fault caught while the handler was running.
    pub fn internal(protocol: Protocol) -> Self {
        match protocol {
            Protocol::Grpc => Self::Grpc(Code::Internal),
            Protocol::Http => Self::Http(StatusCode::INTERNAL_SERVER_ERROR),
        }
    }

    /// Outcome for a call abandoned before it produced a final status.
    pub fn cancelled(protocol: Protocol) -> Self {
        match protocol {
            Protocol::Grpc => Self::Grpc(Code::Cancelled),
            Protocol::Http => Self::Http(
                StatusCode::from_u16(HTTP_CLIENT_CLOSED_REQUEST)
                    .unwrap_or(StatusCode::BAD_REQUEST),
            ),
        }
    }

    pub fn is_success(&self) -> bool {
        match self {
            Self::Grpc(code) => *code == Code::Ok,
            Self::Http(status) => status.as_u16() < 400,
        }
    }

    pub fn is_failure(&self) -> bool {
        !self.is_success()
    }

    /// Success is informational, client-class failures warn and
    /// server-class failures are errors.
    pub fn severity(&self) -> Severity {
        match self {
            Self::Grpc(code) => grpc_severity(*code),
            Self::Http(status) if status.is_server_error() => Severity::Error,
            Self::Http(status) if status.is_client_error() => Severity::Warn,
            Self::Http(_) => Severity::Info,
        }
    }

    /// Label used for the status attribute of metrics and logs.
    pub fn label(&self) -> Cow<'static, str> {
        match self {
            Self::Grpc(code) => Cow::Borrowed(grpc_code_name(*code)),
            Self::Http(status) => Cow::Owned(status.as_str().to_owned()),
        }
    }

    /// HTTP statuses collapse to their class (`2xx`, `4xx`, ...); gRPC codes
    /// are left as is.
    pub fn normalized_label(&self) -> Cow<'static, str> {
        match self {
            Self::Http(status) => Cow::Owned(format!("{}xx", status.as_u16() / 100)),
            Self::Grpc(_) => self.label(),
        }
    }

    /// Numeric form of the status.
    pub fn code(&self) -> i64 {
        match self {
            Self::Grpc(code) => *code as i64,
            Self::Http(status) => i64::from(status.as_u16()),
        }
    }
}

impl fmt::Display for CallOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.label())
    }
}

/// Reads the gRPC status carried by headers or trailers.
pub fn grpc_code(headers: &HeaderMap) -> Option<Code> {
    headers
        .get(GRPC_STATUS_HEADER)?
        .to_str()
        .ok()?
        .trim()
        .parse::<i32>()
        .ok()
        .map(Code::from_i32)
}

fn grpc_severity(code: Code) -> Severity {
    match code {
        Code::Ok => Severity::Info,
        Code::Cancelled
        | Code::InvalidArgument
        | Code::NotFound
        | Code::AlreadyExists
        | Code::PermissionDenied
        | Code::Unauthenticated
        | Code::ResourceExhausted
        | Code::FailedPrecondition
        | Code::Aborted
        | Code::OutOfRange => Severity::Warn,
        Code::Unknown
        | Code::DeadlineExceeded
        | Code::Unimplemented
        | Code::Internal
        | Code::Unavailable
        | Code::DataLoss => Severity::Error,
    }
}

/// Canonical gRPC code names, as other gRPC implementations print them.
pub fn grpc_code_name(code: Code) -> &'static str {
    match code {
        Code::Ok => "OK",
        Code::Cancelled => "Canceled",
        Code::Unknown => "Unknown",
        Code::InvalidArgument => "InvalidArgument",
        Code::DeadlineExceeded => "DeadlineExceeded",
        Code::NotFound => "NotFound",
        Code::AlreadyExists => "AlreadyExists",
        Code::PermissionDenied => "PermissionDenied",
        Code::ResourceExhausted => "ResourceExhausted",
        Code::FailedPrecondition => "FailedPrecondition",
        Code::Aborted => "Aborted",
        Code::OutOfRange => "OutOfRange",
        Code::Unimplemented => "Unimplemented",
        Code::Internal => "Internal",
        Code::Unavailable => "Unavailable",
        Code::DataLoss => "DataLoss",
        Code::Unauthenticated => "Unauthenticated",
    }
}

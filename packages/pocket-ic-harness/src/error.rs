//! Errors surfaced by the harness and the reject envelope returned by the backend.

use crate::common::rest::InstanceId;
use candid::Principal;
use serde::{de::Error as _, Deserialize, Deserializer, Serialize};
use std::{fmt, path::PathBuf, time::Duration};
use strum_macros::{EnumString, IntoStaticStr};
use thiserror::Error;

/// Everything that can go wrong while talking to a PocketIC backend.
///
/// The variants fall into five classes: startup failures, connection failures
/// (see [`PocketIcError::is_connection_error`]), protocol violations, application
/// rejections (see [`PocketIcError::reject`]) and caller misuse
/// (see [`PocketIcError::is_caller_error`]). Caller misuse is always detected
/// before any request is sent.
#[derive(Debug, Error)]
pub enum PocketIcError {
    #[error(
        "could not find the PocketIC binary at {path:?} (running from {cwd}); \
         place it in the current working directory or point the POCKET_IC_BIN \
         environment variable at it"
    )]
    BinaryNotFound { path: PathBuf, cwd: String },

    #[error("failed to launch the PocketIC binary {path:?}: {source}")]
    ServerLaunch {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("PocketIC server failed to start within {0:?}")]
    StartupTimeout(Duration),

    #[error("invalid PocketIC port file {path:?}: {reason}")]
    InvalidPortFile { path: PathBuf, reason: String },

    #[error("PocketIC server returned status code {status}: \"{message}\"")]
    Server { status: u16, message: String },

    #[error("HTTP request to the PocketIC server failed: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("malformed response ({reason}): {payload}")]
    ProtocolViolation { reason: String, payload: String },

    #[error("request returned \"Err\": {0}")]
    Rejected(RejectResponse),

    #[error("canister {canister_id} already exists: {reject}")]
    CanisterAlreadyExists {
        canister_id: Principal,
        reject: RejectResponse,
    },

    #[error("canister id {canister_id} is not hosted by any subnet: {reject}")]
    CanisterNotHosted {
        canister_id: Principal,
        reject: RejectResponse,
    },

    #[error("method `{method}` expects {expected} argument(s) but {actual} were supplied")]
    ArityMismatch {
        method: String,
        expected: usize,
        actual: usize,
    },

    #[error("the canister interface declares no method `{0}`")]
    UnknownMethod(String),

    #[error("malformed candid interface: {0}")]
    MalformedInterface(String),

    #[error("invalid arguments: {0}")]
    InvalidArguments(String),

    #[error("unsupported blob compression `{0}`: only `gzip` is supported")]
    UnsupportedCompression(String),

    #[error("invalid instance configuration: {0}")]
    InvalidConfig(String),

    #[error("PocketIC instance {0} has already been deleted")]
    InstanceDeleted(InstanceId),

    #[error("candid error: {0}")]
    Candid(#[from] candid::Error),
}

impl PocketIcError {
    pub(crate) fn protocol_violation(reason: impl ToString, payload: impl ToString) -> Self {
        PocketIcError::ProtocolViolation {
            reason: reason.to_string(),
            payload: payload.to_string(),
        }
    }

    /// The backend could not be reached or answered with a non-success HTTP status.
    pub fn is_connection_error(&self) -> bool {
        matches!(
            self,
            PocketIcError::Server { .. } | PocketIcError::Transport(_)
        )
    }

    /// A well-formed `Err` envelope came back from the backend.
    pub fn is_rejection(&self) -> bool {
        self.reject().is_some()
    }

    /// The call never left the client because the caller got something wrong.
    pub fn is_caller_error(&self) -> bool {
        matches!(
            self,
            PocketIcError::ArityMismatch { .. }
                | PocketIcError::UnknownMethod(_)
                | PocketIcError::MalformedInterface(_)
                | PocketIcError::InvalidArguments(_)
                | PocketIcError::UnsupportedCompression(_)
                | PocketIcError::InvalidConfig(_)
                | PocketIcError::InstanceDeleted(_)
        )
    }

    pub fn reject(&self) -> Option<&RejectResponse> {
        match self {
            PocketIcError::Rejected(reject)
            | PocketIcError::CanisterAlreadyExists { reject, .. }
            | PocketIcError::CanisterNotHosted { reject, .. } => Some(reject),
            _ => None,
        }
    }

    /// The symbolic error code of an application rejection.
    pub fn error_code(&self) -> Option<ErrorCode> {
        self.reject().map(|reject| reject.error_code)
    }
}

/// The `Err` half of a call envelope.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RejectResponse {
    pub reject_code: RejectCode,
    pub reject_message: String,
    pub error_code: ErrorCode,
    #[serde(default)]
    pub certified: bool,
}

impl fmt::Display for RejectResponse {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // E.g. "CanisterReject (IC0405, CanisterNotHostedBySubnet): Canister ... not hosted"
        write!(
            f,
            "{:?} ({}, {:?}): {}",
            self.reject_code, self.error_code, self.error_code, self.reject_message
        )
    }
}

#[derive(Clone, Copy, Debug)]
pub enum TryFromError {
    ValueOutOfRange(u64),
}

/// Reject codes classify rejections for programmatic handling.
#[derive(
    Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, EnumString, IntoStaticStr,
)]
pub enum RejectCode {
    SysFatal = 1,
    SysTransient = 2,
    DestinationInvalid = 3,
    CanisterReject = 4,
    CanisterError = 5,
    SysUnknown = 6,
}

impl TryFrom<u64> for RejectCode {
    type Error = TryFromError;
    fn try_from(code: u64) -> Result<Self, Self::Error> {
        match code {
            1 => Ok(RejectCode::SysFatal),
            2 => Ok(RejectCode::SysTransient),
            3 => Ok(RejectCode::DestinationInvalid),
            4 => Ok(RejectCode::CanisterReject),
            5 => Ok(RejectCode::CanisterError),
            6 => Ok(RejectCode::SysUnknown),
            _ => Err(TryFromError::ValueOutOfRange(code)),
        }
    }
}

/// User-facing error codes.
///
/// The error codes are assigned using an HTTP-like convention: the most
/// significant digit is the corresponding reject code and the rest is a
/// sequentially assigned two-digit number.
#[derive(
    Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, EnumString, IntoStaticStr,
)]
pub enum ErrorCode {
    // 1xx -- `RejectCode::SysFatal`
    SubnetOversubscribed = 101,
    MaxNumberOfCanistersReached = 102,
    // 2xx -- `RejectCode::SysTransient`
    CanisterQueueFull = 201,
    IngressMessageTimeout = 202,
    CanisterQueueNotEmpty = 203,
    IngressHistoryFull = 204,
    CanisterIdAlreadyExists = 205,
    StopCanisterRequestTimeout = 206,
    CanisterOutOfCycles = 207,
    CertifiedStateUnavailable = 208,
    CanisterInstallCodeRateLimited = 209,
    CanisterHeapDeltaRateLimited = 210,
    // 3xx -- `RejectCode::DestinationInvalid`
    CanisterNotFound = 301,
    CanisterSnapshotNotFound = 305,
    // 4xx -- `RejectCode::CanisterReject`
    InsufficientMemoryAllocation = 402,
    InsufficientCyclesForCreateCanister = 403,
    SubnetNotFound = 404,
    CanisterNotHostedBySubnet = 405,
    CanisterRejectedMessage = 406,
    UnknownManagementMessage = 407,
    InvalidManagementPayload = 408,
    CanisterSnapshotImmutable = 409,
    // 5xx -- `RejectCode::CanisterError`
    CanisterTrapped = 502,
    CanisterCalledTrap = 503,
    CanisterContractViolation = 504,
    CanisterInvalidWasm = 505,
    CanisterDidNotReply = 506,
    CanisterOutOfMemory = 507,
    CanisterStopped = 508,
    CanisterStopping = 509,
    CanisterNotStopped = 510,
    CanisterStoppingCancelled = 511,
    CanisterInvalidController = 512,
    CanisterFunctionNotFound = 513,
    CanisterNonEmpty = 514,
    QueryCallGraphLoopDetected = 517,
    InsufficientCyclesInCall = 520,
    CanisterWasmEngineError = 521,
    CanisterInstructionLimitExceeded = 522,
    CanisterMemoryAccessLimitExceeded = 524,
    QueryCallGraphTooDeep = 525,
    QueryCallGraphTotalInstructionLimitExceeded = 526,
    CompositeQueryCalledInReplicatedMode = 527,
    QueryTimeLimitExceeded = 528,
    QueryCallGraphInternal = 529,
    InsufficientCyclesInComputeAllocation = 530,
    InsufficientCyclesInMemoryAllocation = 531,
    InsufficientCyclesInMemoryGrow = 532,
    ReservedCyclesLimitExceededInMemoryAllocation = 533,
    ReservedCyclesLimitExceededInMemoryGrow = 534,
    InsufficientCyclesInMessageMemoryGrow = 535,
    CanisterMethodNotFound = 536,
    CanisterWasmModuleNotFound = 537,
    CanisterAlreadyInstalled = 538,
    CanisterWasmMemoryLimitExceeded = 539,
    ReservedCyclesLimitIsTooLow = 540,
    // 6xx -- `RejectCode::SysUnknown`
    DeadlineExpired = 601,
    ResponseDropped = 602,
}

impl ErrorCode {
    /// The symbolic name, e.g. `"CanisterAlreadyInstalled"`.
    pub fn as_str(self) -> &'static str {
        self.into()
    }
}

impl TryFrom<u64> for ErrorCode {
    type Error = TryFromError;
    fn try_from(err: u64) -> Result<ErrorCode, Self::Error> {
        use ErrorCode::*;
        let code = match err {
            101 => SubnetOversubscribed,
            102 => MaxNumberOfCanistersReached,
            201 => CanisterQueueFull,
            202 => IngressMessageTimeout,
            203 => CanisterQueueNotEmpty,
            204 => IngressHistoryFull,
            205 => CanisterIdAlreadyExists,
            206 => StopCanisterRequestTimeout,
            207 => CanisterOutOfCycles,
            208 => CertifiedStateUnavailable,
            209 => CanisterInstallCodeRateLimited,
            210 => CanisterHeapDeltaRateLimited,
            301 => CanisterNotFound,
            305 => CanisterSnapshotNotFound,
            402 => InsufficientMemoryAllocation,
            403 => InsufficientCyclesForCreateCanister,
            404 => SubnetNotFound,
            405 => CanisterNotHostedBySubnet,
            406 => CanisterRejectedMessage,
            407 => UnknownManagementMessage,
            408 => InvalidManagementPayload,
            409 => CanisterSnapshotImmutable,
            502 => CanisterTrapped,
            503 => CanisterCalledTrap,
            504 => CanisterContractViolation,
            505 => CanisterInvalidWasm,
            506 => CanisterDidNotReply,
            507 => CanisterOutOfMemory,
            508 => CanisterStopped,
            509 => CanisterStopping,
            510 => CanisterNotStopped,
            511 => CanisterStoppingCancelled,
            512 => CanisterInvalidController,
            513 => CanisterFunctionNotFound,
            514 => CanisterNonEmpty,
            517 => QueryCallGraphLoopDetected,
            520 => InsufficientCyclesInCall,
            521 => CanisterWasmEngineError,
            522 => CanisterInstructionLimitExceeded,
            524 => CanisterMemoryAccessLimitExceeded,
            525 => QueryCallGraphTooDeep,
            526 => QueryCallGraphTotalInstructionLimitExceeded,
            527 => CompositeQueryCalledInReplicatedMode,
            528 => QueryTimeLimitExceeded,
            529 => QueryCallGraphInternal,
            530 => InsufficientCyclesInComputeAllocation,
            531 => InsufficientCyclesInMemoryAllocation,
            532 => InsufficientCyclesInMemoryGrow,
            533 => ReservedCyclesLimitExceededInMemoryAllocation,
            534 => ReservedCyclesLimitExceededInMemoryGrow,
            535 => InsufficientCyclesInMessageMemoryGrow,
            536 => CanisterMethodNotFound,
            537 => CanisterWasmModuleNotFound,
            538 => CanisterAlreadyInstalled,
            539 => CanisterWasmMemoryLimitExceeded,
            540 => ReservedCyclesLimitIsTooLow,
            601 => DeadlineExpired,
            602 => ResponseDropped,
            _ => return Err(TryFromError::ValueOutOfRange(err)),
        };
        Ok(code)
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // E.g. "IC0301"
        write!(f, "IC{:04}", *self as i32)
    }
}

/// Codes arrive either by name (`"CanisterReject"`) or by number (`4`),
/// depending on the backend generation.
#[derive(Deserialize)]
#[serde(untagged)]
enum CodeRepr {
    Number(u64),
    Name(String),
}

fn deserialize_code<'de, D, T>(deserializer: D, kind: &str) -> Result<T, D::Error>
where
    D: Deserializer<'de>,
    T: TryFrom<u64> + std::str::FromStr,
{
    match CodeRepr::deserialize(deserializer)? {
        CodeRepr::Number(n) => {
            T::try_from(n).map_err(|_| D::Error::custom(format!("unknown {kind} {n}")))
        }
        CodeRepr::Name(name) => name
            .parse()
            .map_err(|_| D::Error::custom(format!("unknown {kind} `{name}`"))),
    }
}

impl<'de> Deserialize<'de> for RejectCode {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        deserialize_code(deserializer, "reject code")
    }
}

impl<'de> Deserialize<'de> for ErrorCode {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        deserialize_code(deserializer, "error code")
    }
}

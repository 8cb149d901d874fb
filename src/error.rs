// Copyright 2023, The Android Open Source Project
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Error taxonomy of the card emulation core.

use thiserror::Error;

/// Result type returned by the card emulation APIs.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors reported by the card emulation core.
///
/// None of these are fatal: the event loop logs them and keeps the last
/// good state.
#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum Error {
    /// Caller lacks rights, or the caller uid does not own the service.
    #[error("permission denied: {0}")]
    PermissionDenied(String),

    /// Malformed AID string, or AID length outside 5..=16 bytes.
    #[error("invalid AID: {0}")]
    InvalidAid(String),

    /// Reserved or unknown symbolic route, or other invalid input.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// Unknown component or user.
    #[error("not found: {0}")]
    NotFound(String),

    /// The controller refused the routing plan; the prior plan is preserved.
    #[error("routing rejected: {0}")]
    RoutingRejected(String),

    /// Resolver rebuild failed; the caller may retry.
    #[error("rebuild failed: {0}")]
    RebuildFailed(String),

    /// NFC state change or service-bind watchdog expired.
    #[error("timeout: {0}")]
    Timeout(String),

    #[error("internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Short stable name of the error kind, used in listener callbacks.
    pub fn kind(&self) -> &'static str {
        match self {
            Error::PermissionDenied(_) => "permission_denied",
            Error::InvalidAid(_) => "invalid_aid",
            Error::InvalidArgument(_) => "invalid_argument",
            Error::NotFound(_) => "not_found",
            Error::RoutingRejected(_) => "routing_rejected",
            Error::RebuildFailed(_) => "rebuild_failed",
            Error::Timeout(_) => "timeout",
            Error::Internal(_) => "internal",
        }
    }
}

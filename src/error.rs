// Copyright (c) 2026 The TSCTP Authors.
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

//! Error type for sctp operations.

use strum::IntoEnumIterator;
use strum_macros::EnumIter;

/// SCTP output error.
///
/// Flow-control outcomes (rwnd full, delay, pmtu full) are not errors; they
/// are reported through [`Verdict`]. This type only covers fatal conditions
/// of the output path.
///
/// [`Verdict`]: crate::packet::Verdict
#[derive(Clone, Debug, Default, PartialEq, Eq, EnumIter)]
pub enum Error {
    /// The operation completed without error.
    #[default]
    NoError,

    /// The transport has no usable route to the peer and a fresh lookup
    /// did not produce one.
    NoRoute,

    /// The accumulated packet exceeds the path MTU, IP fragmentation is not
    /// permitted, and the sending socket cannot use segmentation offload.
    GsoUnsupported,

    /// A bundled AUTH chunk plus a single following chunk cannot fit into
    /// one path-MTU sized sub-packet. The endpoint is misconfigured.
    InvalidConfig(String),

    /// The operation cannot be completed because it was attempted in an
    /// invalid state.
    InvalidState(String),

    /// The provided buffer is too short.
    BufferTooShort,

    /// The provided packet or chunk cannot be parsed.
    InvalidPacket,

    /// A cryptographic operation failed.
    CryptoFail,

    /// I/O error.
    IoError(String),
}

impl Error {
    /// Return the error number recorded in the socket error slot.
    ///
    /// Fatal output-path errors are never surfaced as verdicts; the caller
    /// observes them through this negative integer, like a kernel errno.
    pub(crate) fn to_errno(&self) -> i64 {
        match self {
            Error::NoError => 0,
            Error::NoRoute => -1,
            Error::GsoUnsupported => -2,
            Error::InvalidConfig(_) => -3,
            Error::InvalidState(_) => -4,
            Error::BufferTooShort => -5,
            Error::InvalidPacket => -6,
            Error::CryptoFail => -7,
            Error::IoError(_) => -8,
        }
    }
}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "{:?}", self)
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        None
    }
}

impl std::convert::From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Error::IoError(format!("{}", err))
    }
}

// SPDX-License-Identifier: AGPL-3.0-or-later
// PointLock - Pessimistic Lock Manager for Transactional Key-Value Engines
// Copyright (C) 2026 PointLock Contributors
//
// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU Affero General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE. See the
// GNU Affero General Public License for more details.
//
// You should have received a copy of the GNU Affero General Public License
// along with this program. If not, see <https://www.gnu.org/licenses/>.

//! Error types for lock acquisition
//!
//! Nothing here is retried internally; every error is surfaced to the
//! transaction layer, which decides whether to re-drive the operation.

use std::fmt;
use thiserror::Error;

use crate::txn::ColumnFamilyId;

/// Result type for lock manager operations
pub type LockResult<T> = std::result::Result<T, LockError>;

/// Errors surfaced by [`LockManager::try_lock`](crate::LockManager::try_lock)
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum LockError {
    /// No lock table is registered for the column family
    #[error("column family {0} not found")]
    UnknownColumnFamily(ColumnFamilyId),

    /// A deadline elapsed before the lock could be taken
    #[error("timed out: {kind}")]
    TimedOut { kind: TimeoutKind },

    /// The request cannot be granted right now and retrying later is the
    /// caller's decision
    #[error("busy: {kind}")]
    Busy { kind: BusyKind },
}

/// What exactly timed out
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimeoutKind {
    /// The transaction's lock timeout elapsed while the key stayed held
    Lock,
    /// The stripe mutex itself could not be acquired within the timeout
    StripeMutex,
}

impl fmt::Display for TimeoutKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Lock => write!(f, "lock wait deadline exceeded"),
            Self::StripeMutex => write!(f, "stripe mutex acquisition deadline exceeded"),
        }
    }
}

/// Why the request was refused without waiting further
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BusyKind {
    /// The column family is at its configured cap of held locks
    LockLimit,
    /// Blocking would close a cycle in the wait-for graph. Cycle searches
    /// deeper than the transaction's detection depth are reported as
    /// deadlocks too, so callers must treat this as genuine.
    Deadlock,
}

impl fmt::Display for BusyKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::LockLimit => write!(f, "lock limit reached"),
            Self::Deadlock => write!(f, "deadlock detected"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        assert_eq!(
            LockError::UnknownColumnFamily(7).to_string(),
            "column family 7 not found"
        );
        assert_eq!(
            LockError::TimedOut {
                kind: TimeoutKind::Lock
            }
            .to_string(),
            "timed out: lock wait deadline exceeded"
        );
        assert_eq!(
            LockError::Busy {
                kind: BusyKind::Deadlock
            }
            .to_string(),
            "busy: deadlock detected"
        );
    }
}

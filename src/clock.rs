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

//! Time source for expiration and timeout arithmetic

use std::time::{SystemTime, UNIX_EPOCH};

/// Microsecond clock backing lock expiration and wait deadlines.
///
/// Implementations only need to be monotonic enough for deadlines to make
/// sense; reads from different threads may be slightly out of order.
/// Transaction expiration times must be expressed on the same clock.
pub trait Clock: Send + Sync {
    /// Microseconds since an arbitrary fixed epoch.
    fn now_micros(&self) -> u64;
}

/// Wall-clock time measured from the Unix epoch.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now_micros(&self) -> u64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|elapsed| elapsed.as_micros() as u64)
            .unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_system_clock_advances() {
        let clock = SystemClock;
        let first = clock.now_micros();
        std::thread::sleep(std::time::Duration::from_millis(2));
        assert!(clock.now_micros() > first);
    }
}

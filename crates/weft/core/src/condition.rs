// Weft
// Copyright (C) 2026 Weft Contributors

// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU Affero General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.

// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
// GNU Affero General Public License for more details.

// You should have received a copy of the GNU Affero General Public License
// along with this program.  If not, see <http://www.gnu.org/licenses/>.

//! One-shot condition latch.
//!
//! Once notified, a condition never resets: later waits return immediately.
//! Waiters are resumed in enqueue order.

use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::Mutex;

use crate::task::Task;

pub struct Condition {
    notified: AtomicBool,
    pub(crate) waitq: Mutex<VecDeque<Arc<Task>>>,
}

impl Condition {
    pub(crate) fn new() -> Arc<Self> {
        Arc::new(Self {
            notified: AtomicBool::new(false),
            waitq: Mutex::new(VecDeque::new()),
        })
    }

    /// Whether the latch has fired.
    pub fn is_notified(&self) -> bool {
        self.notified.load(Ordering::Acquire)
    }

    pub(crate) fn set_notified(&self) {
        self.notified.store(true, Ordering::Release);
    }
}

impl std::fmt::Debug for Condition {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Condition")
            .field("notified", &self.is_notified())
            .field("waiters", &self.waitq.lock().len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_latch_is_monotone() {
        let cond = Condition::new();
        assert!(!cond.is_notified());
        cond.set_notified();
        assert!(cond.is_notified());
        cond.set_notified();
        assert!(cond.is_notified());
    }
}

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

use thiserror::Error;

pub type RuntimeResult<T> = Result<T, RuntimeError>;

/// Errors surfaced by the scheduling core.
///
/// User-code panics never cross a worker: they are captured on the failing
/// task and reported through `TaskFailed`. Protocol violations inside the
/// scheduler itself (arrival counter overflow, a fiber returning without a
/// park action) are programmer errors and panic instead.
#[derive(Error, Debug)]
pub enum RuntimeError {
    #[error("multiqueue heap at capacity")]
    QueueFull,

    #[error("grain fan-out is incomplete: expected {expected} sibling tasks, found {found}")]
    MissingSibling { expected: usize, found: usize },

    #[error("synchronization tree pool exhausted")]
    PoolExhausted,

    #[error("failed to allocate fiber stack: {0}")]
    StackAllocation(String),

    #[error("failed to start worker thread: {0}")]
    ThreadSpawn(String),

    #[error("task failed with a captured panic")]
    TaskFailed,

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
}

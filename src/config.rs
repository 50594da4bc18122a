// Copyright 2024 Saptak Santra
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

//! Repository and scheduler configuration

use std::time::Duration;

use crate::error::{InfernoError, Result};

/// Bits available for the id payload; the two high bits are flags.
pub const ID_PAYLOAD_BITS: u32 = 30;
pub const MIN_CHUNK_BITS: u32 = 10;
pub const MAX_CHUNK_BITS: u32 = 24;
pub const MIN_CHUNK_COUNT_BITS: u32 = 6;
pub const MAX_CHUNK_COUNT_BITS: u32 = 20;
pub const MIN_TYPE_INDEX_BITS: u32 = 14;
pub const MAX_TYPE_INDEX_BITS: u32 = 24;

pub const DEFAULT_TYPE_INDEX_BITS: u32 = 20;
pub const DEFAULT_CHUNK_BITS: u32 = 14;
pub const DEFAULT_CHUNK_COUNT_BITS: u32 = 16;
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(3);

/// Constructor parameters for a [`Repository`](crate::Repository).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RepositoryConfig {
    pub name: String,
    /// Capacity hint for the type index, clamped to `[14, 24]`.
    pub type_index_bits: u32,
    /// log2 of the slots per chunk.
    pub chunk_bits: u32,
    /// log2 of the maximum number of chunks.
    pub chunk_count_bits: u32,
    /// Bound applied to every blocking wait.
    pub timeout: Duration,
}

impl RepositoryConfig {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Self::default()
        }
    }

    pub fn with_type_index_bits(mut self, bits: u32) -> Self {
        self.type_index_bits = bits.clamp(MIN_TYPE_INDEX_BITS, MAX_TYPE_INDEX_BITS);
        self
    }

    pub fn with_chunk_bits(mut self, bits: u32) -> Self {
        self.chunk_bits = bits;
        self
    }

    pub fn with_chunk_count_bits(mut self, bits: u32) -> Self {
        self.chunk_count_bits = bits;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Initial capacity for the type index maps.
    pub fn type_index_capacity(&self) -> usize {
        // Only a hint; the index grows past it on demand.
        1usize << (self.type_index_bits.clamp(MIN_TYPE_INDEX_BITS, MAX_TYPE_INDEX_BITS) - 10)
    }

    /// Check the chunk layout against the id payload width.
    pub fn validate(&self) -> Result<()> {
        validate_chunk_layout(self.chunk_bits, self.chunk_count_bits)?;
        if self.timeout.is_zero() {
            return Err(InfernoError::InvalidConfig("timeout must be non-zero".into()));
        }
        Ok(())
    }
}

impl Default for RepositoryConfig {
    fn default() -> Self {
        Self {
            name: "inferno".to_string(),
            type_index_bits: DEFAULT_TYPE_INDEX_BITS,
            chunk_bits: DEFAULT_CHUNK_BITS,
            chunk_count_bits: DEFAULT_CHUNK_COUNT_BITS,
            timeout: DEFAULT_TIMEOUT,
        }
    }
}

/// Validate a `|chunk index|slot|` split of the id payload.
pub fn validate_chunk_layout(chunk_bits: u32, chunk_count_bits: u32) -> Result<()> {
    if !(MIN_CHUNK_BITS..=MAX_CHUNK_BITS).contains(&chunk_bits) {
        return Err(InfernoError::InvalidConfig(format!(
            "chunk_bits {chunk_bits} outside [{MIN_CHUNK_BITS}, {MAX_CHUNK_BITS}]"
        )));
    }
    if !(MIN_CHUNK_COUNT_BITS..=MAX_CHUNK_COUNT_BITS).contains(&chunk_count_bits) {
        return Err(InfernoError::InvalidConfig(format!(
            "chunk_count_bits {chunk_count_bits} outside [{MIN_CHUNK_COUNT_BITS}, {MAX_CHUNK_COUNT_BITS}]"
        )));
    }
    if chunk_bits + chunk_count_bits > ID_PAYLOAD_BITS {
        return Err(InfernoError::InvalidConfig(format!(
            "chunk_bits + chunk_count_bits = {} exceeds {ID_PAYLOAD_BITS}",
            chunk_bits + chunk_count_bits
        )));
    }
    Ok(())
}

/// Constructor parameters for a [`Scheduler`](crate::Scheduler).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SchedulerConfig {
    pub timeout: Duration,
    /// Work-stealing pool size; 0 uses the available hardware parallelism.
    pub worker_threads: usize,
}

impl SchedulerConfig {
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_worker_threads(mut self, threads: usize) -> Self {
        self.worker_threads = threads;
        self
    }

    pub(crate) fn resolved_workers(&self) -> usize {
        if self.worker_threads > 0 {
            return self.worker_threads;
        }
        std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(1)
    }
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            timeout: DEFAULT_TIMEOUT,
            worker_threads: 0,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        let config = RepositoryConfig::default();
        assert_eq!(config.chunk_bits, 14);
        assert_eq!(config.chunk_count_bits, 16);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_rejects_chunk_bits_out_of_range() {
        let config = RepositoryConfig::default().with_chunk_bits(9);
        assert!(matches!(config.validate(), Err(InfernoError::InvalidConfig(_))));

        let config = RepositoryConfig::default().with_chunk_count_bits(21);
        assert!(matches!(config.validate(), Err(InfernoError::InvalidConfig(_))));
    }

    #[test]
    fn test_rejects_oversized_layout() {
        let config = RepositoryConfig::default()
            .with_chunk_bits(20)
            .with_chunk_count_bits(12);
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_type_index_bits_clamped() {
        assert_eq!(RepositoryConfig::default().with_type_index_bits(2).type_index_bits, 14);
        assert_eq!(RepositoryConfig::default().with_type_index_bits(40).type_index_bits, 24);
    }

    #[test]
    fn test_scheduler_workers_resolve() {
        assert_eq!(SchedulerConfig::default().with_worker_threads(3).resolved_workers(), 3);
        assert!(SchedulerConfig::default().resolved_workers() >= 1);
    }
}

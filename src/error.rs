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

//! Error types

use std::fmt;

/// Inferno error type
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InfernoError {
    /// Constructor parameters out of range
    InvalidConfig(String),

    /// The same component type appears twice in one entity
    DuplicateComponent(&'static str),

    /// Emplace requires at least one component
    EmptyComponents,

    /// Every chunk of the id space is in use
    PoolExhausted { chunk_count: usize },

    /// Fork/join requested from a thread that is neither a driver nor a pool worker
    IllegalCaller,

    /// A bounded wait elapsed
    Timeout(String),

    /// A scheduler thread could not be started
    ThreadSpawn(String),

    /// The scheduler was already shut down
    SchedulerShutdown,

    /// The owning repository was dropped
    RepositoryClosed,
}

impl fmt::Display for InfernoError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            InfernoError::InvalidConfig(msg) => write!(f, "Invalid configuration: {msg}"),
            InfernoError::DuplicateComponent(name) => {
                write!(f, "Duplicate component type in one entity: {name}")
            }
            InfernoError::EmptyComponents => {
                write!(f, "Cannot emplace an entity without components")
            }
            InfernoError::PoolExhausted { chunk_count } => {
                write!(f, "Entity pool exhausted: all {chunk_count} chunks are in use")
            }
            InfernoError::IllegalCaller => {
                write!(f, "Fork/join must be called from a scheduler driver or worker thread")
            }
            InfernoError::Timeout(what) => write!(f, "Timed out waiting for {what}"),
            InfernoError::ThreadSpawn(msg) => write!(f, "Failed to spawn scheduler thread: {msg}"),
            InfernoError::SchedulerShutdown => write!(f, "Scheduler is shut down"),
            InfernoError::RepositoryClosed => write!(f, "Repository has been dropped"),
        }
    }
}

impl std::error::Error for InfernoError {}

impl From<std::io::Error> for InfernoError {
    fn from(err: std::io::Error) -> Self {
        InfernoError::ThreadSpawn(err.to_string())
    }
}

/// Result type alias
pub type Result<T> = std::result::Result<T, InfernoError>;

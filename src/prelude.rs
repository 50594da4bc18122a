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

pub use crate::component::{Bundle, Component, ComponentRef, ComponentSet, StateTag};
pub use crate::config::{RepositoryConfig, SchedulerConfig};
pub use crate::entity::Entity;
pub use crate::error::{InfernoError, Result};
pub use crate::pool::EntityId;
pub use crate::repository::Repository;
pub use crate::scheduler::{task, Scheduler, SchedulerState, Task, TaskContext, TaskId};
pub use crate::view::View;

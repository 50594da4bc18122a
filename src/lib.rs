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

//! Inferno - archetype entity/component storage
//!
//! Entities group typed components; entities sharing a signature live in
//! one [`Composition`]. Compositions are resolved through a lazily built,
//! concurrent archetype graph owned by a [`Repository`], and a [`Scheduler`]
//! drives staged, optionally parallel updates over it.

pub mod archetype;
pub mod array_pool;
pub mod component;
pub mod config;
pub mod entity;
pub mod error;
pub mod pool;
pub mod prelude;
pub mod repository;
pub mod scheduler;
pub mod time;
pub mod transmute;
pub mod type_index;
pub mod view;


pub use archetype::*;
pub use array_pool::*;
pub use component::*;
pub use config::*;
pub use entity::*;
pub use error::*;
pub use pool::*;
pub use repository::*;
pub use scheduler::*;
pub use type_index::*;
pub use view::*;

// SPDX-License-Identifier: Apache-2.0
// Copyright Open Network Fabric Authors

//! Synchronization primitives: the standard library ones, or their `shuttle` counterparts when the
//! `shuttle` feature is enabled, so that the mapper can be model-checked.

#[cfg(not(feature = "shuttle"))]
pub(crate) use std::sync::{Mutex, MutexGuard};

#[cfg(feature = "shuttle")]
pub(crate) use shuttle::sync::{Mutex, MutexGuard};

// shuttle reuses the std lock result types
pub(crate) use std::sync::PoisonError;

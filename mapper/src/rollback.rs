// SPDX-License-Identifier: Apache-2.0
// Copyright Open Network Fabric Authors

//! Undo log for a mapping being set up.

use crate::PortMapperError;
use crate::rules::{ForwardRule, IpVersion, RuleInstaller};
use portalloc::Protocol;
use std::net::IpAddr;
use std::sync::Arc;
use tracing::{debug, warn};

/// A resource acquired while setting up a mapping, and how to give it back.
#[derive(Debug)]
pub(crate) enum Undo {
    ReleasePort {
        ip: IpAddr,
        proto: Protocol,
        port: u16,
    },
    DeleteRule {
        version: IpVersion,
        chain: Arc<dyn RuleInstaller>,
        rule: ForwardRule,
    },
    StopRelay,
}

/// Steps to undo, most recent last. Each step is undone at most once.
#[derive(Debug, Default)]
pub(crate) struct Rollback {
    steps: Vec<Undo>,
}

impl Rollback {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn push(&mut self, step: Undo) {
        self.steps.push(step);
    }

    /// The mapping is complete: forget the steps.
    pub(crate) fn commit(self) {
        debug!("Committing mapping ({} steps)", self.steps.len());
    }

    /// Undo every step, newest first, after a failure caused by `cause`. All steps are attempted
    /// even if some fail; the first failure is reported alongside the cause.
    pub(crate) fn unwind<F>(self, cause: PortMapperError, mut undo: F) -> PortMapperError
    where
        F: FnMut(&Undo) -> Result<(), PortMapperError>,
    {
        debug!("Rolling back {} steps after error: {cause}", self.steps.len());
        let mut failure = None;
        for step in self.steps.iter().rev() {
            if let Err(e) = undo(step) {
                warn!("Failed to undo {step:?}: {e}");
                failure.get_or_insert(e);
            }
        }
        match failure {
            None => cause,
            Some(rollback) => PortMapperError::Rollback {
                cause: Box::new(cause),
                rollback: Box::new(rollback),
            },
        }
    }
}

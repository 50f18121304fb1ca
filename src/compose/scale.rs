//! Instance count control
//!
//! Counts are measured against running instances. Scaling down removes the
//! highest-numbered running instances. Scaling up first starts stopped
//! instances, lowest number first, then creates new ones at the lowest free
//! numbers.

use super::batch::BatchReport;
use super::config::ServiceConfig;
use super::reconcile::ReconcileEngine;
use crate::error::{ConvoyError, Result};
use std::collections::BTreeSet;
use std::time::Duration;

/// Operations needed to move a service to a target count
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ScalePlan {
    /// Running indices to stop and remove, highest first
    pub remove: Vec<u32>,
    /// Stopped indices to start
    pub start: Vec<u32>,
    /// New indices to create and start
    pub create: Vec<u32>,
}

impl ScalePlan {
    /// Plan from existing `(index, running)` pairs.
    ///
    /// Stopped instances are not counted. They are left alone unless the
    /// service needs more running instances.
    pub fn compute(existing: &[(u32, bool)], target: u32) -> Self {
        let target = target as usize;
        let indices = |running: bool| {
            let mut indices: Vec<u32> = existing
                .iter()
                .filter(|(_, r)| *r == running)
                .map(|(index, _)| *index)
                .collect();
            indices.sort_unstable();
            indices
        };
        let running = indices(true);
        let stopped = indices(false);

        let mut plan = Self::default();

        if running.len() > target {
            plan.remove = running[target..].iter().rev().copied().collect();
        } else if running.len() < target {
            let missing = target - running.len();
            plan.start = stopped.iter().take(missing).copied().collect();

            let used: BTreeSet<u32> = existing.iter().map(|(index, _)| *index).collect();
            plan.create = (1..)
                .filter(|index| !used.contains(index))
                .take(missing - plan.start.len())
                .collect();
        }

        plan
    }

    pub fn is_empty(&self) -> bool {
        self.remove.is_empty() && self.start.is_empty() && self.create.is_empty()
    }
}

/// Drives one service to a given number of running instances
pub struct ScaleController<'a> {
    reconciler: &'a ReconcileEngine,
}

impl<'a> ScaleController<'a> {
    pub fn new(reconciler: &'a ReconcileEngine) -> Self {
        Self { reconciler }
    }

    /// Scale `service` to exactly `target` running instances.
    ///
    /// Services with a fixed container name refuse targets above one before
    /// touching the engine.
    pub async fn scale(
        &self,
        service: &str,
        config: &ServiceConfig,
        target: u32,
        timeout: Duration,
    ) -> Result<BatchReport> {
        if target > 1 && !config.is_scalable() {
            return Err(ConvoyError::NotScalable {
                service: service.to_string(),
                requested: target,
            });
        }

        let observed = self.reconciler.observe().await?;
        let existing = observed.service(service);
        let states: Vec<(u32, bool)> = existing
            .iter()
            .map(|(index, c)| (*index, c.is_running()))
            .collect();
        let plan = ScalePlan::compute(&states, target);

        if plan.is_empty() {
            tracing::debug!("{} already has {} running instances", service, target);
            return Ok(BatchReport::new());
        }

        tracing::info!(
            "Scaling {} from {} to {} running instances",
            service,
            observed.running_count(service),
            target
        );

        let mut report = BatchReport::new();
        report.merge(
            self.reconciler
                .retire_instances(service, &observed.select(service, &plan.remove), timeout)
                .await,
        );
        report.merge(
            self.reconciler
                .start_instances(service, &observed.select(service, &plan.start))
                .await,
        );
        report.merge(
            self.reconciler
                .create_instances(service, config, &plan.create, &observed, true)
                .await,
        );
        Ok(report)
    }
}

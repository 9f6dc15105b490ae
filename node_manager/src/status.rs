/*
Copyright 2025 The Flame Authors.
Licensed under the Apache License, Version 2.0 (the "License");
you may not use this file except in compliance with the License.
You may obtain a copy of the License at
    http://www.apache.org/licenses/LICENSE-2.0
Unless required by applicable law or agreed to in writing, software
distributed under the License is distributed on an "AS IS" BASIS,
WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
See the License for the specific language governing permissions and
limitations under the License.
*/

use std::collections::HashMap;
use std::sync::Arc;

use chrono::Utc;
use tokio::sync::mpsc;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

use common::apis::{
    ConditionStatus, PodCondition, PodConditionType, PodPhase, PodRecord, PodStatus, PodUID,
    ProviderPodState, ReconcileKey, ResourceVersion,
};
use common::VkError;
use stdng::{lock_ptr, new_ptr, MutexPtr};

use crate::controller::PodControllerPtr;
use crate::ctx::{NodeContext, NodeContextPtr};
use crate::informer::PodInformerPtr;

const MAX_STATUS_ATTEMPTS: usize = 3;

/// Writes the status of `pod` after `mutate`, re-fetching it on conflicts.
pub async fn patch_pod_status<F>(
    ctx: &NodeContext,
    mut pod: PodRecord,
    mutate: F,
) -> Result<PodRecord, VkError>
where
    F: Fn(&mut PodStatus),
{
    let key = pod.key();
    let uid = pod.uid.clone();

    let mut last_err = VkError::Conflict(key.to_string());
    for attempt in 1..=MAX_STATUS_ATTEMPTS {
        if pod.uid != uid {
            return Err(VkError::NotFound(format!("{key} ({uid})")));
        }

        let mut status = pod.status.clone();
        mutate(&mut status);
        if status == pod.status {
            return Ok(pod);
        }
        pod.status = status;

        match ctx.client.update_pod_status(&pod).await {
            Ok(updated) => return Ok(updated),
            Err(e) if e.is_conflict() => {
                tracing::debug!("Status of pod <{key}> conflicted at attempt {attempt}, re-fetch it.");
                last_err = e;
                pod = ctx.client.get_pod(&key).await?;
            }
            Err(e) => return Err(e),
        }
    }

    Err(last_err)
}

/// Builds the control plane status from the provider state; transition times of unchanged
/// conditions are kept from `current`.
pub fn build_pod_status(
    current: &PodStatus,
    state: &ProviderPodState,
    host_ip: &str,
) -> PodStatus {
    let now = Utc::now();
    let containers_ready = state.phase == PodPhase::Running
        && !state.containers.is_empty()
        && state.containers.iter().all(|c| c.ready);
    let initialized = matches!(
        state.phase,
        PodPhase::Running | PodPhase::Succeeded | PodPhase::Failed
    );

    let conditions = [
        (PodConditionType::PodScheduled, true),
        (PodConditionType::Initialized, initialized),
        (PodConditionType::ContainersReady, containers_ready),
        (PodConditionType::Ready, containers_ready),
    ]
    .into_iter()
    .map(|(condition_type, value)| {
        let status = ConditionStatus::from(value);
        let last_transition_time = match current.condition(condition_type) {
            Some(c) if c.status == status => c.last_transition_time,
            _ => Some(now),
        };
        PodCondition {
            condition_type,
            status,
            last_transition_time,
            reason: None,
            message: None,
        }
    })
    .collect();

    PodStatus {
        phase: state.phase,
        conditions,
        container_statuses: state.containers.clone(),
        start_time: state.start_time,
        host_ip: Some(host_ip.to_string()),
        pod_ip: state.pod_ip.clone(),
        reason: None,
        message: state.message.clone(),
    }
}

#[derive(Clone, Debug)]
struct PushedStatus {
    uid: PodUID,
    resource_version: ResourceVersion,
    status: PodStatus,
}

pub type StatusSyncPtr = Arc<StatusSync>;

/// Pushes provider-observed pod status to the control plane, independently of reconciles.
pub struct StatusSync {
    ctx: NodeContextPtr,
    informer: PodInformerPtr,
    controller: PodControllerPtr,
    pushed: MutexPtr<HashMap<ReconcileKey, PushedStatus>>,
}

impl StatusSync {
    pub fn new(
        ctx: NodeContextPtr,
        informer: PodInformerPtr,
        controller: PodControllerPtr,
    ) -> StatusSyncPtr {
        Arc::new(StatusSync {
            ctx,
            informer,
            controller,
            pushed: new_ptr(HashMap::new()),
        })
    }

    pub async fn run(self: Arc<Self>, cancel: CancellationToken) {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let notified = self.ctx.provider.notify_pods(tx);
        if !notified {
            tracing::info!("Provider does not push pod status, poll it only.");
        }

        let mut interval = tokio::time::interval(self.ctx.controller.status_sync_interval);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = interval.tick() => self.sync_all().await,
                Some(key) = rx.recv(), if notified => {
                    if let Some(pod) = self.informer.get(&key) {
                        if let Err(e) = self.sync_pod(&pod).await {
                            tracing::warn!("Failed to sync status of pod <{key}>: {e}");
                        }
                    }
                }
            }
        }

        tracing::debug!("Status sync of node <{}> exited.", self.ctx.node_name);
    }

    pub async fn sync_all(&self) {
        let pods = self.informer.list();
        if let Ok(mut pushed) = lock_ptr!(self.pushed) {
            pushed.retain(|key, p| pods.iter().any(|pod| &pod.key() == key && pod.uid == p.uid));
        }

        for pod in pods {
            if let Err(e) = self.sync_pod(&pod).await {
                tracing::warn!("Failed to sync status of pod <{}>: {e}", pod.key());
            }
        }
    }

    /// Returns true when a status was written.
    pub async fn sync_pod(&self, pod: &PodRecord) -> Result<bool, VkError> {
        let key = pod.key();
        if pod.is_deleting() || self.controller.is_parked(pod) {
            return Ok(false);
        }

        let state = match self.ctx.provider.get_pod_status(&key).await {
            Ok(state) => state,
            // Not created yet, the reconciler takes care of it.
            Err(e) if e.is_not_found() => return Ok(false),
            Err(e) => return Err(e),
        };
        if !state.uid.is_empty() && state.uid != pod.uid {
            return Ok(false);
        }

        let status = build_pod_status(&pod.status, &state, &self.ctx.internal_ip);
        if status == pod.status {
            return Ok(false);
        }

        // The cache may not have observed our last write yet.
        let in_flight = lock_ptr!(self.pushed)?.get(&key).is_some_and(|p| {
            p.uid == pod.uid
                && p.resource_version > pod.resource_version
                && build_pod_status(&p.status, &state, &self.ctx.internal_ip) == p.status
        });
        if in_flight {
            return Ok(false);
        }

        // The pod may be parked while the provider call is in flight; its failure status wins.
        let updated = patch_pod_status(&self.ctx, pod.clone(), |s| {
            if !self.controller.is_parked(pod) {
                *s = build_pod_status(s, &state, &self.ctx.internal_ip)
            }
        })
        .await?;
        if self.controller.is_parked(pod) {
            return Ok(false);
        }

        tracing::debug!("Status of pod <{key}> was updated to {}.", updated.status.phase);
        lock_ptr!(self.pushed)?.insert(
            key,
            PushedStatus {
                uid: updated.uid.clone(),
                resource_version: updated.resource_version,
                status: updated.status,
            },
        );

        Ok(true)
    }
}

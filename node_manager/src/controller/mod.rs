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

use common::apis::{
    Event, EventType, PodPhase, PodRecord, PodSpec, PodUID, ReconcileKey,
};
use common::VkError;
use stdng::logs::TraceFn;
use stdng::{lock_ptr, new_ptr, trace_fn, MutexPtr};

use crate::ctx::NodeContextPtr;
use crate::informer::PodInformerPtr;
use crate::status;
use crate::workqueue::WorkQueue;

pub const PROVIDER_FAILED: &str = "ProviderFailed";

pub type PodControllerPtr = Arc<PodController>;

/// The identity and spec handed to the provider last.
#[derive(Clone, Debug, PartialEq, Eq)]
struct AppliedPod {
    uid: PodUID,
    spec: PodSpec,
}

impl From<&PodRecord> for AppliedPod {
    fn from(pod: &PodRecord) -> Self {
        AppliedPod {
            uid: pod.uid.clone(),
            spec: pod.spec.clone(),
        }
    }
}

/// What a reconcile did to the provider.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ReconcileAction {
    None,
    Created,
    Updated,
    Recreated,
    Deleted,
    Parked,
}

/// Drives the provider towards the cached pods, one key at a time.
pub struct PodController {
    ctx: NodeContextPtr,
    informer: PodInformerPtr,
    queue: WorkQueue<ReconcileKey>,
    applied: MutexPtr<HashMap<ReconcileKey, AppliedPod>>,
    parked: MutexPtr<HashMap<ReconcileKey, AppliedPod>>,
}

impl PodController {
    pub fn new(
        ctx: NodeContextPtr,
        informer: PodInformerPtr,
        queue: WorkQueue<ReconcileKey>,
    ) -> PodControllerPtr {
        Arc::new(PodController {
            ctx,
            informer,
            queue,
            applied: new_ptr(HashMap::new()),
            parked: new_ptr(HashMap::new()),
        })
    }

    /// Processes keys until the queue is shut down and drained.
    pub async fn run_worker(self: Arc<Self>, id: usize) {
        tracing::debug!("Pod worker <{id}> started.");

        while let Some(key) = self.queue.get().await {
            let res = self.reconcile(&key).await;
            self.handle_result(&key, res).await;

            if let Err(e) = self.queue.done(&key) {
                tracing::error!("Failed to mark pod <{key}> as done: {e}");
            }
        }

        tracing::debug!("Pod worker <{id}> exited.");
    }

    /// True when the pod failed permanently and neither its spec nor its identity changed since.
    pub fn is_parked(&self, pod: &PodRecord) -> bool {
        lock_ptr!(self.parked)
            .map(|parked| parked.get(&pod.key()) == Some(&AppliedPod::from(pod)))
            .unwrap_or(false)
    }

    pub async fn reconcile(&self, key: &ReconcileKey) -> Result<ReconcileAction, VkError> {
        trace_fn!("PodController::reconcile");

        // Always act on the latest cached record.
        let Some(pod) = self.informer.get(key) else {
            tracing::debug!("Pod <{key}> is gone, delete it from provider.");
            self.delete_from_provider(key).await?;
            self.clear(key)?;
            return Ok(ReconcileAction::Deleted);
        };

        if pod.is_deleting() {
            tracing::debug!("Pod <{key}> is deleting, delete it from provider.");
            self.delete_from_provider(key).await?;
            self.clear(key)?;

            match self.ctx.client.remove_pod(key, &pod.uid).await {
                Ok(()) => {}
                Err(e) if e.is_not_found() => {}
                Err(e) => return Err(e),
            }
            tracing::info!("Pod <{key}> was deleted.");
            return Ok(ReconcileAction::Deleted);
        }

        if self.is_parked(&pod) {
            tracing::debug!("Pod <{key}> failed permanently, wait for a new spec.");
            return Ok(ReconcileAction::Parked);
        }
        lock_ptr!(self.parked)?.remove(key);

        pod.validate()?;

        let applied = lock_ptr!(self.applied)?.get(key).cloned();
        let action = match self.ctx.provider.get_pod_status(key).await {
            Err(e) if e.is_not_found() => {
                self.ctx.provider.create_pod(&pod).await?;
                ReconcileAction::Created
            }
            Err(e) => return Err(e),
            Ok(state) if !state.uid.is_empty() && state.uid != pod.uid => {
                tracing::debug!(
                    "Pod <{key}> is running as <{}> in provider, recreate it as <{}>.",
                    state.uid,
                    pod.uid
                );
                self.recreate(&pod).await?;
                ReconcileAction::Recreated
            }
            Ok(_) => match applied {
                Some(applied) if applied == AppliedPod::from(&pod) => ReconcileAction::None,
                Some(_) => match self.ctx.provider.update_pod(&pod).await {
                    Ok(()) => ReconcileAction::Updated,
                    Err(e) if e.is_not_supported() => {
                        tracing::debug!("Provider can not update pod <{key}>, recreate it.");
                        self.recreate(&pod).await?;
                        ReconcileAction::Recreated
                    }
                    Err(e) => return Err(e),
                },
                // Unknown after a restart; create is idempotent.
                None => {
                    self.ctx.provider.create_pod(&pod).await?;
                    ReconcileAction::Created
                }
            },
        };

        lock_ptr!(self.applied)?.insert(key.clone(), AppliedPod::from(&pod));
        if action != ReconcileAction::None {
            tracing::info!("Pod <{key}> was reconciled: {action:?}.");
        }

        Ok(action)
    }

    async fn handle_result(&self, key: &ReconcileKey, res: Result<ReconcileAction, VkError>) {
        let err = match res {
            Ok(_) => {
                if let Err(e) = self.queue.forget(key) {
                    tracing::error!("Failed to reset backoff of pod <{key}>: {e}");
                }
                return;
            }
            Err(e) => e,
        };

        if err.is_transient() || err.is_not_found() {
            self.requeue(key, &err);
            return;
        }

        tracing::warn!("Failed to reconcile pod <{key}> permanently: {err}");
        if let Err(e) = self.queue.forget(key) {
            tracing::error!("Failed to reset backoff of pod <{key}>: {e}");
        }

        let Some(pod) = self.informer.get(key) else {
            return;
        };
        if let Err(e) = self.park(&pod, &err).await {
            tracing::warn!("Failed to publish the failure of pod <{key}>: {e}");
            if let Ok(mut parked) = lock_ptr!(self.parked) {
                parked.remove(key);
            }
            self.requeue(key, &e);
        }
    }

    fn requeue(&self, key: &ReconcileKey, err: &VkError) {
        match self.queue.add_rate_limited(key.clone()) {
            Ok(delay) => {
                tracing::warn!("Failed to reconcile pod <{key}>, retry in {delay:?}: {err}")
            }
            Err(e) => tracing::error!("Failed to requeue pod <{key}>: {e}"),
        }
    }

    /// Publishes the failure on the pod and stops retrying until its spec changes.
    async fn park(&self, pod: &PodRecord, err: &VkError) -> Result<(), VkError> {
        lock_ptr!(self.parked)?.insert(pod.key(), AppliedPod::from(pod));

        let message = err.to_string();
        status::patch_pod_status(&self.ctx, pod.clone(), |status| {
            status.phase = PodPhase::Failed;
            status.reason = Some(PROVIDER_FAILED.to_string());
            status.message = Some(message.clone());
        })
        .await?;

        self.ctx
            .client
            .record_event(Event::new(pod, EventType::Warning, PROVIDER_FAILED, message))
            .await
    }

    async fn recreate(&self, pod: &PodRecord) -> Result<(), VkError> {
        self.delete_from_provider(&pod.key()).await?;
        self.ctx.provider.create_pod(pod).await
    }

    async fn delete_from_provider(&self, key: &ReconcileKey) -> Result<(), VkError> {
        match self.ctx.provider.delete_pod(key).await {
            Ok(()) => Ok(()),
            Err(e) if e.is_not_found() => Ok(()),
            Err(e) => Err(e),
        }
    }

    fn clear(&self, key: &ReconcileKey) -> Result<(), VkError> {
        lock_ptr!(self.applied)?.remove(key);
        lock_ptr!(self.parked)?.remove(key);
        Ok(())
    }
}

#[cfg(test)]
mod tests;

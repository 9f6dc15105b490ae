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

use std::future::Future;
use std::sync::Arc;

use chrono::{Duration, Utc};
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

use common::apis::{Lease, NodeDescriptor};
use common::VkError;
use stdng::logs::TraceFn;
use stdng::{lock_ptr, new_ptr, trace_fn, MutexPtr};

use crate::ctx::NodeContextPtr;

pub type NodeControllerPtr = Arc<NodeController>;

/// Publishes the node object and keeps its lease alive.
pub struct NodeController {
    ctx: NodeContextPtr,
    published: MutexPtr<Option<NodeDescriptor>>,
    lease: MutexPtr<Option<Lease>>,
}

impl NodeController {
    pub fn new(ctx: NodeContextPtr) -> NodeControllerPtr {
        Arc::new(NodeController {
            ctx,
            published: new_ptr(None),
            lease: new_ptr(None),
        })
    }

    /// Recomputes the node from the provider queries.
    pub fn build_node(&self) -> NodeDescriptor {
        let provider = &self.ctx.provider;
        let capacity = provider.capacity();

        NodeDescriptor {
            name: self.ctx.node_name.clone(),
            allocatable: capacity.clone(),
            capacity,
            operating_system: provider.operating_system(),
            addresses: provider.node_addresses(),
            conditions: provider.node_conditions(),
            daemon_port: provider.node_daemon_port(),
        }
    }

    pub fn published(&self) -> Option<NodeDescriptor> {
        lock_ptr!(self.published).ok().and_then(|n| n.clone())
    }

    pub fn lease(&self) -> Option<Lease> {
        lock_ptr!(self.lease).ok().and_then(|l| l.clone())
    }

    pub async fn register(&self) -> Result<NodeDescriptor, VkError> {
        trace_fn!("NodeController::register");

        let node = self.build_node();
        let node = self.bounded(self.ctx.client.register_node(&node)).await?;
        *lock_ptr!(self.published)? = Some(node.clone());

        tracing::info!("Node <{}> was registered.", node.name);
        Ok(node)
    }

    /// Patches the node status when it differs from the last published one; returns true
    /// when the control plane was written.
    pub async fn sync_status(&self) -> Result<bool, VkError> {
        trace_fn!("NodeController::sync_status");

        let mut node = self.build_node();
        if let Some(previous) = self.published() {
            node.carry_transitions(&previous);
            if node.same_status(&previous) {
                return Ok(false);
            }
        }

        let node = match self.bounded(self.ctx.client.update_node_status(&node)).await {
            Ok(node) => node,
            Err(e) if e.is_not_found() => {
                tracing::warn!("Node <{}> was removed, register it again.", node.name);
                self.bounded(self.ctx.client.register_node(&node)).await?
            }
            Err(e) => return Err(e),
        };
        *lock_ptr!(self.published)? = Some(node);

        Ok(true)
    }

    /// Renews the lease; the renew time always moves forward, and a failed renewal keeps the
    /// previous lease.
    pub async fn renew_lease(&self) -> Result<Lease, VkError> {
        let now = Utc::now();
        let renew_time = match self.lease() {
            Some(previous) => now.max(previous.renew_time + Duration::milliseconds(1)),
            None => now,
        };

        let lease = Lease {
            holder_identity: self.ctx.node_name.clone(),
            renew_time,
            duration_secs: self.ctx.node_status.lease_duration_secs,
        };
        let lease = self.bounded(self.ctx.client.renew_lease(&lease)).await?;
        *lock_ptr!(self.lease)? = Some(lease.clone());

        Ok(lease)
    }

    async fn bounded<T>(
        &self,
        request: impl Future<Output = Result<T, VkError>>,
    ) -> Result<T, VkError> {
        match tokio::time::timeout(self.ctx.request_timeout, request).await {
            Ok(res) => res,
            Err(_) => Err(VkError::Network(format!(
                "control plane did not answer in {:?}",
                self.ctx.request_timeout
            ))),
        }
    }

    /// Runs the status timer and the lease timer as independent tasks.
    pub async fn run(self: Arc<Self>, cancel: CancellationToken) {
        let lease = tokio::spawn(self.clone().run_lease(cancel.clone()));
        self.clone().run_status(cancel).await;

        if let Err(e) = lease.await {
            tracing::error!("Lease timer of node <{}> failed: {e}", self.ctx.node_name);
        }

        tracing::debug!("Node controller of <{}> exited.", self.ctx.node_name);
    }

    async fn run_status(self: Arc<Self>, cancel: CancellationToken) {
        let mut status_timer = tokio::time::interval(self.ctx.node_status.status_interval);
        status_timer.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = status_timer.tick() => {
                    match self.sync_status().await {
                        Ok(true) => tracing::debug!("Status of node <{}> was updated.", self.ctx.node_name),
                        Ok(false) => {}
                        Err(e) => tracing::warn!("Failed to update status of node <{}>: {e}", self.ctx.node_name),
                    }
                }
            }
        }
    }

    async fn run_lease(self: Arc<Self>, cancel: CancellationToken) {
        let mut lease_timer = tokio::time::interval(self.ctx.node_status.lease_interval);
        lease_timer.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = lease_timer.tick() => {
                    if let Err(e) = self.renew_lease().await {
                        tracing::warn!("Failed to renew lease of node <{}>: {e}", self.ctx.node_name);
                    }
                }
            }
        }
    }
}

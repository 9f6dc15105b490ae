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

use futures::future::join_all;
use tokio_util::sync::CancellationToken;

use common::apis::ReconcileKey;
use common::ctx::VkContext;
use common::VkError;

use crate::client::ControlPlanePtr;
use crate::controller::{PodController, PodControllerPtr};
use crate::ctx::{NodeContext, NodeContextPtr};
use crate::informer::{PodInformer, PodInformerPtr};
use crate::node::{NodeController, NodeControllerPtr};
use crate::provider::Store;
use crate::stats::StatsService;
use crate::status::{StatusSync, StatusSyncPtr};
use crate::workqueue::WorkQueue;

/// Wires the components of one virtual node together and runs them until cancelled.
pub struct NodeManager {
    ctx: NodeContextPtr,
    queue: WorkQueue<ReconcileKey>,
    informer: PodInformerPtr,
    controller: PodControllerPtr,
    node: NodeControllerPtr,
    status: StatusSyncPtr,
}

impl NodeManager {
    pub fn new(
        config: &VkContext,
        client: ControlPlanePtr,
        store: &Store,
    ) -> Result<Self, VkError> {
        let ctx = NodeContext::new(config, client, store)?;
        Ok(Self::with_context(ctx))
    }

    pub fn with_context(ctx: NodeContextPtr) -> Self {
        let queue = WorkQueue::new(ctx.controller.backoff_base, ctx.controller.backoff_max);
        let informer = PodInformer::new(ctx.clone(), queue.clone());
        let controller = PodController::new(ctx.clone(), informer.clone(), queue.clone());
        let node = NodeController::new(ctx.clone());
        let status = StatusSync::new(ctx.clone(), informer.clone(), controller.clone());

        NodeManager {
            ctx,
            queue,
            informer,
            controller,
            node,
            status,
        }
    }

    pub fn context(&self) -> NodeContextPtr {
        self.ctx.clone()
    }

    pub fn informer(&self) -> PodInformerPtr {
        self.informer.clone()
    }

    pub fn node_controller(&self) -> NodeControllerPtr {
        self.node.clone()
    }

    pub fn stats(&self) -> StatsService {
        StatsService::new(self.ctx.clone())
    }

    /// Registers the node, then runs every loop until `cancel` fires. Only a failed
    /// registration is fatal.
    pub async fn run(&self, cancel: CancellationToken) -> Result<(), VkError> {
        let node_name = self.ctx.node_name.clone();
        tracing::info!("Node <{node_name}> is starting ...");

        self.node.register().await?;
        if let Err(e) = self.node.renew_lease().await {
            tracing::warn!("Failed to acquire lease of node <{node_name}>: {e}");
        }

        let informer = tokio::spawn(self.informer.clone().run(cancel.clone()));
        let node = tokio::spawn(self.node.clone().run(cancel.clone()));
        let status = tokio::spawn(self.status.clone().run(cancel.clone()));
        let workers: Vec<_> = (0..self.ctx.controller.workers)
            .map(|id| tokio::spawn(self.controller.clone().run_worker(id)))
            .collect();
        let aborts: Vec<_> = workers.iter().map(|w| w.abort_handle()).collect();

        tracing::info!(
            "Node <{node_name}> is running with {} pod workers.",
            workers.len()
        );

        cancel.cancelled().await;
        tracing::info!("Node <{node_name}> is shutting down ...");

        // Stop the watch first, so nothing is added while the queue drains.
        match informer.await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => tracing::warn!("Informer of node <{node_name}> exited with error: {e}"),
            Err(e) => tracing::error!("Informer of node <{node_name}> panicked: {e}"),
        }
        self.queue.shut_down()?;

        let timeout = self.ctx.controller.shutdown_timeout;
        if tokio::time::timeout(timeout, join_all(workers)).await.is_err() {
            tracing::warn!("Pod workers of node <{node_name}> did not finish in {timeout:?}, abort them.");
            aborts.iter().for_each(|a| a.abort());
        }

        for (name, handle) in [("node controller", node), ("status sync", status)] {
            if let Err(e) = handle.await {
                tracing::error!("The {name} of node <{node_name}> panicked: {e}");
            }
        }

        tracing::info!("Node <{node_name}> was stopped.");
        Ok(())
    }
}

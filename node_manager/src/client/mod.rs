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

pub mod memory;

use std::sync::Arc;

use async_trait::async_trait;
use futures::stream::BoxStream;

use common::apis::{
    Event, Lease, NodeDescriptor, PodList, PodRecord, PodUID, ReconcileKey, ResourceVersion,
};
use common::ctx::VkContext;
use common::VkError;

use self::memory::MemoryControlPlane;

pub type ControlPlanePtr = Arc<dyn ControlPlane>;

pub type WatchStream = BoxStream<'static, Result<WatchEvent, VkError>>;

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum WatchEvent {
    Added(PodRecord),
    Modified(PodRecord),
    Deleted(PodRecord),
}

impl WatchEvent {
    pub fn pod(&self) -> &PodRecord {
        match self {
            WatchEvent::Added(pod) | WatchEvent::Modified(pod) | WatchEvent::Deleted(pod) => pod,
        }
    }
}

/// The part of the cluster API the node agent consumes.
#[async_trait]
pub trait ControlPlane: Send + Sync + 'static {
    /// Lists the pods assigned to `node`.
    async fn list_pods(&self, node: &str) -> Result<PodList, VkError>;

    /// Streams the changes after `resource_version`; `Expired` when it is too old to replay.
    async fn watch_pods(
        &self,
        node: &str,
        resource_version: ResourceVersion,
    ) -> Result<WatchStream, VkError>;

    async fn get_pod(&self, key: &ReconcileKey) -> Result<PodRecord, VkError>;

    /// Writes the status sub-resource; `Conflict` when `resource_version` is stale.
    async fn update_pod_status(&self, pod: &PodRecord) -> Result<PodRecord, VkError>;

    /// Acknowledges the deletion so the object is finally removed.
    async fn remove_pod(&self, key: &ReconcileKey, uid: &PodUID) -> Result<(), VkError>;

    async fn register_node(&self, node: &NodeDescriptor) -> Result<NodeDescriptor, VkError>;

    /// `NotFound` when the node object was removed.
    async fn update_node_status(&self, node: &NodeDescriptor) -> Result<NodeDescriptor, VkError>;

    async fn renew_lease(&self, lease: &Lease) -> Result<Lease, VkError>;

    async fn record_event(&self, event: Event) -> Result<(), VkError>;
}

pub const MEMORY_ENDPOINT: &str = "memory://";

pub fn new_ptr(ctx: &VkContext) -> Result<ControlPlanePtr, VkError> {
    match ctx.control_plane.endpoint.as_str() {
        MEMORY_ENDPOINT => Ok(Arc::new(MemoryControlPlane::new())),
        endpoint => Err(VkError::InvalidConfig(format!(
            "unsupported control plane endpoint <{endpoint}>"
        ))),
    }
}

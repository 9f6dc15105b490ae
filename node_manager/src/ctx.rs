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

use std::sync::Arc;
use std::time::Duration;

use common::ctx::{VkContext, VkController, VkNodeStatus};
use common::VkError;

use crate::client::ControlPlanePtr;
use crate::provider::{InitConfig, ProviderPtr, Store};

pub type NodeContextPtr = Arc<NodeContext>;

/// The node identity, the provider instance and the control plane client; built once at
/// startup and shared by every component.
pub struct NodeContext {
    pub node_name: String,
    pub operating_system: String,
    pub internal_ip: String,
    pub daemon_port: u16,

    /// Upper bound of a single control plane request.
    pub request_timeout: Duration,
    pub controller: VkController,
    pub node_status: VkNodeStatus,

    pub provider: ProviderPtr,
    pub client: ControlPlanePtr,
}

impl NodeContext {
    pub fn new(
        ctx: &VkContext,
        client: ControlPlanePtr,
        store: &Store,
    ) -> Result<NodeContextPtr, VkError> {
        ctx.validate()?;
        let provider = store.new_provider(&ctx.provider.name, InitConfig::from(ctx))?;

        Ok(Self::with_provider(ctx, client, provider))
    }

    pub fn with_provider(
        ctx: &VkContext,
        client: ControlPlanePtr,
        provider: ProviderPtr,
    ) -> NodeContextPtr {
        Arc::new(NodeContext {
            node_name: ctx.node.name.clone(),
            operating_system: ctx.node.operating_system.clone(),
            internal_ip: ctx.node.internal_ip.clone(),
            daemon_port: ctx.node.daemon_port,
            request_timeout: ctx.control_plane.request_timeout,
            controller: ctx.controller.clone(),
            node_status: ctx.node_status.clone(),
            provider,
            client,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::memory::MemoryControlPlane;

    #[test]
    fn test_new_node_context() -> Result<(), VkError> {
        let mut ctx = VkContext::default();
        ctx.node.name = "vk-test".to_string();
        let client: ControlPlanePtr = Arc::new(MemoryControlPlane::new());

        let node_ctx = NodeContext::new(&ctx, client.clone(), &Store::with_defaults()?)?;
        assert_eq!(node_ctx.node_name, "vk-test");
        assert_eq!(node_ctx.provider.operating_system(), ctx.node.operating_system);

        ctx.provider.name = "unknown".to_string();
        let res = NodeContext::new(&ctx, client, &Store::with_defaults()?);
        assert!(matches!(res, Err(VkError::InvalidConfig(_))));

        Ok(())
    }
}

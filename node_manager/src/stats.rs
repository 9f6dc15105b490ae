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

use common::apis::{ReconcileKey, Summary};
use common::VkError;

use crate::ctx::NodeContextPtr;

/// The calls the stats/logs endpoints make into the node.
#[derive(Clone)]
pub struct StatsService {
    ctx: NodeContextPtr,
}

impl StatsService {
    pub fn new(ctx: NodeContextPtr) -> Self {
        StatsService { ctx }
    }

    /// A pod stays listed until its deletion in the provider completed.
    pub async fn summary(&self) -> Result<Summary, VkError> {
        let mut summary = self.ctx.provider.stats_summary().await?;
        if summary.node.node_name.is_empty() {
            summary.node.node_name = self.ctx.node_name.clone();
        }

        Ok(summary)
    }

    pub async fn container_logs(
        &self,
        namespace: &str,
        pod: &str,
        container: &str,
        tail: Option<usize>,
    ) -> Result<String, VkError> {
        let key = ReconcileKey::new(namespace, pod);
        self.ctx
            .provider
            .container_logs(&key, container, tail)
            .await
    }
}

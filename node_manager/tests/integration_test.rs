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

use async_trait::async_trait;
use tokio::sync::Semaphore;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use common::apis::{
    Container, NodeAddress, NodeCondition, PodRecord, PodSpec, ProviderPodState, ReconcileKey,
    ResourceList, Summary,
};
use common::ctx::VkContext;
use common::VkError;
use stdng::{lock_ptr, new_ptr, MutexPtr};

use vk_node::client::memory::MemoryControlPlane;
use vk_node::client::ControlPlanePtr;
use vk_node::ctx::NodeContext;
use vk_node::manager::NodeManager;
use vk_node::provider::mock::MockProvider;
use vk_node::provider::{PodNotifier, Provider, ProviderPtr};

const NODE_NAME: &str = "vk-e2e";

const WAIT_TIMEOUT: Duration = Duration::from_secs(10);

struct TestNode {
    cp: Arc<MemoryControlPlane>,
    manager: Arc<NodeManager>,
    cancel: CancellationToken,
    handle: JoinHandle<Result<(), VkError>>,
}

impl TestNode {
    fn start(provider: ProviderPtr) -> Self {
        let mut ctx = VkContext::default();
        ctx.node.name = NODE_NAME.to_string();
        ctx.controller.workers = 4;
        ctx.controller.resync_interval = Duration::from_secs(1);
        ctx.controller.status_sync_interval = Duration::from_millis(50);
        ctx.controller.backoff_base = Duration::from_millis(10);
        ctx.controller.backoff_max = Duration::from_millis(100);
        ctx.controller.shutdown_timeout = Duration::from_secs(2);
        ctx.node_status.status_interval = Duration::from_millis(200);
        ctx.node_status.lease_interval = Duration::from_millis(50);

        let cp = Arc::new(MemoryControlPlane::new());
        let node_ctx = NodeContext::with_provider(&ctx, cp.clone() as ControlPlanePtr, provider);
        let manager = Arc::new(NodeManager::with_context(node_ctx));

        let cancel = CancellationToken::new();
        let handle = {
            let manager = manager.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move { manager.run(cancel).await })
        };

        TestNode {
            cp,
            manager,
            cancel,
            handle,
        }
    }

    fn start_mock() -> Self {
        let provider = MockProvider::new(None, NODE_NAME, "Linux", "10.0.0.1", 10250).unwrap();
        Self::start(Arc::new(provider))
    }

    async fn stop(self) -> Result<(), VkError> {
        self.cancel.cancel();
        tokio::time::timeout(WAIT_TIMEOUT, self.handle)
            .await
            .expect("node did not stop")
            .expect("node panicked")
    }

    fn create_pod(&self, prefix: &str, images: &[&str]) -> Result<PodRecord, VkError> {
        let suffix = uuid::Uuid::new_v4().simple().to_string();
        self.cp.create_pod(PodRecord {
            namespace: "default".to_string(),
            name: format!("{prefix}{}", &suffix[..5]),
            spec: new_spec(images),
            ..PodRecord::default()
        })
    }

    async fn wait_ready(&self, key: &ReconcileKey) {
        wait_for(|| self.cp.pod(key).is_some_and(|p| p.status.is_ready())).await;
    }

    async fn summary(&self) -> Result<Summary, VkError> {
        self.manager.stats().summary().await
    }
}

fn new_spec(images: &[&str]) -> PodSpec {
    PodSpec {
        node_name: NODE_NAME.to_string(),
        containers: images
            .iter()
            .enumerate()
            .map(|(i, image)| Container::new(format!("container-{i}"), *image))
            .collect(),
        volumes: vec![],
    }
}

async fn wait_for<F>(mut condition: F)
where
    F: FnMut() -> bool,
{
    tokio::time::timeout(WAIT_TIMEOUT, async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    })
    .await
    .expect("condition was not met in time");
}

fn count_pod(summary: &Summary, pod: &PodRecord) -> usize {
    summary
        .pods
        .iter()
        .filter(|p| {
            p.pod_ref.namespace == pod.namespace
                && p.pod_ref.name == pod.name
                && p.pod_ref.uid == pod.uid
        })
        .count()
}

#[tokio::test]
async fn test_stats_summary_of_pod_with_three_containers() -> Result<(), VkError> {
    let node = TestNode::start_mock();
    let pod = node.create_pod("nginx-0-", &["nginx", "nginx", "nginx"])?;
    node.wait_ready(&pod.key()).await;

    let summary = node.summary().await?;
    assert_eq!(summary.node.node_name, NODE_NAME);
    assert_eq!(count_pod(&summary, &pod), 1);

    let stats = summary
        .find_pod(&pod.namespace, &pod.name, &pod.uid)
        .unwrap();
    assert_eq!(stats.containers.len(), 3);

    node.stop().await
}

#[tokio::test]
async fn test_deleted_pod_leaves_stats_summary() -> Result<(), VkError> {
    let node = TestNode::start_mock();
    let nginx0 = node.create_pod("nginx-0-", &["nginx"])?;
    let nginx1 = node.create_pod("nginx-1-", &["nginx"])?;
    node.wait_ready(&nginx0.key()).await;
    node.wait_ready(&nginx1.key()).await;

    let summary = node.summary().await?;
    assert_eq!(count_pod(&summary, &nginx0), 1);
    assert_eq!(count_pod(&summary, &nginx1), 1);

    node.cp.delete_pod(&nginx1.key())?;
    wait_for(|| node.cp.pod(&nginx1.key()).is_none()).await;

    let summary = node.summary().await?;
    assert_eq!(count_pod(&summary, &nginx0), 1);
    assert_eq!(count_pod(&summary, &nginx1), 0);

    node.stop().await
}

#[derive(Clone, Debug, PartialEq, Eq)]
enum Call {
    Create(String),
    Update(String),
}

/// Records every create/update and holds them until the gate opens.
struct RecordingProvider {
    inner: MockProvider,
    gate: Semaphore,
    calls: MutexPtr<Vec<Call>>,
}

impl RecordingProvider {
    fn new() -> Self {
        RecordingProvider {
            inner: MockProvider::new(None, NODE_NAME, "Linux", "10.0.0.1", 10250).unwrap(),
            gate: Semaphore::new(0),
            calls: new_ptr(vec![]),
        }
    }

    fn calls(&self) -> Vec<Call> {
        lock_ptr!(self.calls).unwrap().clone()
    }

    fn open(&self) {
        self.gate.add_permits(Semaphore::MAX_PERMITS / 2);
    }

    async fn pass(&self, call: Call) -> Result<(), VkError> {
        lock_ptr!(self.calls)?.push(call);
        let _permit = self
            .gate
            .acquire()
            .await
            .map_err(|e| VkError::Internal(e.to_string()))?;
        Ok(())
    }
}

fn image_of(pod: &PodRecord) -> String {
    pod.spec.containers[0].image.clone()
}

#[async_trait]
impl Provider for RecordingProvider {
    async fn create_pod(&self, pod: &PodRecord) -> Result<(), VkError> {
        self.pass(Call::Create(image_of(pod))).await?;
        self.inner.create_pod(pod).await
    }

    async fn update_pod(&self, pod: &PodRecord) -> Result<(), VkError> {
        self.pass(Call::Update(image_of(pod))).await?;
        self.inner.update_pod(pod).await
    }

    async fn delete_pod(&self, key: &ReconcileKey) -> Result<(), VkError> {
        self.inner.delete_pod(key).await
    }

    async fn get_pod_status(&self, key: &ReconcileKey) -> Result<ProviderPodState, VkError> {
        self.inner.get_pod_status(key).await
    }

    async fn list_pods(&self) -> Result<Vec<ReconcileKey>, VkError> {
        self.inner.list_pods().await
    }

    fn capacity(&self) -> ResourceList {
        self.inner.capacity()
    }

    fn node_conditions(&self) -> Vec<NodeCondition> {
        self.inner.node_conditions()
    }

    fn node_addresses(&self) -> Vec<NodeAddress> {
        self.inner.node_addresses()
    }

    fn operating_system(&self) -> String {
        self.inner.operating_system()
    }

    fn node_daemon_port(&self) -> u16 {
        self.inner.node_daemon_port()
    }

    async fn stats_summary(&self) -> Result<Summary, VkError> {
        self.inner.stats_summary().await
    }

    fn notify_pods(&self, notifier: PodNotifier) -> bool {
        self.inner.notify_pods(notifier)
    }
}

#[tokio::test]
async fn test_updates_during_reconcile_are_folded() -> Result<(), VkError> {
    let provider = Arc::new(RecordingProvider::new());
    let node = TestNode::start(provider.clone());

    let pod = node.create_pod("nginx-0-", &["nginx:1"])?;
    wait_for(|| !provider.calls().is_empty()).await;

    // The create is still in flight.
    node.cp.update_pod_spec(&pod.key(), new_spec(&["nginx:2"]))?;
    node.cp.update_pod_spec(&pod.key(), new_spec(&["nginx:3"]))?;
    wait_for(|| {
        node.manager
            .informer()
            .get(&pod.key())
            .is_some_and(|p| image_of(&p) == "nginx:3")
    })
    .await;

    provider.open();
    wait_for(|| provider.calls().len() >= 2).await;

    // Give a duplicated reconcile the chance to show up.
    tokio::time::sleep(Duration::from_millis(300)).await;
    assert_eq!(
        provider.calls(),
        vec![
            Call::Create("nginx:1".to_string()),
            Call::Update("nginx:3".to_string())
        ]
    );

    let state = provider.get_pod_status(&pod.key()).await?;
    assert_eq!(state.containers[0].image, "nginx:3");

    node.stop().await
}

#[tokio::test]
async fn test_node_registration_and_lease() -> Result<(), VkError> {
    let node = TestNode::start_mock();
    wait_for(|| node.cp.node(NODE_NAME).is_some()).await;

    let first = {
        wait_for(|| node.cp.lease(NODE_NAME).is_some()).await;
        node.cp.lease(NODE_NAME).unwrap()
    };
    wait_for(|| {
        node.cp
            .lease(NODE_NAME)
            .is_some_and(|l| l.renew_time > first.renew_time)
    })
    .await;

    // Renewal keeps failing while the control plane is down; the published lease stays.
    node.cp.set_available(false)?;
    tokio::time::sleep(Duration::from_millis(60)).await;
    let published = node.cp.lease(NODE_NAME).unwrap();
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(node.cp.lease(NODE_NAME), Some(published.clone()));

    node.cp.set_available(true)?;
    wait_for(|| {
        node.cp
            .lease(NODE_NAME)
            .is_some_and(|l| l.renew_time > published.renew_time)
    })
    .await;

    node.stop().await
}

#[tokio::test]
async fn test_unreachable_control_plane_is_fatal_at_startup() -> Result<(), VkError> {
    let mut ctx = VkContext::default();
    ctx.node.name = NODE_NAME.to_string();

    let cp = Arc::new(MemoryControlPlane::new());
    cp.set_available(false)?;
    let provider = Arc::new(MockProvider::new(None, NODE_NAME, "Linux", "10.0.0.1", 10250)?);
    let manager = NodeManager::with_context(NodeContext::with_provider(
        &ctx,
        cp as ControlPlanePtr,
        provider,
    ));

    let res = manager.run(CancellationToken::new()).await;
    assert!(matches!(res, Err(VkError::Network(_))));

    Ok(())
}

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

use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Semaphore;

use common::apis::{
    Container, NodeAddress, NodeCondition, PodSpec, ProviderPodState, ResourceList,
};
use common::ctx::VkContext;

use super::*;
use crate::client::memory::MemoryControlPlane;
use crate::client::{ControlPlane, ControlPlanePtr};
use crate::ctx::NodeContext;
use crate::informer::PodInformer;
use crate::provider::mock::MockProvider;
use crate::provider::{Provider, ProviderPtr};
use crate::status::StatusSync;

/// A backend that can not update pods in place.
struct NoUpdateProvider {
    inner: MockProvider,
}

#[async_trait]
impl Provider for NoUpdateProvider {
    async fn create_pod(&self, pod: &PodRecord) -> Result<(), VkError> {
        self.inner.create_pod(pod).await
    }

    async fn update_pod(&self, _: &PodRecord) -> Result<(), VkError> {
        Err(VkError::NotSupported("update pod".to_string()))
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
}

/// Holds `get_pod_status` until the gate opens.
struct GatedStatusProvider {
    inner: MockProvider,
    entered: AtomicBool,
    gate: Semaphore,
}

impl GatedStatusProvider {
    fn new() -> Self {
        GatedStatusProvider {
            inner: MockProvider::new(None, "vk", "Linux", "10.0.0.1", 10250).unwrap(),
            entered: AtomicBool::new(false),
            gate: Semaphore::new(0),
        }
    }
}

#[async_trait]
impl Provider for GatedStatusProvider {
    async fn create_pod(&self, pod: &PodRecord) -> Result<(), VkError> {
        self.inner.create_pod(pod).await
    }

    async fn update_pod(&self, pod: &PodRecord) -> Result<(), VkError> {
        self.inner.update_pod(pod).await
    }

    async fn delete_pod(&self, key: &ReconcileKey) -> Result<(), VkError> {
        self.inner.delete_pod(key).await
    }

    async fn get_pod_status(&self, key: &ReconcileKey) -> Result<ProviderPodState, VkError> {
        self.entered.store(true, Ordering::SeqCst);
        let _permit = self
            .gate
            .acquire()
            .await
            .map_err(|e| VkError::Internal(e.to_string()))?;
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
}

struct TestEnv {
    cp: Arc<MemoryControlPlane>,
    provider: ProviderPtr,
    queue: WorkQueue<ReconcileKey>,
    informer: PodInformerPtr,
    controller: PodControllerPtr,
}

fn new_test_env_with(provider: ProviderPtr) -> TestEnv {
    let mut ctx = VkContext::default();
    ctx.node.name = "vk".to_string();

    let cp = Arc::new(MemoryControlPlane::new());
    let node_ctx = NodeContext::with_provider(&ctx, cp.clone() as ControlPlanePtr, provider.clone());
    let queue = WorkQueue::new(Duration::from_millis(10), Duration::from_millis(20));
    let informer = PodInformer::new(node_ctx.clone(), queue.clone());
    let controller = PodController::new(node_ctx, informer.clone(), queue.clone());

    TestEnv {
        cp,
        provider,
        queue,
        informer,
        controller,
    }
}

fn new_test_env() -> TestEnv {
    let provider = MockProvider::new(None, "vk", "Linux", "10.0.0.1", 10250).unwrap();
    new_test_env_with(Arc::new(provider))
}

fn new_test_pod(name: &str, images: &[&str]) -> PodRecord {
    PodRecord {
        namespace: "default".to_string(),
        name: name.to_string(),
        spec: new_test_spec(images),
        ..PodRecord::default()
    }
}

fn new_test_spec(images: &[&str]) -> PodSpec {
    PodSpec {
        node_name: "vk".to_string(),
        containers: images
            .iter()
            .enumerate()
            .map(|(i, image)| Container::new(format!("c{i}"), *image))
            .collect(),
        volumes: vec![],
    }
}

#[tokio::test]
async fn test_reconcile_create_and_no_op() -> Result<(), VkError> {
    let env = new_test_env();
    let pod = env.cp.create_pod(new_test_pod("nginx-0", &["nginx"]))?;
    env.informer.relist().await?;

    let action = env.controller.reconcile(&pod.key()).await?;
    assert_eq!(action, ReconcileAction::Created);
    assert_eq!(env.provider.get_pod_status(&pod.key()).await?.uid, pod.uid);

    let action = env.controller.reconcile(&pod.key()).await?;
    assert_eq!(action, ReconcileAction::None);

    Ok(())
}

#[tokio::test]
async fn test_reconcile_update() -> Result<(), VkError> {
    let env = new_test_env();
    let pod = env.cp.create_pod(new_test_pod("nginx-0", &["nginx:1.0"]))?;
    env.informer.relist().await?;
    env.controller.reconcile(&pod.key()).await?;

    env.cp
        .update_pod_spec(&pod.key(), new_test_spec(&["nginx:1.1"]))?;
    env.informer.relist().await?;

    let action = env.controller.reconcile(&pod.key()).await?;
    assert_eq!(action, ReconcileAction::Updated);

    let state = env.provider.get_pod_status(&pod.key()).await?;
    assert_eq!(state.containers[0].image, "nginx:1.1");

    Ok(())
}

#[tokio::test]
async fn test_reconcile_update_not_supported() -> Result<(), VkError> {
    let inner = MockProvider::new(None, "vk", "Linux", "10.0.0.1", 10250)?;
    let env = new_test_env_with(Arc::new(NoUpdateProvider { inner }));

    let pod = env.cp.create_pod(new_test_pod("nginx-0", &["nginx:1.0"]))?;
    env.informer.relist().await?;
    env.controller.reconcile(&pod.key()).await?;

    env.cp
        .update_pod_spec(&pod.key(), new_test_spec(&["nginx:1.1"]))?;
    env.informer.relist().await?;

    let action = env.controller.reconcile(&pod.key()).await?;
    assert_eq!(action, ReconcileAction::Recreated);

    let state = env.provider.get_pod_status(&pod.key()).await?;
    assert_eq!(state.containers[0].image, "nginx:1.1");

    Ok(())
}

#[tokio::test]
async fn test_reconcile_recreated_identity() -> Result<(), VkError> {
    let env = new_test_env();
    let old = env.cp.create_pod(new_test_pod("nginx-0", &["nginx"]))?;
    env.informer.relist().await?;
    env.controller.reconcile(&old.key()).await?;

    // Same name, another object.
    env.cp.remove_pod(&old.key(), &old.uid).await?;
    let new = env.cp.create_pod(new_test_pod("nginx-0", &["nginx"]))?;
    env.informer.relist().await?;

    let action = env.controller.reconcile(&new.key()).await?;
    assert_eq!(action, ReconcileAction::Recreated);
    assert_eq!(env.provider.get_pod_status(&new.key()).await?.uid, new.uid);

    Ok(())
}

#[tokio::test]
async fn test_reconcile_deleting_pod() -> Result<(), VkError> {
    let env = new_test_env();
    let pod = env.cp.create_pod(new_test_pod("nginx-0", &["nginx"]))?;
    env.informer.relist().await?;
    env.controller.reconcile(&pod.key()).await?;

    env.cp.delete_pod(&pod.key())?;
    env.informer.relist().await?;

    let action = env.controller.reconcile(&pod.key()).await?;
    assert_eq!(action, ReconcileAction::Deleted);
    assert!(env.cp.pod(&pod.key()).is_none());
    assert!(env.provider.list_pods().await?.is_empty());

    // Repeating is harmless.
    assert_eq!(
        env.controller.reconcile(&pod.key()).await?,
        ReconcileAction::Deleted
    );

    Ok(())
}

#[tokio::test]
async fn test_reconcile_orphan() -> Result<(), VkError> {
    let env = new_test_env();
    let orphan = new_test_pod("orphan", &["nginx"]);
    env.provider.create_pod(&orphan).await?;

    let action = env.controller.reconcile(&orphan.key()).await?;
    assert_eq!(action, ReconcileAction::Deleted);
    assert!(env.provider.list_pods().await?.is_empty());

    Ok(())
}

#[tokio::test]
async fn test_transient_error_is_retried() -> Result<(), VkError> {
    let env = new_test_env();
    let pod = env.cp.create_pod(new_test_pod("nginx-0", &["nginx"]))?;
    env.cp.delete_pod(&pod.key())?;
    env.informer.relist().await?;

    env.cp.set_available(false)?;
    let res = env.controller.reconcile(&pod.key()).await;
    assert!(matches!(res, Err(VkError::Network(_))));

    env.controller.handle_result(&pod.key(), res).await;
    assert_eq!(env.queue.num_requeues(&pod.key()), 1);

    env.cp.set_available(true)?;
    let res = env.controller.reconcile(&pod.key()).await;
    assert_eq!(res, Ok(ReconcileAction::Deleted));
    env.controller.handle_result(&pod.key(), res).await;
    assert_eq!(env.queue.num_requeues(&pod.key()), 0);
    assert!(env.cp.pod(&pod.key()).is_none());

    Ok(())
}

#[tokio::test]
async fn test_permanent_error_parks_pod() -> Result<(), VkError> {
    let env = new_test_env();
    let pod = env.cp.create_pod(new_test_pod("nginx-0", &[]))?;
    env.informer.relist().await?;

    let res = env.controller.reconcile(&pod.key()).await;
    assert!(matches!(res, Err(VkError::InvalidSpec(_))));
    env.controller.handle_result(&pod.key(), res).await;
    assert_eq!(env.queue.num_requeues(&pod.key()), 0);

    let failed = env.cp.pod(&pod.key()).unwrap();
    assert_eq!(failed.status.phase, PodPhase::Failed);
    assert_eq!(failed.status.reason.as_deref(), Some(PROVIDER_FAILED));

    let events = env.cp.events();
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].event_type, EventType::Warning);
    assert_eq!(events[0].reason, PROVIDER_FAILED);

    // The status write does not trigger another attempt.
    env.informer.relist().await?;
    assert_eq!(
        env.controller.reconcile(&pod.key()).await?,
        ReconcileAction::Parked
    );

    env.cp.update_pod_spec(&pod.key(), new_test_spec(&["nginx"]))?;
    env.informer.relist().await?;
    assert_eq!(
        env.controller.reconcile(&pod.key()).await?,
        ReconcileAction::Created
    );

    Ok(())
}

#[tokio::test]
async fn test_status_sync_keeps_published_failure() -> Result<(), VkError> {
    let provider = Arc::new(GatedStatusProvider::new());
    let env = new_test_env_with(provider.clone());
    let sync = StatusSync::new(
        env.controller.ctx.clone(),
        env.informer.clone(),
        env.controller.clone(),
    );

    let pod = env.cp.create_pod(new_test_pod("nginx-0", &["nginx"]))?;
    provider.create_pod(&pod).await?;

    let task = {
        let sync = sync.clone();
        let pod = pod.clone();
        tokio::spawn(async move { sync.sync_pod(&pod).await })
    };
    tokio::time::timeout(Duration::from_secs(2), async {
        while !provider.entered.load(Ordering::SeqCst) {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("status sync did not query the provider");

    // The failure is published while the status sync waits on the provider.
    env.controller
        .park(&pod, &VkError::InvalidSpec("bad image".to_string()))
        .await?;
    assert_eq!(env.cp.pod(&pod.key()).unwrap().status.phase, PodPhase::Failed);

    provider.gate.add_permits(1);
    let written = task.await.expect("status sync panicked")?;
    assert!(!written);

    let latest = env.cp.pod(&pod.key()).unwrap();
    assert_eq!(latest.status.phase, PodPhase::Failed);
    assert_eq!(latest.status.reason.as_deref(), Some(PROVIDER_FAILED));
    assert!(env.controller.is_parked(&pod));

    Ok(())
}

#[tokio::test]
async fn test_workers_drain_on_shut_down() -> Result<(), VkError> {
    let env = new_test_env();
    for i in 0..5 {
        env.cp
            .create_pod(new_test_pod(&format!("nginx-{i}"), &["nginx"]))?;
    }
    env.informer.relist().await?;
    env.queue.shut_down()?;

    let workers: Vec<_> = (0..2)
        .map(|id| tokio::spawn(env.controller.clone().run_worker(id)))
        .collect();
    for worker in workers {
        tokio::time::timeout(Duration::from_secs(2), worker)
            .await
            .expect("worker did not exit")
            .expect("worker panicked");
    }

    assert_eq!(env.provider.list_pods().await?.len(), 5);

    Ok(())
}

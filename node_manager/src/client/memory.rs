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

use std::collections::{HashMap, VecDeque};

use async_trait::async_trait;
use chrono::Utc;
use futures::StreamExt;
use tokio::sync::mpsc::{self, UnboundedSender};
use tokio_stream::wrappers::UnboundedReceiverStream;

use common::apis::{
    Event, Lease, NodeDescriptor, PodList, PodPhase, PodRecord, PodSpec, PodStatus, PodUID,
    ReconcileKey, ResourceVersion,
};
use common::VkError;
use stdng::{lock_ptr, new_ptr, MutexPtr};

use crate::client::{ControlPlane, WatchEvent, WatchStream};

const MAX_WATCH_HISTORY: usize = 1024;

struct Watcher {
    node: String,
    tx: UnboundedSender<Result<WatchEvent, VkError>>,
}

#[derive(Default)]
struct MemoryState {
    unavailable: bool,
    resource_version: ResourceVersion,
    pods: HashMap<ReconcileKey, PodRecord>,
    history: VecDeque<(ResourceVersion, WatchEvent)>,
    watchers: Vec<Watcher>,
    nodes: HashMap<String, NodeDescriptor>,
    leases: HashMap<String, Lease>,
    events: Vec<Event>,
    node_status_updates: usize,
    pod_status_updates: usize,
}

impl MemoryState {
    fn next_resource_version(&mut self) -> ResourceVersion {
        self.resource_version += 1;
        self.resource_version
    }

    fn emit(&mut self, event: WatchEvent) {
        let rv = event.pod().resource_version;
        let node = event.pod().spec.node_name.clone();

        self.history.push_back((rv, event.clone()));
        while self.history.len() > MAX_WATCH_HISTORY {
            self.history.pop_front();
        }

        // Watchers whose receiver was dropped are removed here.
        self.watchers
            .retain(|w| w.node != node || w.tx.send(Ok(event.clone())).is_ok());
    }

    fn check_available(&self) -> Result<(), VkError> {
        if self.unavailable {
            return Err(VkError::Network("control plane is unavailable".to_string()));
        }
        Ok(())
    }
}

/// An in-process control plane: the object store of record for pods, nodes, leases and events.
pub struct MemoryControlPlane {
    state: MutexPtr<MemoryState>,
}

impl Default for MemoryControlPlane {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryControlPlane {
    pub fn new() -> Self {
        MemoryControlPlane {
            state: new_ptr(MemoryState::default()),
        }
    }

    /// Creates a pod as a cluster user would; the UID is assigned when empty.
    pub fn create_pod(&self, mut pod: PodRecord) -> Result<PodRecord, VkError> {
        let mut state = lock_ptr!(self.state)?;
        let key = pod.key();
        if state.pods.contains_key(&key) {
            return Err(VkError::Conflict(format!("pod <{key}> already exists")));
        }

        if pod.uid.is_empty() {
            pod.uid = uuid::Uuid::new_v4().to_string();
        }
        pod.creation_timestamp = Some(Utc::now());
        pod.deletion_timestamp = None;
        pod.status = PodStatus {
            phase: PodPhase::Pending,
            ..PodStatus::default()
        };
        pod.resource_version = state.next_resource_version();

        state.pods.insert(key, pod.clone());
        state.emit(WatchEvent::Added(pod.clone()));

        Ok(pod)
    }

    pub fn update_pod_spec(&self, key: &ReconcileKey, spec: PodSpec) -> Result<PodRecord, VkError> {
        let mut state = lock_ptr!(self.state)?;
        if !state.pods.contains_key(key) {
            return Err(VkError::NotFound(key.to_string()));
        }

        let rv = state.next_resource_version();
        let pod = state
            .pods
            .get_mut(key)
            .ok_or(VkError::NotFound(key.to_string()))?;

        pod.spec = spec;
        pod.resource_version = rv;
        let pod = pod.clone();
        state.emit(WatchEvent::Modified(pod.clone()));

        Ok(pod)
    }

    /// Requests the deletion: only the DeletionTimestamp is set, the node agent removes the object.
    pub fn delete_pod(&self, key: &ReconcileKey) -> Result<PodRecord, VkError> {
        let mut state = lock_ptr!(self.state)?;
        let deleting = state
            .pods
            .get(key)
            .ok_or(VkError::NotFound(key.to_string()))?
            .is_deleting();
        if deleting {
            return state
                .pods
                .get(key)
                .cloned()
                .ok_or(VkError::NotFound(key.to_string()));
        }

        let rv = state.next_resource_version();
        let pod = state
            .pods
            .get_mut(key)
            .ok_or(VkError::NotFound(key.to_string()))?;
        pod.deletion_timestamp = Some(Utc::now());
        pod.resource_version = rv;
        let pod = pod.clone();
        state.emit(WatchEvent::Modified(pod.clone()));

        Ok(pod)
    }

    pub fn pod(&self, key: &ReconcileKey) -> Option<PodRecord> {
        lock_ptr!(self.state).ok()?.pods.get(key).cloned()
    }

    pub fn node(&self, name: &str) -> Option<NodeDescriptor> {
        lock_ptr!(self.state).ok()?.nodes.get(name).cloned()
    }

    pub fn remove_node(&self, name: &str) -> Option<NodeDescriptor> {
        lock_ptr!(self.state).ok()?.nodes.remove(name)
    }

    pub fn lease(&self, name: &str) -> Option<Lease> {
        lock_ptr!(self.state).ok()?.leases.get(name).cloned()
    }

    pub fn events(&self) -> Vec<Event> {
        lock_ptr!(self.state)
            .map(|s| s.events.clone())
            .unwrap_or_default()
    }

    pub fn node_status_updates(&self) -> usize {
        lock_ptr!(self.state)
            .map(|s| s.node_status_updates)
            .unwrap_or_default()
    }

    pub fn pod_status_updates(&self) -> usize {
        lock_ptr!(self.state)
            .map(|s| s.pod_status_updates)
            .unwrap_or_default()
    }

    /// When unavailable, every API call fails with a network error.
    pub fn set_available(&self, available: bool) -> Result<(), VkError> {
        let mut state = lock_ptr!(self.state)?;
        state.unavailable = !available;
        Ok(())
    }
}

#[async_trait]
impl ControlPlane for MemoryControlPlane {
    async fn list_pods(&self, node: &str) -> Result<PodList, VkError> {
        let state = lock_ptr!(self.state)?;
        state.check_available()?;

        Ok(PodList {
            items: state
                .pods
                .values()
                .filter(|p| p.spec.node_name == node)
                .cloned()
                .collect(),
            resource_version: state.resource_version,
        })
    }

    async fn watch_pods(
        &self,
        node: &str,
        resource_version: ResourceVersion,
    ) -> Result<WatchStream, VkError> {
        let mut state = lock_ptr!(self.state)?;
        state.check_available()?;

        let oldest = state
            .history
            .front()
            .map(|(rv, _)| *rv)
            .unwrap_or(state.resource_version + 1);
        if resource_version < state.resource_version && resource_version + 1 < oldest {
            return Err(VkError::Expired(format!(
                "resource version {resource_version}"
            )));
        }

        let (tx, rx) = mpsc::unbounded_channel();
        for (rv, event) in state.history.iter() {
            if *rv > resource_version && event.pod().spec.node_name == node {
                let _ = tx.send(Ok(event.clone()));
            }
        }
        state.watchers.push(Watcher {
            node: node.to_string(),
            tx,
        });

        Ok(UnboundedReceiverStream::new(rx).boxed())
    }

    async fn get_pod(&self, key: &ReconcileKey) -> Result<PodRecord, VkError> {
        let state = lock_ptr!(self.state)?;
        state.check_available()?;

        state
            .pods
            .get(key)
            .cloned()
            .ok_or(VkError::NotFound(key.to_string()))
    }

    async fn update_pod_status(&self, pod: &PodRecord) -> Result<PodRecord, VkError> {
        let mut state = lock_ptr!(self.state)?;
        state.check_available()?;

        let key = pod.key();
        let stored = state
            .pods
            .get(&key)
            .ok_or(VkError::NotFound(key.to_string()))?;
        if stored.uid != pod.uid {
            return Err(VkError::NotFound(format!("{key} ({})", pod.uid)));
        }
        if stored.resource_version != pod.resource_version {
            return Err(VkError::Conflict(format!(
                "pod <{key}> resource version {} is stale, latest is {}",
                pod.resource_version, stored.resource_version
            )));
        }

        let rv = state.next_resource_version();
        state.pod_status_updates += 1;
        let stored = state
            .pods
            .get_mut(&key)
            .ok_or(VkError::NotFound(key.to_string()))?;
        stored.status = pod.status.clone();
        stored.resource_version = rv;
        let stored = stored.clone();
        state.emit(WatchEvent::Modified(stored.clone()));

        Ok(stored)
    }

    async fn remove_pod(&self, key: &ReconcileKey, uid: &PodUID) -> Result<(), VkError> {
        let mut state = lock_ptr!(self.state)?;
        state.check_available()?;

        match state.pods.get(key) {
            Some(pod) if &pod.uid == uid => {}
            _ => return Err(VkError::NotFound(format!("{key} ({uid})"))),
        }

        let rv = state.next_resource_version();
        let mut pod = state
            .pods
            .remove(key)
            .ok_or(VkError::NotFound(key.to_string()))?;
        pod.resource_version = rv;
        state.emit(WatchEvent::Deleted(pod));

        Ok(())
    }

    async fn register_node(&self, node: &NodeDescriptor) -> Result<NodeDescriptor, VkError> {
        let mut state = lock_ptr!(self.state)?;
        state.check_available()?;

        state.nodes.insert(node.name.clone(), node.clone());
        Ok(node.clone())
    }

    async fn update_node_status(&self, node: &NodeDescriptor) -> Result<NodeDescriptor, VkError> {
        let mut state = lock_ptr!(self.state)?;
        state.check_available()?;

        if !state.nodes.contains_key(&node.name) {
            return Err(VkError::NotFound(node.name.clone()));
        }
        state.nodes.insert(node.name.clone(), node.clone());
        state.node_status_updates += 1;

        Ok(node.clone())
    }

    async fn renew_lease(&self, lease: &Lease) -> Result<Lease, VkError> {
        let mut state = lock_ptr!(self.state)?;
        state.check_available()?;

        state
            .leases
            .insert(lease.holder_identity.clone(), lease.clone());
        Ok(lease.clone())
    }

    async fn record_event(&self, event: Event) -> Result<(), VkError> {
        let mut state = lock_ptr!(self.state)?;
        state.check_available()?;

        state.events.push(event);
        Ok(())
    }
}

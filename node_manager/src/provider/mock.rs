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
use std::fs;
use std::path::Path;
use std::sync::atomic::{AtomicU32, Ordering};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rand::Rng;
use serde_derive::{Deserialize, Serialize};

use common::apis::{
    ConditionStatus, ContainerState, ContainerStats, ContainerStatus, CpuStats, MemoryStats,
    NodeAddress, NodeCondition, NodeConditionType, NodeStats, PodPhase, PodRecord, PodReference,
    PodStats, ProviderPodState, Quantity, ReconcileKey, ResourceList, Summary, RESOURCE_CPU,
    RESOURCE_MEMORY, RESOURCE_PODS,
};
use common::VkError;
use stdng::{lock_ptr, new_ptr, MutexPtr};

use crate::provider::{InitConfig, PodNotifier, Provider};

const DEFAULT_CPU_CAPACITY: &str = "20";
const DEFAULT_MEMORY_CAPACITY: &str = "100Gi";
const DEFAULT_PODS_CAPACITY: &str = "20";

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct MockConfigYaml {
    pub cpu: Option<String>,
    pub memory: Option<String>,
    pub pods: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MockConfig {
    pub cpu: Quantity,
    pub memory: Quantity,
    pub pods: Quantity,
}

impl MockConfig {
    pub fn from_file(fp: Option<&str>) -> Result<Self, VkError> {
        let yaml = match fp {
            None => MockConfigYaml::default(),
            Some(fp) => {
                if !Path::new(fp).is_file() {
                    return Err(VkError::InvalidConfig(format!("<{fp}> is not a file")));
                }
                let contents = fs::read_to_string(fp)?;
                serde_yaml::from_str(&contents)?
            }
        };

        MockConfig::try_from(yaml)
    }
}

impl TryFrom<MockConfigYaml> for MockConfig {
    type Error = VkError;
    fn try_from(yaml: MockConfigYaml) -> Result<Self, Self::Error> {
        let parse = |v: Option<String>, default: &str| -> Result<Quantity, VkError> {
            Quantity::parse(v.as_deref().unwrap_or(default))
                .map_err(|e| VkError::InvalidConfig(e.to_string()))
        };

        Ok(MockConfig {
            cpu: parse(yaml.cpu, DEFAULT_CPU_CAPACITY)?,
            memory: parse(yaml.memory, DEFAULT_MEMORY_CAPACITY)?,
            pods: parse(yaml.pods, DEFAULT_PODS_CAPACITY)?,
        })
    }
}

struct MockPod {
    pod: PodRecord,
    state: ProviderPodState,
}

/// An in-memory backend: pods run as soon as they are created.
pub struct MockProvider {
    cfg: InitConfig,
    config: MockConfig,
    start_time: DateTime<Utc>,
    pods: MutexPtr<HashMap<ReconcileKey, MockPod>>,
    notifier: MutexPtr<Option<PodNotifier>>,
    next_ip: AtomicU32,
}

impl MockProvider {
    pub fn new(
        config_path: Option<&str>,
        node_name: &str,
        operating_system: &str,
        internal_ip: &str,
        daemon_port: u16,
    ) -> Result<Self, VkError> {
        let config = MockConfig::from_file(config_path)?;

        Ok(MockProvider {
            cfg: InitConfig {
                config_path: config_path.map(|s| s.to_string()),
                node_name: node_name.to_string(),
                operating_system: operating_system.to_string(),
                internal_ip: internal_ip.to_string(),
                daemon_port,
            },
            config,
            start_time: Utc::now(),
            pods: new_ptr(HashMap::new()),
            notifier: new_ptr(None),
            next_ip: AtomicU32::new(0),
        })
    }

    fn notify(&self, key: &ReconcileKey) {
        let Ok(notifier) = lock_ptr!(self.notifier) else {
            return;
        };
        if let Some(notifier) = notifier.as_ref() {
            // The receiver is gone on shutdown; nothing to tell anymore.
            let _ = notifier.send(key.clone());
        }
    }

    fn allocate_ip(&self) -> String {
        let n = self.next_ip.fetch_add(1, Ordering::SeqCst);
        format!("10.244.{}.{}", (n / 250) % 256, n % 250 + 1)
    }

    fn container_statuses(pod: &PodRecord, started_at: DateTime<Utc>) -> Vec<ContainerStatus> {
        pod.spec
            .containers
            .iter()
            .map(|c| ContainerStatus {
                name: c.name.clone(),
                image: c.image.clone(),
                ready: true,
                restart_count: 0,
                state: ContainerState::Running { started_at },
            })
            .collect()
    }
}

#[async_trait]
impl Provider for MockProvider {
    async fn create_pod(&self, pod: &PodRecord) -> Result<(), VkError> {
        let key = pod.key();
        let now = Utc::now();
        {
            let mut pods = lock_ptr!(self.pods)?;
            match pods.get_mut(&key) {
                Some(mock) if mock.pod.uid == pod.uid => {
                    tracing::debug!("Pod <{key}> already exists in mock provider, refresh it.");
                    let started_at = mock.state.start_time.unwrap_or(now);
                    mock.state.containers = Self::container_statuses(pod, started_at);
                    mock.pod = pod.clone();
                }
                _ => {
                    tracing::debug!("Create pod <{key}> in mock provider.");
                    let state = ProviderPodState {
                        uid: pod.uid.clone(),
                        phase: PodPhase::Running,
                        containers: Self::container_statuses(pod, now),
                        start_time: Some(now),
                        pod_ip: Some(self.allocate_ip()),
                        message: None,
                    };
                    pods.insert(
                        key.clone(),
                        MockPod {
                            pod: pod.clone(),
                            state,
                        },
                    );
                }
            }
        }

        self.notify(&key);
        Ok(())
    }

    async fn update_pod(&self, pod: &PodRecord) -> Result<(), VkError> {
        let key = pod.key();
        {
            let mut pods = lock_ptr!(self.pods)?;
            let mock = pods
                .get_mut(&key)
                .ok_or(VkError::NotFound(key.to_string()))?;

            tracing::debug!("Update pod <{key}> in mock provider.");
            let started_at = mock.state.start_time.unwrap_or_else(Utc::now);
            mock.state.containers = Self::container_statuses(pod, started_at);
            mock.state.uid = pod.uid.clone();
            mock.pod = pod.clone();
        }

        self.notify(&key);
        Ok(())
    }

    async fn delete_pod(&self, key: &ReconcileKey) -> Result<(), VkError> {
        let removed = {
            let mut pods = lock_ptr!(self.pods)?;
            pods.remove(key).is_some()
        };

        if removed {
            tracing::debug!("Delete pod <{key}> from mock provider.");
            self.notify(key);
        }

        Ok(())
    }

    async fn get_pod_status(&self, key: &ReconcileKey) -> Result<ProviderPodState, VkError> {
        let pods = lock_ptr!(self.pods)?;
        pods.get(key)
            .map(|mock| mock.state.clone())
            .ok_or(VkError::NotFound(key.to_string()))
    }

    async fn list_pods(&self) -> Result<Vec<ReconcileKey>, VkError> {
        let pods = lock_ptr!(self.pods)?;
        Ok(pods.keys().cloned().collect())
    }

    fn capacity(&self) -> ResourceList {
        ResourceList::from([
            (RESOURCE_CPU.to_string(), self.config.cpu.clone()),
            (RESOURCE_MEMORY.to_string(), self.config.memory.clone()),
            (RESOURCE_PODS.to_string(), self.config.pods.clone()),
        ])
    }

    fn node_conditions(&self) -> Vec<NodeCondition> {
        vec![
            NodeCondition::new(
                NodeConditionType::Ready,
                ConditionStatus::True,
                "KubeletReady",
                "kubelet is ready.",
            ),
            NodeCondition::new(
                NodeConditionType::OutOfDisk,
                ConditionStatus::False,
                "KubeletHasSufficientDisk",
                "kubelet has sufficient disk space available",
            ),
            NodeCondition::new(
                NodeConditionType::MemoryPressure,
                ConditionStatus::False,
                "KubeletHasSufficientMemory",
                "kubelet has sufficient memory available",
            ),
            NodeCondition::new(
                NodeConditionType::DiskPressure,
                ConditionStatus::False,
                "KubeletHasNoDiskPressure",
                "kubelet has no disk pressure",
            ),
            NodeCondition::new(
                NodeConditionType::NetworkUnavailable,
                ConditionStatus::False,
                "RouteCreated",
                "RouteController created a route",
            ),
        ]
    }

    fn node_addresses(&self) -> Vec<NodeAddress> {
        self.cfg.default_addresses()
    }

    fn operating_system(&self) -> String {
        self.cfg.operating_system.clone()
    }

    fn node_daemon_port(&self) -> u16 {
        self.cfg.daemon_port
    }

    async fn stats_summary(&self) -> Result<Summary, VkError> {
        let now = Utc::now();
        let mut rng = rand::rng();

        let pods = lock_ptr!(self.pods)?;
        let mut pod_stats = vec![];
        let mut node_cpu = 0_u64;
        let mut node_memory = 0_u64;

        for mock in pods.values() {
            let mut pod_cpu = 0_u64;
            let mut pod_memory = 0_u64;
            let mut containers = vec![];

            for c in &mock.pod.spec.containers {
                let cpu = rng.random_range(0..u32::MAX as u64);
                let memory = rng.random_range(0..u32::MAX as u64);
                pod_cpu += cpu;
                pod_memory += memory;

                containers.push(ContainerStats {
                    name: c.name.clone(),
                    start_time: mock.state.start_time,
                    cpu: Some(CpuStats {
                        time: Some(now),
                        usage_nano_cores: Some(cpu),
                        usage_core_nano_seconds: Some(cpu.saturating_mul(1000)),
                    }),
                    memory: Some(MemoryStats {
                        time: Some(now),
                        usage_bytes: Some(memory),
                        working_set_bytes: Some(memory),
                    }),
                });
            }

            node_cpu += pod_cpu;
            node_memory += pod_memory;

            pod_stats.push(PodStats {
                pod_ref: PodReference {
                    name: mock.pod.name.clone(),
                    namespace: mock.pod.namespace.clone(),
                    uid: mock.pod.uid.clone(),
                },
                start_time: mock.state.start_time,
                containers,
                cpu: Some(CpuStats {
                    time: Some(now),
                    usage_nano_cores: Some(pod_cpu),
                    usage_core_nano_seconds: Some(pod_cpu.saturating_mul(1000)),
                }),
                memory: Some(MemoryStats {
                    time: Some(now),
                    usage_bytes: Some(pod_memory),
                    working_set_bytes: Some(pod_memory),
                }),
            });
        }

        Ok(Summary {
            node: NodeStats {
                node_name: self.cfg.node_name.clone(),
                start_time: Some(self.start_time),
                cpu: Some(CpuStats {
                    time: Some(now),
                    usage_nano_cores: Some(node_cpu),
                    usage_core_nano_seconds: Some(node_cpu.saturating_mul(1000)),
                }),
                memory: Some(MemoryStats {
                    time: Some(now),
                    usage_bytes: Some(node_memory),
                    working_set_bytes: Some(node_memory),
                }),
            },
            pods: pod_stats,
        })
    }

    async fn container_logs(
        &self,
        key: &ReconcileKey,
        container: &str,
        tail: Option<usize>,
    ) -> Result<String, VkError> {
        let pods = lock_ptr!(self.pods)?;
        let mock = pods.get(key).ok_or(VkError::NotFound(key.to_string()))?;
        if !mock.pod.spec.containers.iter().any(|c| c.name == container) {
            return Err(VkError::NotFound(format!("{key}/{container}")));
        }

        let lines = [
            format!("mock provider started container <{container}> of pod <{key}>"),
            format!("container <{container}> is running"),
        ];
        let skip = tail.map(|t| lines.len().saturating_sub(t)).unwrap_or(0);

        Ok(lines
            .iter()
            .skip(skip)
            .map(|l| format!("{l}\n"))
            .collect())
    }

    fn notify_pods(&self, notifier: PodNotifier) -> bool {
        match lock_ptr!(self.notifier) {
            Ok(mut n) => {
                *n = Some(notifier);
                true
            }
            Err(e) => {
                tracing::error!("Failed to install pod notifier: {e}");
                false
            }
        }
    }
}

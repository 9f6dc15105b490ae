/*
Copyright 2023 The Flame Authors.
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

use std::fmt::{Display, Formatter};
use std::fs;
use std::path::Path;
use std::time::Duration;

use serde_derive::{Deserialize, Serialize};

use crate::{VkError, DEFAULT_VK_CONF};

const DEFAULT_OPERATING_SYSTEM: &str = "Linux";
const DEFAULT_INTERNAL_IP: &str = "127.0.0.1";
const DEFAULT_DAEMON_PORT: u16 = 10250;
const DEFAULT_PROVIDER: &str = "mock";
const DEFAULT_CONTROL_PLANE_ENDPOINT: &str = "memory://";
const DEFAULT_REQUEST_TIMEOUT_MS: u64 = 10_000;

const DEFAULT_WORKERS: usize = 10;
const DEFAULT_RESYNC_INTERVAL_MS: u64 = 30_000;
const DEFAULT_STATUS_SYNC_INTERVAL_MS: u64 = 5_000;
const DEFAULT_BACKOFF_BASE_MS: u64 = 1_000;
const DEFAULT_BACKOFF_MAX_MS: u64 = 30_000;
const DEFAULT_SHUTDOWN_TIMEOUT_MS: u64 = 10_000;

const DEFAULT_NODE_STATUS_INTERVAL_MS: u64 = 60_000;
const DEFAULT_LEASE_INTERVAL_MS: u64 = 10_000;
const DEFAULT_LEASE_DURATION_SECS: u32 = 40;

#[derive(Debug, Clone, Serialize, Deserialize)]
struct VkContextYaml {
    pub node: Option<NodeYaml>,
    pub provider: Option<ProviderYaml>,
    pub control_plane: Option<ControlPlaneYaml>,
    pub controller: Option<ControllerYaml>,
    pub node_status: Option<NodeStatusYaml>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct NodeYaml {
    pub name: Option<String>,
    pub os: Option<String>,
    pub internal_ip: Option<String>,
    pub daemon_port: Option<u16>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct ProviderYaml {
    pub name: Option<String>,
    pub config: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct ControlPlaneYaml {
    pub endpoint: Option<String>,
    pub request_timeout_ms: Option<u64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct ControllerYaml {
    pub workers: Option<usize>,
    pub resync_interval_ms: Option<u64>,
    pub status_sync_interval_ms: Option<u64>,
    pub backoff_base_ms: Option<u64>,
    pub backoff_max_ms: Option<u64>,
    pub shutdown_timeout_ms: Option<u64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct NodeStatusYaml {
    pub status_interval_ms: Option<u64>,
    pub lease_interval_ms: Option<u64>,
    pub lease_duration_secs: Option<u32>,
}

/// Node identity; immutable for the process lifetime.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VkNode {
    pub name: String,
    pub operating_system: String,
    pub internal_ip: String,
    pub daemon_port: u16,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VkProvider {
    pub name: String,
    pub config: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VkControlPlane {
    pub endpoint: String,
    pub request_timeout: Duration,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VkController {
    pub workers: usize,
    pub resync_interval: Duration,
    pub status_sync_interval: Duration,
    pub backoff_base: Duration,
    pub backoff_max: Duration,
    pub shutdown_timeout: Duration,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VkNodeStatus {
    pub status_interval: Duration,
    pub lease_interval: Duration,
    pub lease_duration_secs: u32,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct VkContext {
    pub node: VkNode,
    pub provider: VkProvider,
    pub control_plane: VkControlPlane,
    pub controller: VkController,
    pub node_status: VkNodeStatus,
}

impl Display for VkContext {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "node: {}, provider: {}, control plane: {}",
            self.node.name, self.provider.name, self.control_plane.endpoint
        )
    }
}

impl VkContext {
    pub fn from_file(fp: Option<String>) -> Result<Self, VkError> {
        let fp = match fp {
            None => {
                let home = std::env::var("HOME").unwrap_or_else(|_| ".".to_string());
                format!("{home}/.vk/{DEFAULT_VK_CONF}")
            }
            Some(path) => path,
        };

        if !Path::new(&fp).is_file() {
            return Err(VkError::InvalidConfig(format!("<{fp}> is not a file")));
        }

        let contents = fs::read_to_string(fp.clone())?;
        let ctx: VkContextYaml = serde_yaml::from_str(&contents)?;

        tracing::debug!("Load VkContext from <{fp}>: {ctx:?}");

        let ctx = VkContext::try_from(ctx)?;
        ctx.validate()?;

        Ok(ctx)
    }

    pub fn validate(&self) -> Result<(), VkError> {
        if self.node.name.is_empty() {
            return Err(VkError::InvalidConfig("node name is empty".to_string()));
        }
        if self.controller.workers == 0 {
            return Err(VkError::InvalidConfig(
                "at least one pod worker is required".to_string(),
            ));
        }
        if self.controller.backoff_base > self.controller.backoff_max {
            return Err(VkError::InvalidConfig(format!(
                "backoff base {:?} is greater than backoff max {:?}",
                self.controller.backoff_base, self.controller.backoff_max
            )));
        }

        if self.control_plane.request_timeout.is_zero() {
            return Err(VkError::InvalidConfig(
                "control plane request timeout must not be zero".to_string(),
            ));
        }

        let lease_duration = Duration::from_secs(self.node_status.lease_duration_secs as u64);
        if self.node_status.lease_interval >= lease_duration {
            return Err(VkError::InvalidConfig(format!(
                "lease interval {:?} must be shorter than lease duration {:?}",
                self.node_status.lease_interval, lease_duration
            )));
        }

        Ok(())
    }
}

impl TryFrom<VkContextYaml> for VkContext {
    type Error = VkError;
    fn try_from(ctx: VkContextYaml) -> Result<Self, Self::Error> {
        Ok(VkContext {
            node: ctx.node.map(VkNode::try_from).transpose()?.unwrap_or_default(),
            provider: ctx
                .provider
                .map(VkProvider::try_from)
                .transpose()?
                .unwrap_or_default(),
            control_plane: ctx
                .control_plane
                .map(VkControlPlane::try_from)
                .transpose()?
                .unwrap_or_default(),
            controller: ctx
                .controller
                .map(VkController::try_from)
                .transpose()?
                .unwrap_or_default(),
            node_status: ctx
                .node_status
                .map(VkNodeStatus::try_from)
                .transpose()?
                .unwrap_or_default(),
        })
    }
}

impl TryFrom<NodeYaml> for VkNode {
    type Error = VkError;
    fn try_from(node: NodeYaml) -> Result<Self, Self::Error> {
        let default = VkNode::default();
        Ok(VkNode {
            name: node.name.unwrap_or(default.name),
            operating_system: node.os.unwrap_or(default.operating_system),
            internal_ip: node.internal_ip.unwrap_or(default.internal_ip),
            daemon_port: node.daemon_port.unwrap_or(default.daemon_port),
        })
    }
}

impl TryFrom<ProviderYaml> for VkProvider {
    type Error = VkError;
    fn try_from(provider: ProviderYaml) -> Result<Self, Self::Error> {
        Ok(VkProvider {
            name: provider.name.unwrap_or(DEFAULT_PROVIDER.to_string()),
            config: provider.config,
        })
    }
}

impl TryFrom<ControlPlaneYaml> for VkControlPlane {
    type Error = VkError;
    fn try_from(cp: ControlPlaneYaml) -> Result<Self, Self::Error> {
        Ok(VkControlPlane {
            endpoint: cp
                .endpoint
                .unwrap_or(DEFAULT_CONTROL_PLANE_ENDPOINT.to_string()),
            request_timeout: Duration::from_millis(
                cp.request_timeout_ms.unwrap_or(DEFAULT_REQUEST_TIMEOUT_MS),
            ),
        })
    }
}

impl TryFrom<ControllerYaml> for VkController {
    type Error = VkError;
    fn try_from(c: ControllerYaml) -> Result<Self, Self::Error> {
        Ok(VkController {
            workers: c.workers.unwrap_or(DEFAULT_WORKERS),
            resync_interval: Duration::from_millis(
                c.resync_interval_ms.unwrap_or(DEFAULT_RESYNC_INTERVAL_MS),
            ),
            status_sync_interval: Duration::from_millis(
                c.status_sync_interval_ms
                    .unwrap_or(DEFAULT_STATUS_SYNC_INTERVAL_MS),
            ),
            backoff_base: Duration::from_millis(c.backoff_base_ms.unwrap_or(DEFAULT_BACKOFF_BASE_MS)),
            backoff_max: Duration::from_millis(c.backoff_max_ms.unwrap_or(DEFAULT_BACKOFF_MAX_MS)),
            shutdown_timeout: Duration::from_millis(
                c.shutdown_timeout_ms.unwrap_or(DEFAULT_SHUTDOWN_TIMEOUT_MS),
            ),
        })
    }
}

impl TryFrom<NodeStatusYaml> for VkNodeStatus {
    type Error = VkError;
    fn try_from(ns: NodeStatusYaml) -> Result<Self, Self::Error> {
        Ok(VkNodeStatus {
            status_interval: Duration::from_millis(
                ns.status_interval_ms
                    .unwrap_or(DEFAULT_NODE_STATUS_INTERVAL_MS),
            ),
            lease_interval: Duration::from_millis(
                ns.lease_interval_ms.unwrap_or(DEFAULT_LEASE_INTERVAL_MS),
            ),
            lease_duration_secs: ns
                .lease_duration_secs
                .unwrap_or(DEFAULT_LEASE_DURATION_SECS),
        })
    }
}

impl Default for VkNode {
    fn default() -> Self {
        VkNode {
            name: gethostname::gethostname().to_string_lossy().to_lowercase(),
            operating_system: DEFAULT_OPERATING_SYSTEM.to_string(),
            internal_ip: DEFAULT_INTERNAL_IP.to_string(),
            daemon_port: DEFAULT_DAEMON_PORT,
        }
    }
}

impl Default for VkProvider {
    fn default() -> Self {
        VkProvider {
            name: DEFAULT_PROVIDER.to_string(),
            config: None,
        }
    }
}

impl Default for VkControlPlane {
    fn default() -> Self {
        VkControlPlane {
            endpoint: DEFAULT_CONTROL_PLANE_ENDPOINT.to_string(),
            request_timeout: Duration::from_millis(DEFAULT_REQUEST_TIMEOUT_MS),
        }
    }
}

impl Default for VkController {
    fn default() -> Self {
        VkController {
            workers: DEFAULT_WORKERS,
            resync_interval: Duration::from_millis(DEFAULT_RESYNC_INTERVAL_MS),
            status_sync_interval: Duration::from_millis(DEFAULT_STATUS_SYNC_INTERVAL_MS),
            backoff_base: Duration::from_millis(DEFAULT_BACKOFF_BASE_MS),
            backoff_max: Duration::from_millis(DEFAULT_BACKOFF_MAX_MS),
            shutdown_timeout: Duration::from_millis(DEFAULT_SHUTDOWN_TIMEOUT_MS),
        }
    }
}

impl Default for VkNodeStatus {
    fn default() -> Self {
        VkNodeStatus {
            status_interval: Duration::from_millis(DEFAULT_NODE_STATUS_INTERVAL_MS),
            lease_interval: Duration::from_millis(DEFAULT_LEASE_INTERVAL_MS),
            lease_duration_secs: DEFAULT_LEASE_DURATION_SECS,
        }
    }
}

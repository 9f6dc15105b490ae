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

use std::cmp::Ordering;
use std::collections::{BTreeMap, HashSet};
use std::fmt::{Display, Formatter};
use std::str::FromStr;

use chrono::{DateTime, Duration, Utc};
use serde_derive::{Deserialize, Serialize};
use strum_macros::{Display as StrumDisplay, EnumString};

use crate::VkError;

pub type PodUID = String;
pub type ResourceVersion = u64;
pub type ResourceList = BTreeMap<String, Quantity>;

pub const RESOURCE_CPU: &str = "cpu";
pub const RESOURCE_MEMORY: &str = "memory";
pub const RESOURCE_PODS: &str = "pods";

pub const DEFAULT_NAMESPACE: &str = "default";

/// The work queue key of a pod; stable for the lifetime of the pod object.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ReconcileKey {
    pub namespace: String,
    pub name: String,
}

impl ReconcileKey {
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        ReconcileKey {
            namespace: namespace.into(),
            name: name.into(),
        }
    }
}

impl Display for ReconcileKey {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.namespace, self.name)
    }
}

impl FromStr for ReconcileKey {
    type Err = VkError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.split_once('/') {
            Some((ns, name)) if !ns.is_empty() && !name.is_empty() && !name.contains('/') => {
                Ok(ReconcileKey::new(ns, name))
            }
            None if !s.is_empty() => Ok(ReconcileKey::new(DEFAULT_NAMESPACE, s)),
            _ => Err(VkError::InvalidSpec(format!("invalid key <{s}>"))),
        }
    }
}

/// A semantic resource quantity, e.g. `100m`, `2`, `100Gi`; compared by value.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Quantity {
    repr: String,
    milli: i128,
}

impl Quantity {
    pub fn parse(s: &str) -> Result<Self, VkError> {
        let s = s.trim();
        let idx = s
            .find(|c: char| !(c.is_ascii_digit() || c == '.'))
            .unwrap_or(s.len());
        let (number, suffix) = s.split_at(idx);

        let multiplier: i128 = match suffix {
            "m" => 1,
            "" => 1_000,
            "k" => 1_000_000,
            "M" => 1_000_000_000,
            "G" => 1_000_000_000_000,
            "T" => 1_000_000_000_000_000,
            "P" => 1_000_000_000_000_000_000,
            "Ki" => 1_000 << 10,
            "Mi" => 1_000 << 20,
            "Gi" => 1_000 << 30,
            "Ti" => 1_000 << 40,
            "Pi" => 1_000 << 50,
            _ => {
                return Err(VkError::InvalidSpec(format!(
                    "unknown suffix of quantity <{s}>"
                )))
            }
        };

        let (int_part, frac_part) = number.split_once('.').unwrap_or((number, ""));
        if int_part.is_empty() && frac_part.is_empty() {
            return Err(VkError::InvalidSpec(format!("invalid quantity <{s}>")));
        }
        let parse = |p: &str| -> Result<i128, VkError> {
            if p.is_empty() {
                return Ok(0);
            }
            p.parse::<i128>()
                .map_err(|e| VkError::InvalidSpec(format!("invalid quantity <{s}>: {e}")))
        };

        let overflow = || VkError::InvalidSpec(format!("quantity <{s}> is out of range"));

        let mut milli = parse(int_part)?
            .checked_mul(multiplier)
            .ok_or_else(overflow)?;
        if !frac_part.is_empty() {
            let scale = u32::try_from(frac_part.len())
                .ok()
                .and_then(|len| 10_i128.checked_pow(len))
                .ok_or_else(overflow)?;
            let frac = parse(frac_part)?
                .checked_mul(multiplier)
                .ok_or_else(overflow)?;
            milli = milli.checked_add(frac / scale).ok_or_else(overflow)?;
        }

        Ok(Quantity {
            repr: s.to_string(),
            milli,
        })
    }

    pub fn from_milli(milli: i128) -> Self {
        Quantity {
            repr: format!("{milli}m"),
            milli,
        }
    }

    pub fn from_value(value: i64) -> Self {
        Quantity {
            repr: value.to_string(),
            milli: value as i128 * 1_000,
        }
    }

    pub fn milli_value(&self) -> i128 {
        self.milli
    }

    /// The whole-unit value, rounded up.
    pub fn value(&self) -> i128 {
        (self.milli + 999).div_euclid(1_000)
    }
}

impl Display for Quantity {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.repr)
    }
}

impl PartialEq for Quantity {
    fn eq(&self, other: &Self) -> bool {
        self.milli == other.milli
    }
}

impl Eq for Quantity {}

impl PartialOrd for Quantity {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Quantity {
    fn cmp(&self, other: &Self) -> Ordering {
        self.milli.cmp(&other.milli)
    }
}

impl TryFrom<String> for Quantity {
    type Error = VkError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Quantity::parse(&value)
    }
}

impl From<Quantity> for String {
    fn from(value: Quantity) -> Self {
        value.repr
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceRequirements {
    #[serde(default)]
    pub requests: ResourceList,
    #[serde(default)]
    pub limits: ResourceList,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EnvVar {
    pub name: String,
    pub value: String,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Container {
    pub name: String,
    pub image: String,
    #[serde(default)]
    pub command: Vec<String>,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub env: Vec<EnvVar>,
    #[serde(default)]
    pub resources: ResourceRequirements,
}

impl Container {
    pub fn new(name: impl Into<String>, image: impl Into<String>) -> Self {
        Container {
            name: name.into(),
            image: image.into(),
            ..Container::default()
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum VolumeSource {
    EmptyDir,
    HostPath(String),
    ConfigMap(String),
    Secret(String),
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Volume {
    pub name: String,
    pub source: VolumeSource,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PodSpec {
    pub node_name: String,
    pub containers: Vec<Container>,
    #[serde(default)]
    pub volumes: Vec<Volume>,
}

#[derive(
    Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize, StrumDisplay, EnumString,
)]
pub enum PodPhase {
    #[default]
    Pending,
    Running,
    Succeeded,
    Failed,
    Unknown,
}

#[derive(
    Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize, StrumDisplay, EnumString,
)]
pub enum ConditionStatus {
    True,
    False,
    #[default]
    Unknown,
}

impl From<bool> for ConditionStatus {
    fn from(value: bool) -> Self {
        if value {
            ConditionStatus::True
        } else {
            ConditionStatus::False
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize, StrumDisplay, EnumString)]
pub enum PodConditionType {
    PodScheduled,
    Initialized,
    ContainersReady,
    Ready,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PodCondition {
    pub condition_type: PodConditionType,
    pub status: ConditionStatus,
    pub last_transition_time: Option<DateTime<Utc>>,
    pub reason: Option<String>,
    pub message: Option<String>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum ContainerState {
    Waiting {
        reason: String,
    },
    Running {
        started_at: DateTime<Utc>,
    },
    Terminated {
        exit_code: i32,
        reason: String,
        finished_at: DateTime<Utc>,
    },
}

impl Default for ContainerState {
    fn default() -> Self {
        ContainerState::Waiting {
            reason: "ContainerCreating".to_string(),
        }
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContainerStatus {
    pub name: String,
    pub image: String,
    pub ready: bool,
    pub restart_count: u32,
    pub state: ContainerState,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PodStatus {
    pub phase: PodPhase,
    #[serde(default)]
    pub conditions: Vec<PodCondition>,
    #[serde(default)]
    pub container_statuses: Vec<ContainerStatus>,
    pub start_time: Option<DateTime<Utc>>,
    pub host_ip: Option<String>,
    pub pod_ip: Option<String>,
    pub reason: Option<String>,
    pub message: Option<String>,
}

impl PodStatus {
    pub fn condition(&self, condition_type: PodConditionType) -> Option<&PodCondition> {
        self.conditions
            .iter()
            .find(|c| c.condition_type == condition_type)
    }

    pub fn is_ready(&self) -> bool {
        self.condition(PodConditionType::Ready)
            .map(|c| c.status == ConditionStatus::True)
            .unwrap_or(false)
    }
}

/// The pod object as last observed from the control plane.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PodRecord {
    pub namespace: String,
    pub name: String,
    pub uid: PodUID,
    pub resource_version: ResourceVersion,
    pub creation_timestamp: Option<DateTime<Utc>>,
    pub deletion_timestamp: Option<DateTime<Utc>>,
    pub spec: PodSpec,
    pub status: PodStatus,
}

impl PodRecord {
    pub fn key(&self) -> ReconcileKey {
        ReconcileKey::new(self.namespace.clone(), self.name.clone())
    }

    pub fn is_deleting(&self) -> bool {
        self.deletion_timestamp.is_some()
    }

    /// Rejects specs no backend can run; called before any provider call.
    pub fn validate(&self) -> Result<(), VkError> {
        if self.name.is_empty() || self.namespace.is_empty() {
            return Err(VkError::InvalidSpec(
                "pod name and namespace are required".to_string(),
            ));
        }

        if self.spec.containers.is_empty() {
            return Err(VkError::InvalidSpec(format!(
                "pod <{}> has no containers",
                self.key()
            )));
        }

        let mut names = HashSet::new();
        for c in &self.spec.containers {
            if c.name.is_empty() {
                return Err(VkError::InvalidSpec(format!(
                    "pod <{}> has a container without name",
                    self.key()
                )));
            }
            if c.image.is_empty() {
                return Err(VkError::InvalidSpec(format!(
                    "container <{}> of pod <{}> has no image",
                    c.name,
                    self.key()
                )));
            }
            if !names.insert(c.name.as_str()) {
                return Err(VkError::InvalidSpec(format!(
                    "duplicated container <{}> in pod <{}>",
                    c.name,
                    self.key()
                )));
            }
        }

        let mut volumes = HashSet::new();
        for v in &self.spec.volumes {
            if !volumes.insert(v.name.as_str()) {
                return Err(VkError::InvalidSpec(format!(
                    "duplicated volume <{}> in pod <{}>",
                    v.name,
                    self.key()
                )));
            }
        }

        Ok(())
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct PodList {
    pub items: Vec<PodRecord>,
    pub resource_version: ResourceVersion,
}

/// The provider's view of one pod; owned by the provider.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProviderPodState {
    pub uid: PodUID,
    pub phase: PodPhase,
    pub containers: Vec<ContainerStatus>,
    pub start_time: Option<DateTime<Utc>>,
    pub pod_ip: Option<String>,
    pub message: Option<String>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize, StrumDisplay, EnumString)]
pub enum NodeConditionType {
    Ready,
    OutOfDisk,
    MemoryPressure,
    DiskPressure,
    NetworkUnavailable,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeCondition {
    pub condition_type: NodeConditionType,
    pub status: ConditionStatus,
    pub reason: String,
    pub message: String,
    pub last_heartbeat_time: DateTime<Utc>,
    pub last_transition_time: DateTime<Utc>,
}

impl NodeCondition {
    pub fn new(
        condition_type: NodeConditionType,
        status: ConditionStatus,
        reason: &str,
        message: &str,
    ) -> Self {
        let now = Utc::now();
        NodeCondition {
            condition_type,
            status,
            reason: reason.to_string(),
            message: message.to_string(),
            last_heartbeat_time: now,
            last_transition_time: now,
        }
    }

    fn same_state(&self, other: &NodeCondition) -> bool {
        self.condition_type == other.condition_type
            && self.status == other.status
            && self.reason == other.reason
            && self.message == other.message
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize, StrumDisplay, EnumString)]
pub enum NodeAddressType {
    InternalIP,
    ExternalIP,
    Hostname,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeAddress {
    pub address_type: NodeAddressType,
    pub address: String,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeDescriptor {
    pub name: String,
    pub capacity: ResourceList,
    pub allocatable: ResourceList,
    pub operating_system: String,
    pub addresses: Vec<NodeAddress>,
    pub conditions: Vec<NodeCondition>,
    pub daemon_port: u16,
}

impl NodeDescriptor {
    /// Compares everything the control plane cares about, ignoring heartbeat and transition times.
    pub fn same_status(&self, other: &NodeDescriptor) -> bool {
        self.name == other.name
            && self.capacity == other.capacity
            && self.allocatable == other.allocatable
            && self.operating_system == other.operating_system
            && self.addresses == other.addresses
            && self.daemon_port == other.daemon_port
            && self.conditions.len() == other.conditions.len()
            && self
                .conditions
                .iter()
                .zip(other.conditions.iter())
                .all(|(a, b)| a.same_state(b))
    }

    /// Keeps the transition time of conditions whose state did not change since `previous`.
    pub fn carry_transitions(&mut self, previous: &NodeDescriptor) {
        for cond in self.conditions.iter_mut() {
            if let Some(prev) = previous
                .conditions
                .iter()
                .find(|p| p.condition_type == cond.condition_type)
            {
                if prev.status == cond.status {
                    cond.last_transition_time = prev.last_transition_time;
                }
            }
        }
    }

    pub fn condition(&self, condition_type: NodeConditionType) -> Option<&NodeCondition> {
        self.conditions
            .iter()
            .find(|c| c.condition_type == condition_type)
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Lease {
    pub holder_identity: String,
    pub renew_time: DateTime<Utc>,
    pub duration_secs: u32,
}

impl Lease {
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now > self.renew_time + Duration::seconds(self.duration_secs as i64)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize, StrumDisplay, EnumString)]
pub enum EventType {
    Normal,
    Warning,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Event {
    pub key: ReconcileKey,
    pub uid: PodUID,
    pub event_type: EventType,
    pub reason: String,
    pub message: String,
    pub timestamp: DateTime<Utc>,
}

impl Event {
    pub fn new(pod: &PodRecord, event_type: EventType, reason: &str, message: String) -> Self {
        Event {
            key: pod.key(),
            uid: pod.uid.clone(),
            event_type,
            reason: reason.to_string(),
            message,
            timestamp: Utc::now(),
        }
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CpuStats {
    pub time: Option<DateTime<Utc>>,
    pub usage_nano_cores: Option<u64>,
    pub usage_core_nano_seconds: Option<u64>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MemoryStats {
    pub time: Option<DateTime<Utc>>,
    pub usage_bytes: Option<u64>,
    pub working_set_bytes: Option<u64>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeStats {
    pub node_name: String,
    pub start_time: Option<DateTime<Utc>>,
    pub cpu: Option<CpuStats>,
    pub memory: Option<MemoryStats>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PodReference {
    pub name: String,
    pub namespace: String,
    pub uid: PodUID,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ContainerStats {
    pub name: String,
    pub start_time: Option<DateTime<Utc>>,
    pub cpu: Option<CpuStats>,
    pub memory: Option<MemoryStats>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PodStats {
    pub pod_ref: PodReference,
    pub start_time: Option<DateTime<Utc>>,
    pub containers: Vec<ContainerStats>,
    pub cpu: Option<CpuStats>,
    pub memory: Option<MemoryStats>,
}

/// The node-level and per-pod resource usage served by the stats endpoint.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Summary {
    pub node: NodeStats,
    pub pods: Vec<PodStats>,
}

impl Summary {
    pub fn find_pod(&self, namespace: &str, name: &str, uid: &str) -> Option<&PodStats> {
        self.pods.iter().find(|p| {
            p.pod_ref.namespace == namespace && p.pod_ref.name == name && p.pod_ref.uid == uid
        })
    }
}

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

pub mod mock;

use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::mpsc::UnboundedSender;

use common::apis::{
    NodeAddress, NodeAddressType, NodeCondition, PodRecord, ProviderPodState, ReconcileKey,
    ResourceList, Summary,
};
use common::ctx::VkContext;
use common::VkError;

use self::mock::MockProvider;

pub type ProviderPtr = Arc<dyn Provider>;

/// Receives the key of every pod whose provider-side state changed.
pub type PodNotifier = UnboundedSender<ReconcileKey>;

/// The capability interface a backend implements to run the pods of this node.
///
/// The core never assumes synchronous completion: `create_pod` may return while the
/// workload is still materializing, its state converges through `get_pod_status`.
#[async_trait]
pub trait Provider: Send + Sync + 'static {
    /// Idempotent; creating an existing pod refreshes it to the given spec.
    async fn create_pod(&self, pod: &PodRecord) -> Result<(), VkError>;

    /// Applies a changed spec in place; `NotSupported` makes the caller delete and recreate.
    async fn update_pod(&self, pod: &PodRecord) -> Result<(), VkError>;

    /// Idempotent; deleting an absent pod succeeds.
    async fn delete_pod(&self, key: &ReconcileKey) -> Result<(), VkError>;

    /// `NotFound` when the backend does not run the pod.
    async fn get_pod_status(&self, key: &ReconcileKey) -> Result<ProviderPodState, VkError>;

    async fn list_pods(&self) -> Result<Vec<ReconcileKey>, VkError>;

    fn capacity(&self) -> ResourceList;

    fn node_conditions(&self) -> Vec<NodeCondition>;

    fn node_addresses(&self) -> Vec<NodeAddress>;

    fn operating_system(&self) -> String;

    fn node_daemon_port(&self) -> u16;

    async fn stats_summary(&self) -> Result<Summary, VkError> {
        Err(VkError::NotSupported("stats summary".to_string()))
    }

    async fn container_logs(
        &self,
        _key: &ReconcileKey,
        _container: &str,
        _tail: Option<usize>,
    ) -> Result<String, VkError> {
        Err(VkError::NotSupported("container logs".to_string()))
    }

    /// Returns false when the backend cannot push status changes.
    fn notify_pods(&self, _notifier: PodNotifier) -> bool {
        false
    }
}

/// Everything a provider is constructed from; fixed for the process lifetime.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InitConfig {
    pub config_path: Option<String>,
    pub node_name: String,
    pub operating_system: String,
    pub internal_ip: String,
    pub daemon_port: u16,
}

impl From<&VkContext> for InitConfig {
    fn from(ctx: &VkContext) -> Self {
        InitConfig {
            config_path: ctx.provider.config.clone(),
            node_name: ctx.node.name.clone(),
            operating_system: ctx.node.operating_system.clone(),
            internal_ip: ctx.node.internal_ip.clone(),
            daemon_port: ctx.node.daemon_port,
        }
    }
}

impl InitConfig {
    pub fn default_addresses(&self) -> Vec<NodeAddress> {
        vec![NodeAddress {
            address_type: NodeAddressType::InternalIP,
            address: self.internal_ip.clone(),
        }]
    }
}

pub type InitFn = Box<dyn Fn(InitConfig) -> Result<ProviderPtr, VkError> + Send + Sync>;

/// The ordered table of named provider constructors.
pub struct Store {
    providers: Vec<(String, InitFn)>,
}

impl Default for Store {
    fn default() -> Self {
        Self::new()
    }
}

impl Store {
    pub fn new() -> Self {
        Store { providers: vec![] }
    }

    pub fn with_defaults() -> Result<Self, VkError> {
        let mut store = Store::new();
        register_mock(&mut store)?;
        Ok(store)
    }

    pub fn register<F>(&mut self, name: &str, init: F) -> Result<(), VkError>
    where
        F: Fn(InitConfig) -> Result<ProviderPtr, VkError> + Send + Sync + 'static,
    {
        if self.exists(name) {
            return Err(VkError::InvalidConfig(format!(
                "provider <{name}> was already registered"
            )));
        }

        self.providers.push((name.to_string(), Box::new(init)));
        Ok(())
    }

    pub fn exists(&self, name: &str) -> bool {
        self.providers.iter().any(|(n, _)| n == name)
    }

    pub fn get(&self, name: &str) -> Option<&InitFn> {
        self.providers
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, init)| init)
    }

    pub fn names(&self) -> Vec<String> {
        self.providers.iter().map(|(n, _)| n.clone()).collect()
    }

    pub fn new_provider(&self, name: &str, cfg: InitConfig) -> Result<ProviderPtr, VkError> {
        let init = self.get(name).ok_or(VkError::InvalidConfig(format!(
            "provider <{name}> not found, available providers: {:?}",
            self.names()
        )))?;

        tracing::info!("Create provider <{name}> for node <{}>", cfg.node_name);
        init(cfg)
    }
}

fn register_mock(store: &mut Store) -> Result<(), VkError> {
    store.register("mock", |cfg| {
        let provider = MockProvider::new(
            cfg.config_path.as_deref(),
            &cfg.node_name,
            &cfg.operating_system,
            &cfg.internal_ip,
            cfg.daemon_port,
        )?;
        Ok(Arc::new(provider) as ProviderPtr)
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn new_test_config() -> InitConfig {
        InitConfig {
            config_path: None,
            node_name: "vk-test".to_string(),
            operating_system: "Linux".to_string(),
            internal_ip: "10.0.0.1".to_string(),
            daemon_port: 10250,
        }
    }

    #[test]
    fn test_store_with_defaults() -> Result<(), VkError> {
        let mut store = Store::with_defaults()?;
        assert_eq!(store.names(), vec!["mock".to_string()]);
        assert!(matches!(
            register_mock(&mut store),
            Err(VkError::InvalidConfig(_))
        ));

        let provider = store.new_provider("mock", new_test_config())?;
        assert_eq!(provider.operating_system(), "Linux");
        assert_eq!(provider.node_daemon_port(), 10250);

        Ok(())
    }

    #[test]
    fn test_store_unknown_provider() -> Result<(), VkError> {
        let store = Store::with_defaults()?;
        let res = store.new_provider("aci", new_test_config());
        assert!(matches!(res, Err(VkError::InvalidConfig(_))));

        Ok(())
    }

    #[test]
    fn test_store_duplicated_provider() -> Result<(), VkError> {
        let mut store = Store::with_defaults()?;
        let res = store.register("mock", |_| {
            Err(VkError::NotSupported("duplicated".to_string()))
        });
        assert!(matches!(res, Err(VkError::InvalidConfig(_))));

        Ok(())
    }

    #[test]
    fn test_store_keeps_registration_order() -> Result<(), VkError> {
        let mut store = Store::new();
        for name in ["zeta", "alpha", "mock"] {
            store.register(name, |_| Err(VkError::NotSupported("test".to_string())))?;
        }
        assert_eq!(store.names(), vec!["zeta", "alpha", "mock"]);

        Ok(())
    }
}

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

pub mod apis;
pub mod ctx;

use thiserror::Error;
use time::macros::format_description;
use tracing_subscriber::filter::{FromEnvError, LevelFilter};
use tracing_subscriber::fmt::time::LocalTime;

use stdng::LockError;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum VkError {
    #[error("'{0}' not found")]
    NotFound(String),

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("{0}")]
    Network(String),

    #[error("'{0}' is unavailable")]
    Unavailable(String),

    #[error("'{0}' is expired")]
    Expired(String),

    #[error("{0}")]
    Internal(String),

    #[error("invalid spec: {0}")]
    InvalidSpec(String),

    #[error("'{0}' is not supported")]
    NotSupported(String),

    #[error("{0}")]
    InvalidConfig(String),

    #[error("{0}")]
    InvalidState(String),
}

impl VkError {
    /// Transient errors are retried with backoff and never dropped.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            VkError::Conflict(_)
                | VkError::Network(_)
                | VkError::Unavailable(_)
                | VkError::Expired(_)
                | VkError::Internal(_)
        )
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, VkError::NotFound(_))
    }

    pub fn is_not_supported(&self) -> bool {
        matches!(self, VkError::NotSupported(_))
    }

    pub fn is_conflict(&self) -> bool {
        matches!(self, VkError::Conflict(_))
    }
}

impl From<LockError> for VkError {
    fn from(value: LockError) -> Self {
        VkError::Internal(value.to_string())
    }
}

impl From<std::io::Error> for VkError {
    fn from(value: std::io::Error) -> Self {
        VkError::Internal(value.to_string())
    }
}

impl From<serde_yaml::Error> for VkError {
    fn from(value: serde_yaml::Error) -> Self {
        VkError::InvalidConfig(value.to_string())
    }
}

impl From<FromEnvError> for VkError {
    fn from(value: FromEnvError) -> Self {
        VkError::InvalidConfig(value.to_string())
    }
}

pub const DEFAULT_VK_CONF: &str = "vk-conf.yaml";

pub fn init_logger() -> Result<(), VkError> {
    let filter = tracing_subscriber::EnvFilter::builder()
        .with_default_directive(LevelFilter::INFO.into())
        .from_env()?;

    let time_format = LocalTime::new(format_description!(
        "[hour repr:24]:[minute]:[second].[subsecond digits:3]"
    ));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_timer(time_format)
        .with_ansi(false)
        .with_target(true)
        .init();

    Ok(())
}

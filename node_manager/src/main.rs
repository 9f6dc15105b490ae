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

use clap::Parser;
use tokio_util::sync::CancellationToken;

use common::ctx::VkContext;
use common::VkError;

use vk_node::client;
use vk_node::manager::NodeManager;
use vk_node::provider::Store;

#[derive(Parser)]
#[command(name = "virtual-kubelet")]
#[command(author = "XFLOPS <support@xflops.io>")]
#[command(version = "0.1.0")]
#[command(about = "Virtual Kubelet node agent", long_about = None)]
struct Cli {
    #[arg(long)]
    vk_conf: Option<String>,
    #[arg(long)]
    nodename: Option<String>,
    #[arg(long)]
    provider: Option<String>,
    #[arg(long)]
    provider_config: Option<String>,
    #[arg(long)]
    os: Option<String>,
    #[arg(long)]
    internal_ip: Option<String>,
    #[arg(long)]
    daemon_port: Option<u16>,
    #[arg(long)]
    workers: Option<usize>,
}

impl Cli {
    fn apply(self, ctx: &mut VkContext) {
        if let Some(name) = self.nodename {
            ctx.node.name = name;
        }
        if let Some(provider) = self.provider {
            ctx.provider.name = provider;
        }
        if let Some(config) = self.provider_config {
            ctx.provider.config = Some(config);
        }
        if let Some(os) = self.os {
            ctx.node.operating_system = os;
        }
        if let Some(ip) = self.internal_ip {
            ctx.node.internal_ip = ip;
        }
        if let Some(port) = self.daemon_port {
            ctx.node.daemon_port = port;
        }
        if let Some(workers) = self.workers {
            ctx.controller.workers = workers;
        }
    }
}

#[tokio::main]
async fn main() -> Result<(), VkError> {
    common::init_logger()?;

    let cli = Cli::parse();
    let mut ctx = match cli.vk_conf.clone() {
        Some(fp) => VkContext::from_file(Some(fp))?,
        None => VkContext::from_file(None).unwrap_or_else(|e| {
            tracing::warn!("No default configuration loaded ({e}), use the defaults.");
            VkContext::default()
        }),
    };
    cli.apply(&mut ctx);
    ctx.validate()?;

    tracing::info!("virtual-kubelet is starting with <{ctx}> ...");

    let store = Store::with_defaults()?;
    let client = client::new_ptr(&ctx)?;
    let manager = match NodeManager::new(&ctx, client, &store) {
        Ok(manager) => manager,
        Err(e) => {
            tracing::error!("Failed to build node <{}>: {e}", ctx.node.name);
            return Err(e);
        }
    };

    let cancel = CancellationToken::new();
    {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            if let Err(e) = tokio::signal::ctrl_c().await {
                tracing::error!("Failed to listen for Ctrl-C: {e}");
                return;
            }
            tracing::info!("Received Ctrl-C, shutting down.");
            cancel.cancel();
        });
    }

    if let Err(e) = manager.run(cancel).await {
        tracing::error!("Node <{}> exited with error: {e}", ctx.node.name);
        return Err(e);
    }

    Ok(())
}

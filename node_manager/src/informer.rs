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

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use tokio::time::{sleep, Interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

use common::apis::{PodRecord, ReconcileKey, ResourceVersion};
use common::VkError;
use stdng::logs::TraceFn;
use stdng::{lock_ptr, new_ptr, trace_fn, MutexPtr};

use crate::client::{WatchEvent, WatchStream};
use crate::ctx::NodeContextPtr;
use crate::workqueue::WorkQueue;

pub type PodInformerPtr = Arc<PodInformer>;

enum WatchExit {
    Cancelled,
    Broken(ResourceVersion),
    Expired,
}

/// The local mirror of the pods assigned to this node; written only by the watch loop.
pub struct PodInformer {
    ctx: NodeContextPtr,
    cache: MutexPtr<HashMap<ReconcileKey, PodRecord>>,
    queue: WorkQueue<ReconcileKey>,
    synced: AtomicBool,
}

impl PodInformer {
    pub fn new(ctx: NodeContextPtr, queue: WorkQueue<ReconcileKey>) -> PodInformerPtr {
        Arc::new(PodInformer {
            ctx,
            cache: new_ptr(HashMap::new()),
            queue,
            synced: AtomicBool::new(false),
        })
    }

    pub fn get(&self, key: &ReconcileKey) -> Option<PodRecord> {
        match lock_ptr!(self.cache) {
            Ok(cache) => cache.get(key).cloned(),
            Err(e) => {
                tracing::error!("Failed to read pod cache: {e}");
                None
            }
        }
    }

    pub fn list(&self) -> Vec<PodRecord> {
        lock_ptr!(self.cache)
            .map(|cache| cache.values().cloned().collect())
            .unwrap_or_default()
    }

    pub fn keys(&self) -> Vec<ReconcileKey> {
        lock_ptr!(self.cache)
            .map(|cache| cache.keys().cloned().collect())
            .unwrap_or_default()
    }

    /// True once the first list completed.
    pub fn has_synced(&self) -> bool {
        self.synced.load(Ordering::SeqCst)
    }

    pub async fn run(self: Arc<Self>, cancel: CancellationToken) -> Result<(), VkError> {
        let backoff_base = self.ctx.controller.backoff_base;
        let backoff_max = self.ctx.controller.backoff_max;
        let mut backoff = backoff_base;

        let mut resync = tokio::time::interval(self.ctx.controller.resync_interval);
        resync.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // The first tick completes immediately.
        resync.tick().await;

        let mut last_rv: Option<ResourceVersion> = None;

        loop {
            let rv = match last_rv {
                Some(rv) => rv,
                None => match self.relist().await {
                    Ok(rv) => rv,
                    Err(e) => {
                        tracing::warn!("Failed to list pods of node <{}>: {e}", self.ctx.node_name);
                        if !Self::wait(&cancel, backoff).await {
                            return Ok(());
                        }
                        backoff = (backoff * 2).min(backoff_max);
                        continue;
                    }
                },
            };

            match self.ctx.client.watch_pods(&self.ctx.node_name, rv).await {
                Ok(stream) => match self.consume(stream, rv, &cancel, &mut resync).await? {
                    WatchExit::Cancelled => return Ok(()),
                    WatchExit::Expired => {
                        tracing::info!("Watch of node <{}> expired, relist pods.", self.ctx.node_name);
                        last_rv = None;
                        backoff = backoff_base;
                        continue;
                    }
                    WatchExit::Broken(rv) => {
                        backoff = backoff_base;
                        last_rv = Some(rv);
                    }
                },
                Err(VkError::Expired(_)) => {
                    last_rv = None;
                    continue;
                }
                Err(e) => {
                    tracing::warn!("Failed to watch pods of node <{}>: {e}", self.ctx.node_name);
                    last_rv = Some(rv);
                }
            }

            if !Self::wait(&cancel, backoff).await {
                return Ok(());
            }
            backoff = (backoff * 2).min(backoff_max);
        }
    }

    /// Sleeps for `backoff`; false when cancelled meanwhile.
    async fn wait(cancel: &CancellationToken, backoff: Duration) -> bool {
        tokio::select! {
            _ = cancel.cancelled() => false,
            _ = sleep(backoff) => true,
        }
    }

    async fn consume(
        &self,
        mut stream: WatchStream,
        mut rv: ResourceVersion,
        cancel: &CancellationToken,
        resync: &mut Interval,
    ) -> Result<WatchExit, VkError> {
        loop {
            tokio::select! {
                _ = cancel.cancelled() => return Ok(WatchExit::Cancelled),
                _ = resync.tick() => self.resync().await?,
                event = stream.next() => match event {
                    Some(Ok(event)) => {
                        rv = rv.max(event.pod().resource_version);
                        self.handle_event(event)?;
                    }
                    Some(Err(VkError::Expired(_))) => return Ok(WatchExit::Expired),
                    Some(Err(e)) => {
                        tracing::warn!("Watch of node <{}> failed: {e}", self.ctx.node_name);
                        return Ok(WatchExit::Broken(rv));
                    }
                    None => {
                        tracing::debug!("Watch of node <{}> was closed.", self.ctx.node_name);
                        return Ok(WatchExit::Broken(rv));
                    }
                }
            }
        }
    }

    /// Replaces the cache with a fresh list; keys that vanished are enqueued for cleanup.
    pub(crate) async fn relist(&self) -> Result<ResourceVersion, VkError> {
        trace_fn!("PodInformer::relist");

        let list = self.ctx.client.list_pods(&self.ctx.node_name).await?;
        let fresh: HashMap<ReconcileKey, PodRecord> =
            list.items.into_iter().map(|pod| (pod.key(), pod)).collect();

        let vanished: Vec<ReconcileKey> = {
            let mut cache = lock_ptr!(self.cache)?;
            let vanished = cache
                .keys()
                .filter(|key| !fresh.contains_key(key))
                .cloned()
                .collect();
            *cache = fresh.clone();
            vanished
        };
        self.synced.store(true, Ordering::SeqCst);

        for key in vanished.iter().chain(fresh.keys()) {
            self.queue.add(key.clone())?;
        }

        tracing::debug!(
            "Listed {} pods of node <{}> at version {}.",
            fresh.len(),
            self.ctx.node_name,
            list.resource_version
        );

        Ok(list.resource_version)
    }

    fn handle_event(&self, event: WatchEvent) -> Result<(), VkError> {
        let key = event.pod().key();
        let changed = {
            let mut cache = lock_ptr!(self.cache)?;
            match event {
                WatchEvent::Added(pod) | WatchEvent::Modified(pod) => match cache.get(&key) {
                    Some(cached)
                        if cached.uid == pod.uid
                            && cached.resource_version >= pod.resource_version =>
                    {
                        false
                    }
                    _ => {
                        cache.insert(key.clone(), pod);
                        true
                    }
                },
                WatchEvent::Deleted(pod) => match cache.get(&key) {
                    Some(cached) if cached.uid == pod.uid => {
                        cache.remove(&key);
                        true
                    }
                    // A delete of a former incarnation of the same name.
                    _ => false,
                },
            }
        };

        if changed {
            self.queue.add(key)?;
        }

        Ok(())
    }

    /// Re-enqueues every known key; once synced, also the keys only the provider runs.
    async fn resync(&self) -> Result<(), VkError> {
        trace_fn!("PodInformer::resync");

        let known: HashSet<ReconcileKey> = self.keys().into_iter().collect();
        for key in &known {
            self.queue.add(key.clone())?;
        }

        if !self.has_synced() {
            return Ok(());
        }

        match self.ctx.provider.list_pods().await {
            Ok(running) => {
                for key in running.into_iter().filter(|k| !known.contains(k)) {
                    tracing::debug!("Pod <{key}> is only running in provider, clean it up.");
                    self.queue.add(key)?;
                }
            }
            Err(e) => tracing::warn!("Failed to list provider pods: {e}"),
        }

        Ok(())
    }
}

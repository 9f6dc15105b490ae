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

use std::collections::{HashMap, HashSet, VecDeque};
use std::hash::Hash;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Notify;

use common::VkError;
use stdng::{lock_ptr, new_ptr, MutexPtr};

#[derive(PartialEq, Eq, Debug, Clone, Copy)]
enum WorkQueueState {
    Open,
    ShuttingDown,
}

/// A set-backed queue of keys: a key is queued at most once and processed by at most one
/// worker at a time; a key added while it is processing is queued again by `done`.
pub struct WorkQueue<K> {
    queue: MutexPtr<WorkQueueImpl<K>>,
    notify: Arc<Notify>,
    backoff_base: Duration,
    backoff_max: Duration,
}

impl<K> Clone for WorkQueue<K> {
    fn clone(&self) -> Self {
        WorkQueue {
            queue: self.queue.clone(),
            notify: self.notify.clone(),
            backoff_base: self.backoff_base,
            backoff_max: self.backoff_max,
        }
    }
}

impl<K> WorkQueue<K>
where
    K: Clone + Eq + Hash + Send + 'static,
{
    pub fn new(backoff_base: Duration, backoff_max: Duration) -> Self {
        WorkQueue {
            queue: new_ptr(WorkQueueImpl::new()),
            notify: Arc::new(Notify::new()),
            backoff_base,
            backoff_max,
        }
    }

    pub fn add(&self, key: K) -> Result<(), VkError> {
        let queued = {
            let mut queue = lock_ptr!(self.queue)?;
            queue.add(key)
        };

        if queued {
            self.notify.notify_one();
        }

        Ok(())
    }

    /// Adds the key once `delay` elapsed; the key is not pending in the meantime.
    pub fn add_after(&self, key: K, delay: Duration) -> Result<(), VkError> {
        if delay.is_zero() {
            return self.add(key);
        }

        let queue = self.clone();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            if let Err(e) = queue.add(key) {
                tracing::error!("Failed to add delayed key: {e}");
            }
        });

        Ok(())
    }

    /// Adds the key after its per-key exponential backoff; returns the delay.
    pub fn add_rate_limited(&self, key: K) -> Result<Duration, VkError> {
        let delay = {
            let mut queue = lock_ptr!(self.queue)?;
            let failures = queue.failures.entry(key.clone()).or_insert(0);
            *failures = failures.saturating_add(1);
            backoff(self.backoff_base, self.backoff_max, *failures)
        };

        self.add_after(key, delay)?;
        Ok(delay)
    }

    /// Resets the backoff of the key.
    pub fn forget(&self, key: &K) -> Result<(), VkError> {
        let mut queue = lock_ptr!(self.queue)?;
        queue.failures.remove(key);
        Ok(())
    }

    pub fn num_requeues(&self, key: &K) -> u32 {
        lock_ptr!(self.queue)
            .map(|q| q.failures.get(key).copied().unwrap_or(0))
            .unwrap_or(0)
    }

    /// Waits for the next key; `None` once the queue is shut down and drained.
    pub async fn get(&self) -> Option<K> {
        loop {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            {
                let mut queue = match lock_ptr!(self.queue) {
                    Ok(queue) => queue,
                    Err(e) => {
                        tracing::error!("Failed to lock work queue: {e}");
                        return None;
                    }
                };

                if let Some(key) = queue.pop() {
                    return Some(key);
                }
                if queue.is_shutting_down() {
                    return None;
                }
            }

            notified.await;
        }
    }

    /// Marks the key as processed; it is queued again if it was added meanwhile.
    pub fn done(&self, key: &K) -> Result<(), VkError> {
        let queued = {
            let mut queue = lock_ptr!(self.queue)?;
            queue.done(key)
        };

        if queued {
            self.notify.notify_one();
        }

        Ok(())
    }

    pub fn len(&self) -> usize {
        lock_ptr!(self.queue).map(|q| q.queue.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_processing(&self, key: &K) -> bool {
        lock_ptr!(self.queue)
            .map(|q| q.processing.contains(key))
            .unwrap_or(false)
    }

    /// Stops accepting keys and wakes up every blocked `get`.
    pub fn shut_down(&self) -> Result<(), VkError> {
        {
            let mut queue = lock_ptr!(self.queue)?;
            queue.state = WorkQueueState::ShuttingDown;
        }

        self.notify.notify_waiters();
        Ok(())
    }

    pub fn is_shutting_down(&self) -> bool {
        lock_ptr!(self.queue)
            .map(|q| q.is_shutting_down())
            .unwrap_or(true)
    }
}

fn backoff(base: Duration, max: Duration, failures: u32) -> Duration {
    let exp = failures.saturating_sub(1).min(31);
    base.saturating_mul(1_u32 << exp).min(max)
}

struct WorkQueueImpl<K> {
    queue: VecDeque<K>,
    dirty: HashSet<K>,
    processing: HashSet<K>,
    failures: HashMap<K, u32>,
    state: WorkQueueState,
}

impl<K> WorkQueueImpl<K>
where
    K: Clone + Eq + Hash,
{
    fn new() -> Self {
        WorkQueueImpl {
            queue: VecDeque::new(),
            dirty: HashSet::new(),
            processing: HashSet::new(),
            failures: HashMap::new(),
            state: WorkQueueState::Open,
        }
    }

    fn is_shutting_down(&self) -> bool {
        self.state == WorkQueueState::ShuttingDown
    }

    fn add(&mut self, key: K) -> bool {
        if self.is_shutting_down() || self.dirty.contains(&key) {
            return false;
        }

        self.dirty.insert(key.clone());
        if self.processing.contains(&key) {
            return false;
        }

        self.queue.push_back(key);
        true
    }

    fn pop(&mut self) -> Option<K> {
        let key = self.queue.pop_front()?;
        self.dirty.remove(&key);
        self.processing.insert(key.clone());

        Some(key)
    }

    fn done(&mut self, key: &K) -> bool {
        self.processing.remove(key);
        if self.dirty.contains(key) {
            self.queue.push_back(key.clone());
            return true;
        }

        false
    }
}

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

pub mod logs;

use std::sync::Arc;
use thiserror::Error;

/// Returned by `lock_ptr!` when the mutex was poisoned by a panicking holder.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("failed to lock <{0}>")]
pub struct LockError(pub String);

pub type MutexPtr<T> = Arc<std::sync::Mutex<T>>;

pub fn new_ptr<T>(t: T) -> MutexPtr<T> {
    Arc::new(std::sync::Mutex::new(t))
}

#[macro_export]
macro_rules! lock_ptr {
    ( $mutex_arc:expr ) => {
        $mutex_arc
            .lock()
            .map_err(|_| $crate::LockError(stringify!($mutex_arc).to_string()))
    };
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lock_ptr() -> Result<(), LockError> {
        let ptr = new_ptr(vec![1, 2, 3]);
        {
            let mut v = lock_ptr!(ptr)?;
            v.push(4);
        }
        assert_eq!(lock_ptr!(ptr)?.len(), 4);

        Ok(())
    }

    #[test]
    fn test_lock_poisoned_ptr() {
        let ptr = new_ptr(0);
        let cloned = ptr.clone();
        let _ = std::thread::spawn(move || {
            let _guard = cloned.lock().unwrap();
            panic!("poison the mutex");
        })
        .join();

        let err = lock_ptr!(ptr).err();
        assert_eq!(err, Some(LockError("ptr".to_string())));
    }
}

//! Shared memory pools.
//!
//! A pool is an arena identified by a runtime-wide `m_uid`, with a byte
//! budget that channel allocations are charged against. Pools live in a
//! process-global registry so that any party holding a serialized
//! descriptor can attach to them.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, LazyLock, Mutex};
use thiserror::Error;

static REGISTRY: LazyLock<Mutex<HashMap<u64, Arc<PoolInner>>>> =
    LazyLock::new(|| Mutex::new(HashMap::new()));

#[derive(Debug, Error)]
pub enum PoolError {
    #[error("m_uid={0} already in use")]
    AlreadyExists(u64),
    #[error("m_uid={0} does not exist")]
    DoesNotExist(u64),
    #[error("m_uid={0} is destroyed")]
    Destroyed(u64),
    #[error("m_uid={m_uid} out of space: requested {requested}, available {available}")]
    OutOfSpace {
        m_uid: u64,
        requested: u64,
        available: u64,
    },
    #[error("bad pool descriptor: {0}")]
    BadDescriptor(String),
}

#[derive(Debug)]
struct PoolInner {
    m_uid: u64,
    name: String,
    size: u64,
    used: Mutex<u64>,
    destroyed: AtomicBool,
}

#[derive(Debug, Serialize, Deserialize)]
struct PoolDesc {
    m_uid: u64,
    name: String,
    size: u64,
}

/// Handle to a memory pool. Clones share the same arena.
#[derive(Debug, Clone)]
pub struct MemoryPool {
    inner: Arc<PoolInner>,
}

impl MemoryPool {
    /// Creates a pool and registers it under `m_uid`.
    ///
    /// # Arguments
    ///
    /// * `size` - Byte budget for channel allocations from this pool.
    /// * `name` - Human-readable pool name, carried in the descriptor.
    /// * `m_uid` - Runtime-wide pool id; must not be in use.
    ///
    /// # Errors
    ///
    /// Returns [`PoolError::AlreadyExists`] if `m_uid` is already bound in
    /// this process.
    pub fn create(size: u64, name: &str, m_uid: u64) -> Result<Self, PoolError> {
        let mut reg = REGISTRY.lock().unwrap();
        if reg.contains_key(&m_uid) {
            return Err(PoolError::AlreadyExists(m_uid));
        }
        let inner = Arc::new(PoolInner {
            m_uid,
            name: name.to_string(),
            size,
            used: Mutex::new(0),
            destroyed: AtomicBool::new(false),
        });
        reg.insert(m_uid, inner.clone());
        Ok(Self { inner })
    }

    /// Attaches to an existing pool from its serialized form.
    ///
    /// # Errors
    ///
    /// Returns an error if the descriptor does not parse, or if it names a
    /// pool this process does not know.
    pub fn attach(serialized: &[u8]) -> Result<Self, PoolError> {
        let desc: PoolDesc = serde_json::from_slice(serialized)
            .map_err(|e| PoolError::BadDescriptor(e.to_string()))?;
        let reg = REGISTRY.lock().unwrap();
        let inner = reg
            .get(&desc.m_uid)
            .ok_or(PoolError::DoesNotExist(desc.m_uid))?;
        Ok(Self {
            inner: inner.clone(),
        })
    }

    /// Serializes the pool for transport. Encode with
    /// [`crate::facts::b64_encode`] before putting it on the wire.
    pub fn serialize(&self) -> Vec<u8> {
        let desc = PoolDesc {
            m_uid: self.inner.m_uid,
            name: self.inner.name.clone(),
            size: self.inner.size,
        };
        serde_json::to_vec(&desc).expect("pool descriptor serialization")
    }

    /// Unregisters and invalidates the pool. Outstanding channel memory is
    /// abandoned with it.
    pub fn destroy(&self) -> Result<(), PoolError> {
        if self.inner.destroyed.swap(true, Ordering::SeqCst) {
            return Err(PoolError::Destroyed(self.inner.m_uid));
        }
        REGISTRY.lock().unwrap().remove(&self.inner.m_uid);
        Ok(())
    }

    pub fn m_uid(&self) -> u64 {
        self.inner.m_uid
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    pub fn is_destroyed(&self) -> bool {
        self.inner.destroyed.load(Ordering::SeqCst)
    }

    /// Charges a channel allocation against the budget.
    pub(crate) fn alloc(&self, bytes: u64) -> Result<(), PoolError> {
        if self.is_destroyed() {
            return Err(PoolError::Destroyed(self.inner.m_uid));
        }
        let mut used = self.inner.used.lock().unwrap();
        let available = self.inner.size - *used;
        if bytes > available {
            return Err(PoolError::OutOfSpace {
                m_uid: self.inner.m_uid,
                requested: bytes,
                available,
            });
        }
        *used += bytes;
        Ok(())
    }

    /// Refunds a channel allocation.
    pub(crate) fn free(&self, bytes: u64) {
        let mut used = self.inner.used.lock().unwrap();
        *used = used.saturating_sub(bytes);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::facts::{b64_decode, b64_encode};

    mod create {
        use super::*;

        #[test]
        fn duplicate_m_uid_fails() {
            let pool = MemoryPool::create(1 << 20, "t-pool-dup", 900_001).unwrap();
            assert!(matches!(
                MemoryPool::create(1 << 20, "t-pool-dup-2", 900_001),
                Err(PoolError::AlreadyExists(900_001))
            ));
            pool.destroy().unwrap();
        }

        #[test]
        fn same_m_uid_reusable_after_destroy() {
            let pool = MemoryPool::create(1 << 20, "t-pool-reuse", 900_002).unwrap();
            pool.destroy().unwrap();
            let pool = MemoryPool::create(1 << 20, "t-pool-reuse", 900_002).unwrap();
            pool.destroy().unwrap();
        }
    }

    mod attach {
        use super::*;

        #[test]
        fn by_descriptor() {
            let pool = MemoryPool::create(1 << 20, "t-pool-att", 900_003).unwrap();
            let desc = b64_encode(&pool.serialize());
            let attached = MemoryPool::attach(&b64_decode(&desc).unwrap()).unwrap();
            assert_eq!(attached.m_uid(), 900_003);
            assert_eq!(attached.name(), "t-pool-att");
            pool.destroy().unwrap();
        }

        #[test]
        fn unknown_pool_fails() {
            let desc = serde_json::to_vec(&PoolDesc {
                m_uid: 900_004,
                name: "gone".to_string(),
                size: 64,
            })
            .unwrap();
            assert!(matches!(
                MemoryPool::attach(&desc),
                Err(PoolError::DoesNotExist(900_004))
            ));
        }

        #[test]
        fn garbage_descriptor_fails() {
            assert!(matches!(
                MemoryPool::attach(b"not a descriptor"),
                Err(PoolError::BadDescriptor(_))
            ));
        }
    }

    mod destroy {
        use super::*;

        #[test]
        fn second_destroy_fails() {
            let pool = MemoryPool::create(1 << 20, "t-pool-dd", 900_005).unwrap();
            pool.destroy().unwrap();
            assert!(matches!(
                pool.destroy(),
                Err(PoolError::Destroyed(900_005))
            ));
        }
    }

    mod budget {
        use super::*;

        #[test]
        fn alloc_and_free() {
            let pool = MemoryPool::create(1024, "t-pool-budget", 900_006).unwrap();
            pool.alloc(1000).unwrap();
            assert!(matches!(
                pool.alloc(100),
                Err(PoolError::OutOfSpace {
                    requested: 100,
                    available: 24,
                    ..
                })
            ));
            pool.free(1000);
            pool.alloc(1024).unwrap();
            pool.destroy().unwrap();
        }
    }
}

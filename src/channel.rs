//! Reliable in-memory message channels.
//!
//! A channel is a FIFO of opaque byte frames identified by a runtime-wide
//! `c_uid` and allocated inside a [`MemoryPool`](crate::pool::MemoryPool).
//! Like pools, channels live in a process-global registry keyed by `c_uid`
//! so a serialized descriptor is enough to attach from anywhere in the
//! process. A zero-length frame is the conventional EOF sentinel; the
//! channel layer transports it like any other frame.
//!
//! Sends never block: a full channel is an error the caller decides how to
//! handle (the output path falls back to the launcher on any send failure).

use crate::pool::MemoryPool;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Condvar, LazyLock, Mutex, Weak};
use std::time::{Duration, Instant};
use thiserror::Error;

static REGISTRY: LazyLock<Mutex<HashMap<u64, Arc<ChanInner>>>> =
    LazyLock::new(|| Mutex::new(HashMap::new()));

/// Default frame capacity when the creation request does not specify one.
pub const DEFAULT_CAPACITY: usize = 128;
/// Default block size when the creation request does not specify one.
pub const DEFAULT_BLOCK_SIZE: usize = 256;

#[derive(Debug, Error)]
pub enum ChannelError {
    #[error("c_uid={0} already in use")]
    AlreadyExists(u64),
    #[error("c_uid={0} does not exist")]
    DoesNotExist(u64),
    #[error("c_uid={0} is destroyed")]
    Destroyed(u64),
    #[error("c_uid={0} is full")]
    Full(u64),
    #[error("poll timed out")]
    Timeout,
    #[error("bad channel descriptor: {0}")]
    BadDescriptor(String),
    #[error(transparent)]
    Pool(#[from] crate::pool::PoolError),
}

/// Outcome of polling a [`ChannelSet`] member.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PollEvent {
    /// A frame is available.
    In,
    /// The channel is gone; nothing will ever arrive.
    Nothing,
}

struct ChanState {
    frames: VecDeque<Vec<u8>>,
    destroyed: bool,
}

struct ChanInner {
    c_uid: u64,
    m_uid: u64,
    block_size: usize,
    capacity: usize,
    pool: MemoryPool,
    state: Mutex<ChanState>,
    recv_cond: Condvar,
    watchers: Mutex<Vec<Weak<SetShared>>>,
}

impl ChanInner {
    // Wakes every channel set watching this channel. Must be called without
    // the state lock held; see the ordering note on ChannelSet::poll.
    fn notify_watchers(&self) {
        let mut watchers = self.watchers.lock().unwrap();
        watchers.retain(|w| {
            let Some(shared) = w.upgrade() else {
                return false;
            };
            shared.ready.lock().unwrap().push_back(self.c_uid);
            shared.cond.notify_all();
            true
        });
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct ChanDesc {
    c_uid: u64,
    m_uid: u64,
}

/// Handle to a channel. Clones share the same queue; either side of an
/// exchange holds one.
#[derive(Clone)]
pub struct Channel {
    inner: Arc<ChanInner>,
}

impl std::fmt::Debug for Channel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Channel")
            .field("c_uid", &self.inner.c_uid)
            .field("m_uid", &self.inner.m_uid)
            .finish()
    }
}

impl Channel {
    /// Creates a channel inside `pool`, charging `block_size * capacity`
    /// against the pool budget, and registers it under `c_uid`.
    ///
    /// # Arguments
    ///
    /// * `pool` - The pool the channel's memory is accounted to.
    /// * `c_uid` - Runtime-wide channel id; must not be in use.
    /// * `capacity` - Maximum queued frames; [`DEFAULT_CAPACITY`] if `None`.
    /// * `block_size` - Allocation block size; [`DEFAULT_BLOCK_SIZE`] if
    ///   `None`.
    ///
    /// # Errors
    ///
    /// Returns [`ChannelError::AlreadyExists`] for a duplicate `c_uid`, or
    /// a [`ChannelError::Pool`] when the pool cannot cover the allocation.
    pub fn create(
        pool: &MemoryPool,
        c_uid: u64,
        capacity: Option<usize>,
        block_size: Option<usize>,
    ) -> Result<Self, ChannelError> {
        let capacity = capacity.unwrap_or(DEFAULT_CAPACITY);
        let block_size = block_size.unwrap_or(DEFAULT_BLOCK_SIZE);
        let mut reg = REGISTRY.lock().unwrap();
        if reg.contains_key(&c_uid) {
            return Err(ChannelError::AlreadyExists(c_uid));
        }
        pool.alloc((capacity * block_size) as u64)?;
        let inner = Arc::new(ChanInner {
            c_uid,
            m_uid: pool.m_uid(),
            block_size,
            capacity,
            pool: pool.clone(),
            state: Mutex::new(ChanState {
                frames: VecDeque::new(),
                destroyed: false,
            }),
            recv_cond: Condvar::new(),
            watchers: Mutex::new(Vec::new()),
        });
        reg.insert(c_uid, inner.clone());
        Ok(Self { inner })
    }

    /// Attaches to an existing channel from its serialized form.
    pub fn attach(serialized: &[u8]) -> Result<Self, ChannelError> {
        let desc: ChanDesc = serde_json::from_slice(serialized)
            .map_err(|e| ChannelError::BadDescriptor(e.to_string()))?;
        let reg = REGISTRY.lock().unwrap();
        let inner = reg
            .get(&desc.c_uid)
            .ok_or(ChannelError::DoesNotExist(desc.c_uid))?;
        Ok(Self {
            inner: inner.clone(),
        })
    }

    /// Serializes the channel for transport.
    pub fn serialize(&self) -> Vec<u8> {
        let desc = ChanDesc {
            c_uid: self.inner.c_uid,
            m_uid: self.inner.m_uid,
        };
        serde_json::to_vec(&desc).expect("channel descriptor serialization")
    }

    pub fn c_uid(&self) -> u64 {
        self.inner.c_uid
    }

    pub fn m_uid(&self) -> u64 {
        self.inner.m_uid
    }

    /// Enqueues one frame without blocking.
    pub fn send(&self, frame: &[u8]) -> Result<(), ChannelError> {
        {
            let mut state = self.inner.state.lock().unwrap();
            if state.destroyed {
                return Err(ChannelError::Destroyed(self.inner.c_uid));
            }
            if state.frames.len() >= self.inner.capacity {
                return Err(ChannelError::Full(self.inner.c_uid));
            }
            state.frames.push_back(frame.to_vec());
            self.inner.recv_cond.notify_one();
        }
        self.inner.notify_watchers();
        Ok(())
    }

    /// Dequeues one frame, waiting up to `timeout`.
    pub fn recv_timeout(&self, timeout: Duration) -> Result<Vec<u8>, ChannelError> {
        let deadline = Instant::now() + timeout;
        let mut state = self.inner.state.lock().unwrap();
        loop {
            if let Some(frame) = state.frames.pop_front() {
                return Ok(frame);
            }
            if state.destroyed {
                return Err(ChannelError::Destroyed(self.inner.c_uid));
            }
            let now = Instant::now();
            if now >= deadline {
                return Err(ChannelError::Timeout);
            }
            let (guard, _) = self
                .inner
                .recv_cond
                .wait_timeout(state, deadline - now)
                .unwrap();
            state = guard;
        }
    }

    /// Whether a frame is available within `timeout`.
    pub fn poll(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut state = self.inner.state.lock().unwrap();
        loop {
            if !state.frames.is_empty() {
                return true;
            }
            if state.destroyed {
                return false;
            }
            let now = Instant::now();
            if now >= deadline {
                return false;
            }
            let (guard, _) = self
                .inner
                .recv_cond
                .wait_timeout(state, deadline - now)
                .unwrap();
            state = guard;
        }
    }

    pub fn is_destroyed(&self) -> bool {
        self.inner.state.lock().unwrap().destroyed
    }

    /// Unregisters the channel, fails future sends, and refunds the pool
    /// allocation. Frames already delivered stay readable so a receiver
    /// can drain before it observes the teardown.
    pub fn destroy(&self) -> Result<(), ChannelError> {
        {
            let mut state = self.inner.state.lock().unwrap();
            if state.destroyed {
                return Err(ChannelError::Destroyed(self.inner.c_uid));
            }
            state.destroyed = true;
            self.inner.recv_cond.notify_all();
        }
        self.inner.notify_watchers();
        REGISTRY.lock().unwrap().remove(&self.inner.c_uid);
        self.inner
            .pool
            .free((self.inner.capacity * self.inner.block_size) as u64);
        Ok(())
    }
}

struct SetShared {
    ready: Mutex<VecDeque<u64>>,
    cond: Condvar,
}

/// Polls many channels with one timeout.
///
/// Built once per membership change; each member channel keeps a weak
/// reference back to the set and queues its `c_uid` whenever a frame
/// arrives or the channel is destroyed.
pub struct ChannelSet {
    shared: Arc<SetShared>,
    members: HashMap<u64, Channel>,
}

impl ChannelSet {
    pub fn new(channels: Vec<Channel>) -> Self {
        let shared = Arc::new(SetShared {
            ready: Mutex::new(VecDeque::new()),
            cond: Condvar::new(),
        });
        let mut members = HashMap::new();
        for ch in channels {
            ch.inner
                .watchers
                .lock()
                .unwrap()
                .push(Arc::downgrade(&shared));
            // Seed with anything already pending so construction does not
            // lose wakeups.
            let state = ch.inner.state.lock().unwrap();
            if !state.frames.is_empty() || state.destroyed {
                shared.ready.lock().unwrap().push_back(ch.c_uid());
            }
            drop(state);
            members.insert(ch.c_uid(), ch);
        }
        Self { shared, members }
    }

    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }

    /// Waits up to `timeout` for activity on any member. Returns which
    /// channel and whether data is readable ([`PollEvent::In`]) or the
    /// channel is dead ([`PollEvent::Nothing`]).
    pub fn poll(&self, timeout: Duration) -> Result<(u64, PollEvent), ChannelError> {
        let deadline = Instant::now() + timeout;
        // Ordering note: this takes the ready lock, then a member's state
        // lock. Senders never hold their state lock while queueing into the
        // ready list, so the two locks are never taken in the opposite
        // order.
        let mut ready = self.shared.ready.lock().unwrap();
        loop {
            while let Some(c_uid) = ready.pop_front() {
                let Some(ch) = self.members.get(&c_uid) else {
                    continue;
                };
                let state = ch.inner.state.lock().unwrap();
                if !state.frames.is_empty() {
                    return Ok((c_uid, PollEvent::In));
                }
                if state.destroyed {
                    return Ok((c_uid, PollEvent::Nothing));
                }
                // Already drained by a racing reader; stale entry.
            }
            let now = Instant::now();
            if now >= deadline {
                return Err(ChannelError::Timeout);
            }
            let (guard, _) = self
                .shared
                .cond
                .wait_timeout(ready, deadline - now)
                .unwrap();
            ready = guard;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_pool(m_uid: u64) -> MemoryPool {
        MemoryPool::create(1 << 20, "t-chan-pool", m_uid).unwrap()
    }

    mod create {
        use super::*;

        #[test]
        fn duplicate_c_uid_fails() {
            let pool = test_pool(910_001);
            let ch = Channel::create(&pool, 910_101, None, None).unwrap();
            assert!(matches!(
                Channel::create(&pool, 910_101, None, None),
                Err(ChannelError::AlreadyExists(910_101))
            ));
            ch.destroy().unwrap();
            pool.destroy().unwrap();
        }

        #[test]
        fn charges_the_pool() {
            let pool = MemoryPool::create(1024, "t-chan-small", 910_002).unwrap();
            let ch = Channel::create(&pool, 910_102, Some(4), Some(256)).unwrap();
            assert!(matches!(
                Channel::create(&pool, 910_103, Some(4), Some(256)),
                Err(ChannelError::Pool(_))
            ));
            ch.destroy().unwrap();
            // Refunded: the same allocation fits again.
            let ch = Channel::create(&pool, 910_103, Some(4), Some(256)).unwrap();
            ch.destroy().unwrap();
            pool.destroy().unwrap();
        }
    }

    mod send_recv {
        use super::*;

        #[test]
        fn fifo_order() {
            let pool = test_pool(910_003);
            let ch = Channel::create(&pool, 910_104, None, None).unwrap();
            ch.send(b"one").unwrap();
            ch.send(b"two").unwrap();
            assert_eq!(ch.recv_timeout(Duration::ZERO).unwrap(), b"one");
            assert_eq!(ch.recv_timeout(Duration::ZERO).unwrap(), b"two");
            assert!(matches!(
                ch.recv_timeout(Duration::ZERO),
                Err(ChannelError::Timeout)
            ));
            ch.destroy().unwrap();
            pool.destroy().unwrap();
        }

        #[test]
        fn empty_frame_travels() {
            let pool = test_pool(910_004);
            let ch = Channel::create(&pool, 910_105, None, None).unwrap();
            ch.send(b"").unwrap();
            assert_eq!(ch.recv_timeout(Duration::ZERO).unwrap(), Vec::<u8>::new());
            ch.destroy().unwrap();
            pool.destroy().unwrap();
        }

        #[test]
        fn full_channel_rejects() {
            let pool = test_pool(910_005);
            let ch = Channel::create(&pool, 910_106, Some(2), None).unwrap();
            ch.send(b"a").unwrap();
            ch.send(b"b").unwrap();
            assert!(matches!(ch.send(b"c"), Err(ChannelError::Full(910_106))));
            ch.destroy().unwrap();
            pool.destroy().unwrap();
        }

        #[test]
        fn send_after_destroy_fails() {
            let pool = test_pool(910_006);
            let ch = Channel::create(&pool, 910_107, None, None).unwrap();
            let peer = Channel::attach(&ch.serialize()).unwrap();
            ch.destroy().unwrap();
            assert!(matches!(
                peer.send(b"x"),
                Err(ChannelError::Destroyed(910_107))
            ));
            pool.destroy().unwrap();
        }

        #[test]
        fn recv_wakes_on_cross_thread_send() {
            let pool = test_pool(910_007);
            let ch = Channel::create(&pool, 910_108, None, None).unwrap();
            let peer = Channel::attach(&ch.serialize()).unwrap();
            let sender = std::thread::spawn(move || {
                std::thread::sleep(Duration::from_millis(20));
                peer.send(b"late").unwrap();
            });
            assert_eq!(
                ch.recv_timeout(Duration::from_secs(2)).unwrap(),
                b"late"
            );
            sender.join().unwrap();
            ch.destroy().unwrap();
            pool.destroy().unwrap();
        }
    }

    mod attach {
        use super::*;

        #[test]
        fn attach_then_second_destroy_fails() {
            let pool = test_pool(910_008);
            let ch = Channel::create(&pool, 910_109, None, None).unwrap();
            ch.destroy().unwrap();
            assert!(matches!(
                Channel::attach(&ch.serialize()),
                Err(ChannelError::DoesNotExist(910_109))
            ));
            assert!(matches!(
                ch.destroy(),
                Err(ChannelError::Destroyed(910_109))
            ));
            pool.destroy().unwrap();
        }
    }

    mod channel_set {
        use super::*;

        #[test]
        fn reports_ready_member() {
            let pool = test_pool(910_009);
            let a = Channel::create(&pool, 910_110, None, None).unwrap();
            let b = Channel::create(&pool, 910_111, None, None).unwrap();
            let set = ChannelSet::new(vec![a.clone(), b.clone()]);
            b.send(b"data").unwrap();
            let (c_uid, event) = set.poll(Duration::from_secs(1)).unwrap();
            assert_eq!(c_uid, 910_111);
            assert_eq!(event, PollEvent::In);
            a.destroy().unwrap();
            b.destroy().unwrap();
            pool.destroy().unwrap();
        }

        #[test]
        fn times_out_when_idle() {
            let pool = test_pool(910_010);
            let a = Channel::create(&pool, 910_112, None, None).unwrap();
            let set = ChannelSet::new(vec![a.clone()]);
            assert!(matches!(
                set.poll(Duration::from_millis(10)),
                Err(ChannelError::Timeout)
            ));
            a.destroy().unwrap();
            pool.destroy().unwrap();
        }

        #[test]
        fn destroyed_member_reports_nothing() {
            let pool = test_pool(910_011);
            let a = Channel::create(&pool, 910_113, None, None).unwrap();
            let set = ChannelSet::new(vec![a.clone()]);
            a.destroy().unwrap();
            let (c_uid, event) = set.poll(Duration::from_secs(1)).unwrap();
            assert_eq!(c_uid, 910_113);
            assert_eq!(event, PollEvent::Nothing);
            pool.destroy().unwrap();
        }

        #[test]
        fn seeds_pending_frames_at_construction() {
            let pool = test_pool(910_012);
            let a = Channel::create(&pool, 910_114, None, None).unwrap();
            a.send(b"early").unwrap();
            let set = ChannelSet::new(vec![a.clone()]);
            let (c_uid, event) = set.poll(Duration::from_millis(10)).unwrap();
            assert_eq!((c_uid, event), (910_114, PollEvent::In));
            a.destroy().unwrap();
            pool.destroy().unwrap();
        }
    }
}

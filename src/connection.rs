//! Framed connections over channel endpoints.
//!
//! A connection is a thin policy-carrying layer over one inbound and/or one
//! outbound [`Channel`]. It owns neither the channel nor its registration:
//! it attaches, moves frames, and detaches. Closing a connection never
//! destroys the underlying channel.

use crate::channel::{Channel, ChannelError};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use thiserror::Error;

/// Who the traffic belongs to. Infrastructure connections carry runtime
/// control traffic and stdio conduits; user connections carry workload data.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Policy {
    Infrastructure,
    #[default]
    User,
}

/// Tuning options fixed at attach time.
#[derive(Debug, Clone, Copy)]
pub struct ConnectionOptions {
    pub min_block_size: usize,
}

impl Default for ConnectionOptions {
    fn default() -> Self {
        Self {
            min_block_size: 512,
        }
    }
}

#[derive(Debug, Error)]
pub enum ConnectionError {
    #[error("connection has no inbound endpoint")]
    NoInbound,
    #[error("connection has no outbound endpoint")]
    NoOutbound,
    #[error("connection is closed")]
    Closed,
    #[error("end of stream")]
    Eof,
    #[error("frame is not valid UTF-8")]
    NotText,
    #[error(transparent)]
    Channel(#[from] ChannelError),
}

struct ConnInner {
    inbound: Option<Channel>,
    outbound: Option<Channel>,
    options: ConnectionOptions,
    policy: Policy,
    closed: AtomicBool,
}

/// Handle to a connection. Clones share close state.
#[derive(Clone)]
pub struct Connection {
    inner: Arc<ConnInner>,
}

impl Connection {
    pub fn new_inbound(channel: Channel, options: ConnectionOptions, policy: Policy) -> Self {
        Self::new(Some(channel), None, options, policy)
    }

    pub fn new_outbound(channel: Channel, options: ConnectionOptions, policy: Policy) -> Self {
        Self::new(None, Some(channel), options, policy)
    }

    pub fn new_duplex(
        inbound: Channel,
        outbound: Channel,
        options: ConnectionOptions,
        policy: Policy,
    ) -> Self {
        Self::new(Some(inbound), Some(outbound), options, policy)
    }

    fn new(
        inbound: Option<Channel>,
        outbound: Option<Channel>,
        options: ConnectionOptions,
        policy: Policy,
    ) -> Self {
        Self {
            inner: Arc::new(ConnInner {
                inbound,
                outbound,
                options,
                policy,
                closed: AtomicBool::new(false),
            }),
        }
    }

    pub fn inbound_channel(&self) -> Option<&Channel> {
        self.inner.inbound.as_ref()
    }

    pub fn outbound_channel(&self) -> Option<&Channel> {
        self.inner.outbound.as_ref()
    }

    pub fn policy(&self) -> Policy {
        self.inner.policy
    }

    pub fn min_block_size(&self) -> usize {
        self.inner.options.min_block_size
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::SeqCst)
    }

    /// Sends one frame on the outbound endpoint.
    pub fn send(&self, frame: &[u8]) -> Result<(), ConnectionError> {
        if self.is_closed() {
            return Err(ConnectionError::Closed);
        }
        let outbound = self
            .inner
            .outbound
            .as_ref()
            .ok_or(ConnectionError::NoOutbound)?;
        outbound.send(frame)?;
        Ok(())
    }

    /// Sends one UTF-8 text frame.
    pub fn send_str(&self, text: &str) -> Result<(), ConnectionError> {
        self.send(text.as_bytes())
    }

    /// Receives one frame from the inbound endpoint. A zero-length frame is
    /// reported as [`ConnectionError::Eof`].
    pub fn recv_timeout(&self, timeout: Duration) -> Result<Vec<u8>, ConnectionError> {
        if self.is_closed() {
            return Err(ConnectionError::Closed);
        }
        let inbound = self
            .inner
            .inbound
            .as_ref()
            .ok_or(ConnectionError::NoInbound)?;
        let frame = inbound.recv_timeout(timeout)?;
        if frame.is_empty() {
            return Err(ConnectionError::Eof);
        }
        Ok(frame)
    }

    /// Receives one text frame.
    pub fn recv_text_timeout(&self, timeout: Duration) -> Result<String, ConnectionError> {
        String::from_utf8(self.recv_timeout(timeout)?).map_err(|_| ConnectionError::NotText)
    }

    /// Whether an inbound frame is available within `timeout`.
    pub fn poll(&self, timeout: Duration) -> bool {
        if self.is_closed() {
            return false;
        }
        self.inner
            .inbound
            .as_ref()
            .is_some_and(|ch| ch.poll(timeout))
    }

    /// Detaches from the endpoints. Idempotent; never destroys the channel.
    pub fn close(&self) {
        self.inner.closed.store(true, Ordering::SeqCst);
    }
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("inbound", &self.inner.inbound.as_ref().map(Channel::c_uid))
            .field("outbound", &self.inner.outbound.as_ref().map(Channel::c_uid))
            .field("policy", &self.inner.policy)
            .field("closed", &self.is_closed())
            .finish()
    }
}

/// Builds the infrastructure-policy outbound connection the output pump
/// writes child stdout/stderr into.
pub fn outbound_over_descriptor(serialized: &[u8]) -> Result<Connection, ConnectionError> {
    let channel = Channel::attach(serialized)?;
    Ok(Connection::new_outbound(
        channel,
        ConnectionOptions::default(),
        Policy::Infrastructure,
    ))
}

/// Builds the infrastructure-policy inbound connection the input pump
/// drains into a child's stdin.
pub fn inbound_over_descriptor(serialized: &[u8]) -> Result<Connection, ConnectionError> {
    let channel = Channel::attach(serialized)?;
    Ok(Connection::new_inbound(
        channel,
        ConnectionOptions::default(),
        Policy::Infrastructure,
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pool::MemoryPool;

    fn fixture(m_uid: u64, c_uid: u64) -> (MemoryPool, Channel) {
        let pool = MemoryPool::create(1 << 20, "t-conn-pool", m_uid).unwrap();
        let ch = Channel::create(&pool, c_uid, None, None).unwrap();
        (pool, ch)
    }

    mod framing {
        use super::*;

        #[test]
        fn outbound_to_inbound() {
            let (pool, ch) = fixture(920_001, 920_101);
            let tx = Connection::new_outbound(
                ch.clone(),
                ConnectionOptions::default(),
                Policy::Infrastructure,
            );
            let rx =
                Connection::new_inbound(ch.clone(), ConnectionOptions::default(), Policy::User);
            tx.send_str("hello").unwrap();
            assert_eq!(
                rx.recv_text_timeout(Duration::from_millis(10)).unwrap(),
                "hello"
            );
            ch.destroy().unwrap();
            pool.destroy().unwrap();
        }

        #[test]
        fn zero_length_frame_is_eof() {
            let (pool, ch) = fixture(920_002, 920_102);
            let tx = Connection::new_outbound(
                ch.clone(),
                ConnectionOptions::default(),
                Policy::Infrastructure,
            );
            let rx =
                Connection::new_inbound(ch.clone(), ConnectionOptions::default(), Policy::User);
            tx.send(b"").unwrap();
            assert!(matches!(
                rx.recv_timeout(Duration::from_millis(10)),
                Err(ConnectionError::Eof)
            ));
            ch.destroy().unwrap();
            pool.destroy().unwrap();
        }

        #[test]
        fn wrong_direction_is_an_error() {
            let (pool, ch) = fixture(920_003, 920_103);
            let rx =
                Connection::new_inbound(ch.clone(), ConnectionOptions::default(), Policy::User);
            assert!(matches!(rx.send(b"x"), Err(ConnectionError::NoOutbound)));
            ch.destroy().unwrap();
            pool.destroy().unwrap();
        }
    }

    mod close {
        use super::*;

        #[test]
        fn close_is_idempotent_and_keeps_channel_alive() {
            let (pool, ch) = fixture(920_004, 920_104);
            let conn = Connection::new_outbound(
                ch.clone(),
                ConnectionOptions::default(),
                Policy::Infrastructure,
            );
            conn.close();
            conn.close();
            assert!(matches!(conn.send(b"x"), Err(ConnectionError::Closed)));
            // The channel itself is untouched.
            ch.send(b"direct").unwrap();
            ch.destroy().unwrap();
            pool.destroy().unwrap();
        }
    }
}

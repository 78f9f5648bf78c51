//! Per-node supervisor for a distributed runtime.
//!
//! The agent creates and destroys node-local resources (memory pools and
//! message channels), forks and reaps user and infrastructure child
//! processes, and multiplexes each child's standard I/O over the runtime's
//! channel transport. One dispatch loop serves the control plane; three
//! worker threads pump output, pump input, and reap deaths.

/// Channels: byte-frame queues and the multi-channel poller.
pub mod channel;
/// Framed connections over channel endpoints.
pub mod connection;
/// Stdio connectors between child processes and channels.
pub mod connectors;
/// Runtime-wide identifiers, environment conventions, and timings.
pub mod facts;
/// Launcher front-end argument surface.
pub mod launchargs;
/// Control-plane message taxonomy.
pub mod messages;
/// Shared memory pools.
pub mod pool;
/// The Local Services server.
pub mod server;

mod input;
mod output;
mod process;
mod reaper;
mod threads;

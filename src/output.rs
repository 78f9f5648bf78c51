//! The output pump: selector-based fan-in over every live piped stdout and
//! stderr.
//!
//! Registrations are keyed by the raw fd of the child's file handle, with
//! the [`OutputConnector`] as user data. A handle is registered while it is
//! open and always deregistered before its connector closes. Two queues
//! feed the loop from other threads: newly spawned processes to register,
//! and exited-process connectors to retire.

use crate::connectors::{Flush, OutputConnector};
use crate::facts::SHUTDOWN_RESP_TIMEOUT;
use crate::messages::{self, Message};
use crate::server::LocalServer;
use log::{error, info, warn};
use mio::unix::SourceFd;
use mio::{Events, Interest, Poll, Token};
use nix::fcntl::{self, OFlag};
use std::collections::HashMap;
use std::io;
use std::os::unix::io::RawFd;
use std::sync::Arc;

struct StreamSelector {
    poll: Poll,
    registered: HashMap<usize, Arc<OutputConnector>>,
}

impl StreamSelector {
    fn new() -> io::Result<Self> {
        Ok(Self {
            poll: Poll::new()?,
            registered: HashMap::new(),
        })
    }

    fn register(&mut self, connector: Arc<OutputConnector>) {
        // A merged stderr has no file of its own; its bytes arrive through
        // the stdout registration.
        let Some(fd) = connector.raw_fd() else {
            return;
        };
        if let Err(e) = set_nonblocking(fd) {
            warn!("fd {fd} not set non-blocking: {e}");
        }
        let token = fd as usize;
        let mut source = SourceFd(&fd);
        let result = self
            .poll
            .registry()
            .register(&mut source, Token(token), Interest::READABLE)
            .or_else(|_| {
                // Stale registration from a recycled fd; replace it.
                let _ = self.poll.registry().deregister(&mut SourceFd(&fd));
                self.poll
                    .registry()
                    .register(&mut SourceFd(&fd), Token(token), Interest::READABLE)
            });
        match result {
            Ok(()) => {
                self.registered.insert(token, connector);
            }
            Err(e) => warn!(
                "registering output stream of p_uid={} failed: {e}",
                connector.p_uid()
            ),
        }
    }

    // Deregistration happens strictly before close so no handle is polled
    // after its fd is gone.
    fn deregister(&mut self, connector: &Arc<OutputConnector>) {
        let Some(fd) = connector.raw_fd() else {
            return;
        };
        let token = fd as usize;
        if self
            .registered
            .get(&token)
            .is_some_and(|held| Arc::ptr_eq(held, connector))
        {
            self.registered.remove(&token);
            let _ = self.poll.registry().deregister(&mut SourceFd(&fd));
        }
    }

    fn get(&self, token: usize) -> Option<Arc<OutputConnector>> {
        self.registered.get(&token).cloned()
    }
}

fn set_nonblocking(fd: RawFd) -> nix::Result<()> {
    // All file descriptors watched by the selector must be non-blocking.
    let flags = fcntl::fcntl(fd, fcntl::F_GETFL)?;
    fcntl::fcntl(
        fd,
        fcntl::F_SETFL(OFlag::from_bits_truncate(flags) | OFlag::O_NONBLOCK),
    )?;
    Ok(())
}

impl LocalServer {
    /// Worker loop. Any stderr activity on a critical process, and any
    /// stdout activity of Global Services, is interpreted as a termination
    /// payload rather than ordinary output.
    pub(crate) fn watch_output(&self) {
        info!("watch output starting");

        let mut selector = match StreamSelector::new() {
            Ok(selector) => selector,
            Err(e) => {
                self.abnormal_termination(&format!("output selector setup failed: {e}"));
                return;
            }
        };
        let mut events = Events::with_capacity(64);

        while !self.check_shutdown() {
            match selector.poll.poll(&mut events, Some(SHUTDOWN_RESP_TIMEOUT)) {
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) => warn!("output poll failed: {e}"),
                Ok(()) => {}
            }

            let ready: Vec<usize> = events.iter().map(|event| event.token().0).collect();
            for token in ready {
                let Some(connector) = selector.get(token) else {
                    continue;
                };

                let mut eof = false;
                match connector.flush() {
                    Flush::Data | Flush::NoData => {}
                    Flush::Eof => eof = true,
                    Flush::Termination(data) => {
                        // The only path by which an out-of-band GS halt
                        // reaches this agent when GS cannot use its normal
                        // outbound channel.
                        if let Ok(Message::GSHalted(m)) = messages::parse(&data) {
                            self.handle_gs_halted(&m);
                            eof = true;
                        } else {
                            let err_msg =
                                format!("output from critical puid {}", connector.p_uid());
                            error!("{err_msg}");
                            error!("output is:\n{data}");
                            self.abnormal_termination(&err_msg);
                        }
                    }
                }

                if eof {
                    selector.deregister(&connector);
                    connector.close();
                }
            }

            if self.check_shutdown() {
                break;
            }

            for (stdout_connector, stderr_connector) in self.new_procs.drain() {
                selector.register(stdout_connector);
                selector.register(stderr_connector);
            }

            for connector in self.exited_outputs.drain() {
                selector.deregister(&connector);
                connector.close();
            }
        }

        info!("watch output exit");
    }
}

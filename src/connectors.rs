//! Stdio connectors.
//!
//! An [`OutputConnector`] binds a child's stdout or stderr file handle to
//! either an outbound channel some consumer requested or a framed forwarding
//! path back to the launcher. An [`InputConnector`] binds an inbound channel
//! to a child's stdin. Both close exactly once; double close is a no-op.

use crate::connection::{Connection, ConnectionError};
use crate::facts;
use crate::messages::{self, FwdOutput, Message};
use log::{info, warn};
use std::fs::File;
use std::io::{Read, Write};
use std::os::fd::AsRawFd;
use std::os::unix::io::RawFd;
use std::process::ChildStdin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// Which standard stream an output connector carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FdKind {
    Stdout,
    Stderr,
}

impl FdKind {
    pub const fn fd_num(self) -> u8 {
        match self {
            Self::Stdout => FwdOutput::FD_STDOUT,
            Self::Stderr => FwdOutput::FD_STDERR,
        }
    }
}

/// What a flush observed.
#[derive(Debug)]
pub enum Flush {
    /// Data was read and forwarded.
    Data,
    /// Nothing to read right now.
    NoData,
    /// The stream is finished.
    Eof,
    /// The data is a termination payload that must be interpreted, not
    /// forwarded: stdout of Global Services, or stderr of a critical
    /// process.
    Termination(String),
}

/// The child's stdin handle, shared between the input pump, `FwdInput`
/// handling, and the initial-stdin write.
pub type SharedStdin = Arc<Mutex<Option<ChildStdin>>>;

struct OutputState {
    file: Option<File>,
    pid: u32,
    written_to: bool,
    closed: bool,
}

/// One-to-one binding between a child output stream and its destination.
pub struct OutputConnector {
    be_in: Connection,
    p_uid: u64,
    hostname: String,
    kind: FdKind,
    conn: Option<Connection>,
    // Only the root owner of the channel endpoint sends the closing EOF
    // frame and closes the connection; inheriting children must not.
    root_proc: bool,
    critical_proc: bool,
    node_index: u64,
    state: Mutex<OutputState>,
}

impl OutputConnector {
    /// Payload ceiling per frame on the channel path.
    pub const CHUNK: usize = 300;

    #[allow(clippy::too_many_arguments)]
    pub fn new(
        be_in: Connection,
        p_uid: u64,
        hostname: String,
        kind: FdKind,
        conn: Option<Connection>,
        root_proc: bool,
        critical_proc: bool,
        node_index: u64,
    ) -> Self {
        Self {
            be_in,
            p_uid,
            hostname,
            kind,
            conn,
            root_proc,
            critical_proc,
            node_index,
            state: Mutex::new(OutputState {
                file: None,
                pid: 0,
                written_to: false,
                closed: false,
            }),
        }
    }

    /// Attaches the spawned child's file handle and pid. A merged stderr
    /// connector has no file of its own.
    pub fn add_proc_info(&self, file: Option<File>, pid: u32) {
        let mut state = self.state.lock().unwrap();
        state.file = file;
        state.pid = pid;
    }

    pub fn p_uid(&self) -> u64 {
        self.p_uid
    }

    pub fn kind(&self) -> FdKind {
        self.kind
    }

    /// Raw fd while the file handle is open; the pump keys its registration
    /// on this.
    pub fn raw_fd(&self) -> Option<RawFd> {
        self.state
            .lock()
            .unwrap()
            .file
            .as_ref()
            .map(AsRawFd::as_raw_fd)
    }

    /// Reads the stream dry in blocks of up to [`FwdOutput::MAX`] bytes,
    /// routing each block. Returns what the read observed; see [`Flush`].
    pub fn flush(&self) -> Flush {
        let mut state = self.state.lock().unwrap();
        self.flush_locked(&mut state)
    }

    fn flush_locked(&self, state: &mut OutputState) -> Flush {
        let mut buf = [0u8; FwdOutput::MAX];
        let mut read_any = false;

        // The selector delivers readiness edge-triggered, so bytes left in
        // the pipe would never wake it again. Keep reading until WouldBlock,
        // forwarding each block.
        loop {
            let n = {
                let Some(file) = state.file.as_mut() else {
                    return Flush::Eof;
                };
                match file.read(&mut buf) {
                    Ok(0) => return Flush::Eof,
                    Ok(n) => n,
                    Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                        return if read_any { Flush::Data } else { Flush::NoData };
                    }
                    // The handle can be closed under us by a racing exit;
                    // treat it as end of stream.
                    Err(_) => return Flush::Eof,
                }
            };
            read_any = true;
            let data = &buf[..n];

            if self.kind == FdKind::Stdout && self.p_uid == facts::GS_PUID {
                return Flush::Termination(String::from_utf8_lossy(data).into_owned());
            }

            self.forward(state, data);

            if self.critical_proc && self.kind == FdKind::Stderr {
                return Flush::Termination(String::from_utf8_lossy(data).into_owned());
            }
        }
    }

    /// Routes `data` to the outbound channel in bounded chunks, or whole to
    /// the launcher when no channel was requested.
    fn forward(&self, state: &mut OutputState, data: &[u8]) {
        if self.conn.is_some() {
            for chunk in data.chunks(Self::CHUNK) {
                self.sendit(state, chunk);
            }
        } else {
            self.sendit(state, data);
        }
    }

    fn sendit(&self, state: &mut OutputState, block: &[u8]) {
        if !block.is_empty() {
            state.written_to = true;
        }

        let Some(conn) = self.conn.as_ref() else {
            self.fwd_to_launcher(state, String::from_utf8_lossy(block).into_owned());
            return;
        };

        // The consumer may own this channel and may already be gone; lost
        // output goes to the launcher instead of vanishing.
        if conn.send(block).is_err() {
            let tagged = format!("[orphaned output]: {}", String::from_utf8_lossy(block));
            self.fwd_to_launcher(state, tagged);
        }
    }

    fn fwd_to_launcher(&self, state: &OutputState, data: String) {
        let msg = Message::FwdOutput(FwdOutput {
            tag: messages::next_tag(),
            idx: self.node_index,
            p_uid: self.p_uid,
            data,
            fd_num: self.kind.fd_num(),
            pid: state.pid,
            hostname: self.hostname.clone(),
        });
        if let Err(e) = self.be_in.send_str(&msg.serialize()) {
            warn!("forwarding output for p_uid={} to launcher failed: {e}", self.p_uid);
        }
    }

    /// Drains whatever the child left in the pipe, closes the file handle,
    /// and — for the root owner only — signals EOF on and closes the
    /// outbound connection.
    pub fn close(&self) {
        let mut state = self.state.lock().unwrap();
        if state.closed {
            return;
        }

        match self.flush_locked(&mut state) {
            Flush::Termination(data) => {
                warn!("output from p_uid={} discarded at close: {data}", self.p_uid);
            }
            Flush::Data | Flush::NoData | Flush::Eof => {}
        }

        state.file = None;

        if !self.root_proc {
            state.closed = true;
            return;
        }

        if let Some(conn) = self.conn.as_ref() {
            if !state.written_to {
                // The reader blocks until the first frame; an empty frame
                // stands in for EOF when nothing was ever written.
                if let Err(e) = conn.send(b"") {
                    info!("EOF frame for p_uid={} not delivered: {e}", self.p_uid);
                }
                state.written_to = true;
            }
            conn.close();
        }

        state.closed = true;
    }
}

struct InputProc {
    stdin: SharedStdin,
    exited: Arc<AtomicBool>,
    pid: u32,
}

/// One-to-one binding between an inbound channel and a child's stdin.
pub struct InputConnector {
    conn: Connection,
    proc_info: Mutex<Option<InputProc>>,
    closed: AtomicBool,
}

impl InputConnector {
    pub fn new(conn: Connection) -> Self {
        Self {
            conn,
            proc_info: Mutex::new(None),
            closed: AtomicBool::new(false),
        }
    }

    pub fn add_proc_info(&self, stdin: SharedStdin, exited: Arc<AtomicBool>, pid: u32) {
        *self.proc_info.lock().unwrap() = Some(InputProc { stdin, exited, pid });
    }

    /// The inbound channel's uid; set membership is keyed on this.
    pub fn c_uid(&self) -> Option<u64> {
        self.conn.inbound_channel().map(crate::channel::Channel::c_uid)
    }

    pub fn inbound_channel(&self) -> Option<crate::channel::Channel> {
        self.conn.inbound_channel().cloned()
    }

    pub fn proc_is_alive(&self) -> bool {
        self.proc_info
            .lock()
            .unwrap()
            .as_ref()
            .is_some_and(|p| !p.exited.load(Ordering::SeqCst))
    }

    /// Drains pending channel frames into the child's stdin. Returns true
    /// when the channel signaled EOF.
    pub fn forward(&self) -> bool {
        while self.conn.poll(Duration::ZERO) {
            match self.conn.recv_text_timeout(Duration::ZERO) {
                Ok(text) => {
                    if let Err(e) = self.write_stdin(text.as_bytes()) {
                        info!(
                            "stdin data for c_uid={:?} could not be forwarded: {e}",
                            self.c_uid()
                        );
                        return false;
                    }
                    info!("stdin data that was written: {text}");
                }
                Err(ConnectionError::Eof) => return true,
                Err(ConnectionError::Channel(crate::channel::ChannelError::Timeout)) => {
                    return false;
                }
                Err(e) => {
                    info!("input from c_uid={:?} not forwarded: {e}", self.c_uid());
                    return false;
                }
            }
        }
        false
    }

    fn write_stdin(&self, bytes: &[u8]) -> std::io::Result<()> {
        let proc_info = self.proc_info.lock().unwrap();
        let Some(proc_info) = proc_info.as_ref() else {
            return Err(std::io::Error::other("no process attached"));
        };
        let mut stdin = proc_info.stdin.lock().unwrap();
        let Some(stdin) = stdin.as_mut() else {
            return Err(std::io::Error::other(format!(
                "stdin of pid {} already closed",
                proc_info.pid
            )));
        };
        stdin.write_all(bytes)?;
        stdin.flush()
    }

    /// Final drain, then detach from the channel and close the child's
    /// stdin. Idempotent.
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }

        if self.conn.poll(Duration::ZERO) {
            self.forward();
        }
        self.conn.close();

        let proc_info = self.proc_info.lock().unwrap();
        if let Some(proc_info) = proc_info.as_ref() {
            let mut stdin = proc_info.stdin.lock().unwrap();
            if let Some(mut handle) = stdin.take() {
                let _ = handle.flush();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::Channel;
    use crate::connection::{ConnectionOptions, Policy};
    use crate::pool::MemoryPool;
    use nix::fcntl::{self, OFlag};
    use std::os::fd::{AsFd, OwnedFd};

    fn pool(m_uid: u64) -> MemoryPool {
        MemoryPool::create(1 << 20, "t-connector-pool", m_uid).unwrap()
    }

    fn be_pair(pool: &MemoryPool, c_uid: u64) -> (Connection, Connection) {
        let ch = Channel::create(pool, c_uid, None, None).unwrap();
        let tx = Connection::new_outbound(
            ch.clone(),
            ConnectionOptions::default(),
            Policy::Infrastructure,
        );
        let rx = Connection::new_inbound(ch, ConnectionOptions::default(), Policy::Infrastructure);
        (tx, rx)
    }

    fn nonblocking_pipe() -> (File, OwnedFd) {
        let (rx, tx) = nix::unistd::pipe().unwrap();
        let flags = fcntl::fcntl(rx.as_raw_fd(), fcntl::F_GETFL).unwrap();
        fcntl::fcntl(
            rx.as_raw_fd(),
            fcntl::F_SETFL(OFlag::from_bits_truncate(flags) | OFlag::O_NONBLOCK),
        )
        .unwrap();
        (File::from(rx), tx)
    }

    fn recv_fwd_output(be_rx: &Connection) -> FwdOutput {
        let wire = be_rx
            .recv_text_timeout(Duration::from_millis(100))
            .unwrap();
        match crate::messages::parse(&wire).unwrap() {
            Message::FwdOutput(out) => out,
            other => panic!("expected FwdOutput, got {other:?}"),
        }
    }

    mod output_connector {
        use super::*;

        #[test]
        fn forwards_to_launcher_without_channel() {
            let pool = pool(930_001);
            let (be_tx, be_rx) = be_pair(&pool, 930_101);
            let connector = OutputConnector::new(
                be_tx,
                17,
                "testhost".to_string(),
                FdKind::Stdout,
                None,
                false,
                false,
                0,
            );
            let (file, tx) = nonblocking_pipe();
            connector.add_proc_info(Some(file), 4242);

            nix::unistd::write(tx.as_fd(), b"hi\n").unwrap();
            assert!(matches!(connector.flush(), Flush::Data));

            let out = recv_fwd_output(&be_rx);
            assert_eq!(out.p_uid, 17);
            assert_eq!(out.data, "hi\n");
            assert_eq!(out.fd_num, FwdOutput::FD_STDOUT);
            assert_eq!(out.pid, 4242);
            assert_eq!(out.hostname, "testhost");
        }

        #[test]
        fn chunks_channel_sends_at_300_bytes() {
            let pool = pool(930_002);
            let (be_tx, _be_rx) = be_pair(&pool, 930_102);
            let out_ch = Channel::create(&pool, 930_103, None, None).unwrap();
            let conn = Connection::new_outbound(
                out_ch.clone(),
                ConnectionOptions::default(),
                Policy::Infrastructure,
            );
            let connector = OutputConnector::new(
                be_tx,
                18,
                "testhost".to_string(),
                FdKind::Stdout,
                Some(conn),
                true,
                false,
                0,
            );
            let (file, tx) = nonblocking_pipe();
            connector.add_proc_info(Some(file), 1);

            let payload = vec![b'x'; 700];
            nix::unistd::write(tx.as_fd(), &payload).unwrap();
            assert!(matches!(connector.flush(), Flush::Data));

            let mut received = Vec::new();
            let mut sizes = Vec::new();
            while let Ok(frame) = out_ch.recv_timeout(Duration::ZERO) {
                sizes.push(frame.len());
                received.extend(frame);
            }
            assert_eq!(sizes, vec![300, 300, 100]);
            assert_eq!(received, payload);
        }

        #[test]
        fn orphaned_output_falls_back_to_launcher() {
            let pool = pool(930_003);
            let (be_tx, be_rx) = be_pair(&pool, 930_104);
            let out_ch = Channel::create(&pool, 930_105, None, None).unwrap();
            let conn = Connection::new_outbound(
                out_ch.clone(),
                ConnectionOptions::default(),
                Policy::Infrastructure,
            );
            let connector = OutputConnector::new(
                be_tx,
                19,
                "testhost".to_string(),
                FdKind::Stdout,
                Some(conn),
                true,
                false,
                0,
            );
            let (file, tx) = nonblocking_pipe();
            connector.add_proc_info(Some(file), 1);

            // Consumer disappears.
            out_ch.destroy().unwrap();

            nix::unistd::write(tx.as_fd(), b"lost words").unwrap();
            assert!(matches!(connector.flush(), Flush::Data));

            let out = recv_fwd_output(&be_rx);
            assert_eq!(out.data, "[orphaned output]: lost words");
        }

        #[test]
        fn gs_stdout_is_a_termination_payload() {
            let pool = pool(930_004);
            let (be_tx, _be_rx) = be_pair(&pool, 930_106);
            let connector = OutputConnector::new(
                be_tx,
                facts::GS_PUID,
                "testhost".to_string(),
                FdKind::Stdout,
                None,
                false,
                false,
                0,
            );
            let (file, tx) = nonblocking_pipe();
            connector.add_proc_info(Some(file), 1);

            nix::unistd::write(tx.as_fd(), b"{\"_tc\":\"GSHalted\",\"tag\":0}").unwrap();
            match connector.flush() {
                Flush::Termination(data) => assert!(data.contains("GSHalted")),
                other => panic!("expected termination, got {other:?}"),
            }
        }

        #[test]
        fn critical_stderr_forwards_then_terminates() {
            let pool = pool(930_005);
            let (be_tx, be_rx) = be_pair(&pool, 930_107);
            let connector = OutputConnector::new(
                be_tx,
                77,
                "testhost".to_string(),
                FdKind::Stderr,
                None,
                false,
                true,
                0,
            );
            let (file, tx) = nonblocking_pipe();
            connector.add_proc_info(Some(file), 1);

            nix::unistd::write(tx.as_fd(), b"boom").unwrap();
            assert!(matches!(connector.flush(), Flush::Termination(_)));
            // The data still reached the launcher first.
            let out = recv_fwd_output(&be_rx);
            assert_eq!(out.data, "boom");
            assert_eq!(out.fd_num, FwdOutput::FD_STDERR);
        }

        #[test]
        fn one_flush_drains_a_burst_larger_than_one_read() {
            let pool = pool(930_012);
            let (be_tx, _be_rx) = be_pair(&pool, 930_116);
            let out_ch = Channel::create(&pool, 930_117, None, None).unwrap();
            let conn = Connection::new_outbound(
                out_ch.clone(),
                ConnectionOptions::default(),
                Policy::Infrastructure,
            );
            let connector = OutputConnector::new(
                be_tx,
                23,
                "testhost".to_string(),
                FdKind::Stdout,
                Some(conn),
                true,
                false,
                0,
            );
            let (file, tx) = nonblocking_pipe();
            connector.add_proc_info(Some(file), 1);

            // More than one read()'s worth; a single readiness event must
            // still move all of it.
            let payload = vec![b'y'; 2500];
            nix::unistd::write(tx.as_fd(), &payload).unwrap();
            assert!(matches!(connector.flush(), Flush::Data));

            let mut received = Vec::new();
            while let Ok(frame) = out_ch.recv_timeout(Duration::ZERO) {
                received.extend(frame);
            }
            assert_eq!(received, payload);
        }

        #[test]
        fn close_drains_the_final_burst() {
            let pool = pool(930_013);
            let (be_tx, _be_rx) = be_pair(&pool, 930_118);
            let out_ch = Channel::create(&pool, 930_119, None, None).unwrap();
            let conn = Connection::new_outbound(
                out_ch.clone(),
                ConnectionOptions::default(),
                Policy::Infrastructure,
            );
            let connector = OutputConnector::new(
                be_tx,
                24,
                "testhost".to_string(),
                FdKind::Stdout,
                Some(conn),
                true,
                false,
                0,
            );
            let (file, tx) = nonblocking_pipe();
            connector.add_proc_info(Some(file), 1);

            let payload = vec![b'z'; 2500];
            nix::unistd::write(tx.as_fd(), &payload).unwrap();
            drop(tx);

            // Never flushed while live; everything must still come out at
            // close.
            connector.close();

            let mut received = Vec::new();
            while let Ok(frame) = out_ch.recv_timeout(Duration::ZERO) {
                received.extend(frame);
            }
            assert_eq!(received, payload);
        }

        #[test]
        fn eof_on_closed_pipe() {
            let pool = pool(930_006);
            let (be_tx, _be_rx) = be_pair(&pool, 930_108);
            let connector = OutputConnector::new(
                be_tx,
                20,
                "testhost".to_string(),
                FdKind::Stdout,
                None,
                false,
                false,
                0,
            );
            let (file, tx) = nonblocking_pipe();
            connector.add_proc_info(Some(file), 1);
            drop(tx);
            assert!(matches!(connector.flush(), Flush::Eof));
        }

        #[test]
        fn root_close_signals_eof_frame_when_never_written() {
            let pool = pool(930_007);
            let (be_tx, _be_rx) = be_pair(&pool, 930_109);
            let out_ch = Channel::create(&pool, 930_110, None, None).unwrap();
            let conn = Connection::new_outbound(
                out_ch.clone(),
                ConnectionOptions::default(),
                Policy::Infrastructure,
            );
            let connector = OutputConnector::new(
                be_tx,
                21,
                "testhost".to_string(),
                FdKind::Stdout,
                Some(conn),
                true,
                false,
                0,
            );
            let (file, tx) = nonblocking_pipe();
            connector.add_proc_info(Some(file), 1);
            drop(tx);

            connector.close();
            connector.close(); // no-op

            let frame = out_ch.recv_timeout(Duration::ZERO).unwrap();
            assert!(frame.is_empty());
            assert!(matches!(
                out_ch.recv_timeout(Duration::ZERO),
                Err(crate::channel::ChannelError::Timeout)
            ));
        }

        #[test]
        fn non_root_close_leaves_the_channel_alone() {
            let pool = pool(930_008);
            let (be_tx, _be_rx) = be_pair(&pool, 930_111);
            let out_ch = Channel::create(&pool, 930_112, None, None).unwrap();
            let conn = Connection::new_outbound(
                out_ch.clone(),
                ConnectionOptions::default(),
                Policy::Infrastructure,
            );
            let connector = OutputConnector::new(
                be_tx,
                22,
                "testhost".to_string(),
                FdKind::Stdout,
                Some(conn.clone()),
                false,
                false,
                0,
            );
            let (file, tx) = nonblocking_pipe();
            connector.add_proc_info(Some(file), 1);
            drop(tx);

            connector.close();

            // No EOF frame, and the shared connection stays usable.
            assert!(matches!(
                out_ch.recv_timeout(Duration::ZERO),
                Err(crate::channel::ChannelError::Timeout)
            ));
            assert!(!conn.is_closed());
        }
    }

    mod input_connector {
        use super::*;

        #[test]
        fn c_uid_comes_from_the_inbound_channel() {
            let pool = pool(930_009);
            let ch = Channel::create(&pool, 930_113, None, None).unwrap();
            let connector = InputConnector::new(Connection::new_inbound(
                ch,
                ConnectionOptions::default(),
                Policy::Infrastructure,
            ));
            assert_eq!(connector.c_uid(), Some(930_113));
        }

        #[test]
        fn eof_frame_reports_eof() {
            let pool = pool(930_010);
            let ch = Channel::create(&pool, 930_114, None, None).unwrap();
            let connector = InputConnector::new(Connection::new_inbound(
                ch.clone(),
                ConnectionOptions::default(),
                Policy::Infrastructure,
            ));
            ch.send(b"").unwrap();
            assert!(connector.forward());
        }

        #[test]
        fn close_is_idempotent() {
            let pool = pool(930_011);
            let ch = Channel::create(&pool, 930_115, None, None).unwrap();
            let connector = InputConnector::new(Connection::new_inbound(
                ch,
                ConnectionOptions::default(),
                Policy::Infrastructure,
            ));
            connector.close();
            connector.close();
        }
    }
}

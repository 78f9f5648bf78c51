//! The Local Services server: per-node supervisor state and dispatch.
//!
//! The server owns the pool/channel tables and the active-process table,
//! receives control messages on its inbound endpoint, and coordinates three
//! worker loops (output pump, input pump, death reaper). It does not handle
//! startup: it expects the channels and pools made for it by the bootstrap,
//! plus connections to everything it talks to, and offers `run` and
//! `cleanup`.

use crate::channel::{Channel, ChannelError};
use crate::connection::Connection;
use crate::connectors::{InputConnector, OutputConnector};
use crate::facts::{self, QUIESCE_TIME, SHUTDOWN_RESP_TIMEOUT};
use crate::messages::{
    self, ChannelCreate, ChannelCreateResponse, ChannelDestroy, ChannelDestroyResponse, DumpState,
    GSHalted, HaltBE, HaltTA, Message, PoolCreate, PoolCreateResponse, PoolDestroy,
    PoolDestroyResponse, TAHalted,
};
use crate::pool::MemoryPool;
use crate::process::ProcTable;
use crate::threads;
use anyhow::{Context, Result};
use log::{error, info, warn};
use std::collections::HashMap;
use std::io::Write;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{Receiver, Sender, channel};
use std::sync::{Arc, Mutex};

/// Multi-producer queue drained by exactly one worker loop.
pub(crate) struct WorkQueue<T> {
    tx: Sender<T>,
    rx: Mutex<Receiver<T>>,
}

impl<T> WorkQueue<T> {
    fn new() -> Self {
        let (tx, rx) = channel();
        Self {
            tx,
            rx: Mutex::new(rx),
        }
    }

    pub(crate) fn put(&self, item: T) {
        // The receiver lives as long as the queue; a send cannot fail.
        let _ = self.tx.send(item);
    }

    pub(crate) fn drain(&self) -> Vec<T> {
        let rx = self.rx.lock().unwrap();
        let mut items = Vec::new();
        while let Ok(item) = rx.try_recv() {
            items.push(item);
        }
        items
    }
}

/// The message endpoints the server is given at startup.
pub struct Endpoints {
    /// Local Services inbound endpoint; the server's own RPC surface.
    pub shep_in: Connection,
    /// Global Services inbound endpoint.
    pub gs_in: Connection,
    /// Launcher back-end inbound endpoint.
    pub be_in: Connection,
    /// Transport agent inbound endpoint; absent on single-node layouts.
    pub ta_in: Option<Connection>,
    /// Whether this is the primary node's agent.
    pub is_primary: bool,
}

pub struct LocalServer {
    pub(crate) hostname: String,
    pub(crate) node_index: u64,
    pub(crate) is_primary: bool,

    pub(crate) shep_in: Connection,
    pub(crate) gs_in: Connection,
    pub(crate) be_in: Connection,
    pub(crate) ta_in: Option<Connection>,

    // Touched by the dispatch loop and by cleanup() after the workers are
    // gone; the lock is uncontended in steady state.
    pub(crate) pools: Mutex<HashMap<u64, MemoryPool>>,
    pub(crate) channels: Mutex<HashMap<u64, Channel>>,

    // Active process table under a single lock: pid -> record plus
    // p_uid -> pid, kept consistent together.
    pub(crate) apt: Mutex<ProcTable>,

    // Producer/consumer queues between the dispatch thread, the reaper, and
    // the pumps.
    pub(crate) new_procs: WorkQueue<(Arc<OutputConnector>, Arc<OutputConnector>)>,
    pub(crate) new_inputs: WorkQueue<Arc<InputConnector>>,
    pub(crate) exited_outputs: WorkQueue<Arc<OutputConnector>>,

    shutdown_sig: AtomicBool,
    gs_shutdown_sig: AtomicBool,
    ta_shutdown_sig: AtomicBool,
}

impl LocalServer {
    pub fn new(
        endpoints: Endpoints,
        pools: HashMap<u64, MemoryPool>,
        channels: HashMap<u64, Channel>,
    ) -> Self {
        Self {
            hostname: facts::hostname(),
            node_index: facts::node_index(),
            is_primary: endpoints.is_primary,
            shep_in: endpoints.shep_in,
            gs_in: endpoints.gs_in,
            be_in: endpoints.be_in,
            ta_in: endpoints.ta_in,
            pools: Mutex::new(pools),
            channels: Mutex::new(channels),
            apt: Mutex::new(ProcTable::default()),
            new_procs: WorkQueue::new(),
            new_inputs: WorkQueue::new(),
            exited_outputs: WorkQueue::new(),
            shutdown_sig: AtomicBool::new(false),
            gs_shutdown_sig: AtomicBool::new(false),
            ta_shutdown_sig: AtomicBool::new(false),
        }
    }

    pub fn set_shutdown(&self, why: &str) {
        self.shutdown_sig.store(true, Ordering::SeqCst);
        info!("shutdown latch set after {why}");
    }

    pub fn check_shutdown(&self) -> bool {
        self.shutdown_sig.load(Ordering::SeqCst)
    }

    pub fn set_gs_shutdown(&self) {
        self.gs_shutdown_sig.store(true, Ordering::SeqCst);
        info!("set GS shutdown");
    }

    pub fn check_gs_shutdown(&self) -> bool {
        self.gs_shutdown_sig.load(Ordering::SeqCst)
    }

    pub fn set_ta_shutdown(&self) {
        self.ta_shutdown_sig.store(true, Ordering::SeqCst);
        info!("set TA shutdown");
    }

    pub fn check_ta_shutdown(&self) -> bool {
        self.ta_shutdown_sig.load(Ordering::SeqCst)
    }

    /// Triggers abnormal termination: notify the launcher back-end, log,
    /// and latch shutdown. A failed notification is logged, not escalated.
    pub fn abnormal_termination(&self, err_info: &str) {
        let msg = messages::AbnormalTermination::new(err_info.to_string());
        match self.be_in.send_str(&msg.serialize()) {
            Ok(()) => error!("abnormal termination sent to launcher be: {err_info}"),
            Err(e) => error!("abnormal termination notification failed: {e}: {err_info}"),
        }
        self.set_shutdown("abnormal termination");
    }

    /// Routes a response to the endpoint named by the originator's return
    /// cuid. Any unknown target is a protocol violation.
    pub(crate) fn send_response(&self, target_uid: Option<u64>, msg: Message) {
        let Some(target_uid) = target_uid else {
            self.abnormal_termination(&format!("response with no return cuid: {msg:?}"));
            return;
        };
        let conn = if target_uid == facts::GS_INPUT_CUID {
            &self.gs_in
        } else if target_uid == facts::launcher_cuid_from_index(self.node_index) {
            &self.be_in
        } else {
            self.abnormal_termination(&format!("unknown r_c_uid: {target_uid}"));
            return;
        };
        if let Err(e) = conn.send_str(&msg.serialize()) {
            warn!("response to r_c_uid={target_uid} not delivered: {e}");
        }
    }

    /// Runs the dispatch loop and the terminal sequence, then cleans up
    /// every resource this agent owns.
    pub fn run(self: &Arc<Self>, gw_channels: Vec<Channel>) -> Result<()> {
        info!("ls run start");

        let mut workers = Vec::new();
        for (name, f) in [
            ("output-pump", LocalServer::watch_output as fn(&LocalServer)),
            ("death-reaper", LocalServer::watch_death),
            ("input-pump", LocalServer::watch_input),
        ] {
            workers.push(
                threads::spawn_supervised(self, name, f)
                    .with_context(|| format!("starting worker thread {name}"))?,
            );
        }
        info!("runtime service threads started");

        self.main_loop();

        threads::join_with_deadline(workers, QUIESCE_TIME);

        let mut gw_count = 0;
        for (id, gw_ch) in gw_channels.into_iter().enumerate() {
            if let Err(e) = gw_ch.destroy() {
                warn!("gateway channel {id} destroy failed: {e}");
            }
            unsafe {
                std::env::remove_var(format!("{}{}", facts::GW_ENV_PREFIX, id + 1));
            }
            gw_count += 1;
        }
        info!(
            "ls is_primary={} destroyed {gw_count} gateway channels",
            self.is_primary
        );

        // Final message to the launcher back-end, after detaching from the
        // logging sink.
        info!("transmitting final HaltBE from ls");
        log::logger().flush();
        if let Err(e) = self.be_in.send_str(&HaltBE::new().serialize()) {
            warn!("HaltBE not delivered: {e}");
        }

        self.cleanup();
        info!("ls run exit");
        Ok(())
    }

    /// Receives and dispatches messages until the shutdown latch is set and
    /// the inbound endpoint has drained.
    pub fn main_loop(&self) {
        info!("main loop start");
        loop {
            match self.shep_in.recv_text_timeout(SHUTDOWN_RESP_TIMEOUT) {
                Ok(frame) => match messages::parse(&frame) {
                    Ok(msg) => self.handle_message(msg),
                    Err(err) => {
                        self.abnormal_termination(&format!("msg\n{frame}\nfailed parse!\n{err}"));
                    }
                },
                Err(crate::connection::ConnectionError::Channel(ChannelError::Timeout)) => {
                    if self.check_shutdown() {
                        break;
                    }
                }
                Err(e) => {
                    self.abnormal_termination(&format!("ls main loop receive failed: {e}"));
                    break;
                }
            }
        }
        info!("main loop exit");
    }

    fn handle_message(&self, msg: Message) {
        let r_c_uid = msg.r_c_uid();
        let resp = match msg {
            Message::PoolCreate(m) => Some(self.create_pool(&m)),
            Message::PoolDestroy(m) => Some(self.destroy_pool(&m)),
            Message::ChannelCreate(m) => {
                Some(Message::ChannelCreateResponse(self.create_channel(&m)))
            }
            Message::ChannelDestroy(m) => Some(self.destroy_channel(&m)),
            Message::ProcessCreate(m) => {
                // The create response must hit the wire before the output
                // pump can emit the first FwdOutput for this process.
                let (resp, streams) = self.create_process(&m);
                self.send_response(r_c_uid, resp);
                if let Some(streams) = streams {
                    self.new_procs.put(streams);
                }
                None
            }
            Message::ProcessKill(m) => Some(self.kill_process(&m)),
            Message::FwdInput(m) => self.fwd_input(&m),
            Message::AbnormalTermination(m) => {
                info!("received abnormal termination signal, starting shutdown");
                self.abnormal_termination(&m.err_info);
                None
            }
            Message::GSHalted(m) => {
                self.handle_gs_halted(&m);
                None
            }
            Message::Teardown(_) => {
                info!("is_primary={} handling Teardown", self.is_primary);
                self.set_shutdown("Teardown");
                None
            }
            Message::HaltTA(m) => {
                self.handle_halting_ta(&m);
                None
            }
            Message::TAHalted(m) => {
                self.handle_ta_halted(&m);
                None
            }
            Message::DumpState(m) => {
                self.dump_state(&m);
                None
            }
            other => {
                self.abnormal_termination(&format!("unexpected msg type: {other:?}"));
                None
            }
        };
        if let Some(resp) = resp {
            self.send_response(r_c_uid, resp);
        }
    }

    fn create_pool(&self, msg: &PoolCreate) -> Message {
        let mut pools = self.pools.lock().unwrap();
        if pools.contains_key(&msg.m_uid) {
            let error = format!("msg.m_uid={} already in use", msg.m_uid);
            warn!("{error}");
            return PoolCreateResponse::fail(msg.tag, error);
        }
        match MemoryPool::create(msg.size, &msg.name, msg.m_uid) {
            Ok(pool) => {
                let desc = facts::b64_encode(&pool.serialize());
                pools.insert(msg.m_uid, pool);
                PoolCreateResponse::success(msg.tag, desc)
            }
            Err(e) => {
                let error = format!("{msg:?} failed: {e}");
                warn!("{error}");
                PoolCreateResponse::fail(msg.tag, error)
            }
        }
    }

    fn destroy_pool(&self, msg: &PoolDestroy) -> Message {
        let Some(pool) = self.pools.lock().unwrap().remove(&msg.m_uid) else {
            let error = format!("msg.m_uid={} does not exist", msg.m_uid);
            warn!("{error}");
            return PoolDestroyResponse::fail(msg.tag, error);
        };
        // The entry is gone either way; a destructor error is reported but
        // not retried.
        match pool.destroy() {
            Ok(()) => PoolDestroyResponse::success(msg.tag),
            Err(e) => {
                let error = format!("{msg:?} failed: {e}");
                warn!("{error}");
                PoolDestroyResponse::fail(msg.tag, error)
            }
        }
    }

    pub(crate) fn create_channel(&self, msg: &ChannelCreate) -> ChannelCreateResponse {
        let mut channels = self.channels.lock().unwrap();
        if channels.contains_key(&msg.c_uid) {
            let error = format!("msg.c_uid={} already in use", msg.c_uid);
            warn!("{error}");
            return ChannelCreateResponse::fail(msg.tag, error);
        }
        let pools = self.pools.lock().unwrap();
        let Some(pool) = pools.get(&msg.m_uid) else {
            let error = format!("msg.m_uid={} does not exist", msg.m_uid);
            warn!("{error}");
            return ChannelCreateResponse::fail(msg.tag, error);
        };
        match Channel::create(pool, msg.c_uid, msg.options.capacity, msg.options.block_size) {
            Ok(ch) => {
                let desc = facts::b64_encode(&ch.serialize());
                channels.insert(msg.c_uid, ch);
                ChannelCreateResponse::success(msg.tag, desc)
            }
            Err(e) => {
                let error = format!("{msg:?} failed: {e}");
                warn!("{error}");
                ChannelCreateResponse::fail(msg.tag, error)
            }
        }
    }

    fn destroy_channel(&self, msg: &ChannelDestroy) -> Message {
        let Some(ch) = self.channels.lock().unwrap().remove(&msg.c_uid) else {
            let error = format!("{} does not exist", msg.c_uid);
            warn!("{error}");
            return ChannelDestroyResponse::fail(msg.tag, error);
        };
        match ch.destroy() {
            Ok(()) => ChannelDestroyResponse::success(msg.tag),
            Err(e) => {
                let error = format!("{msg:?} failed: {e}");
                warn!("{error}");
                ChannelDestroyResponse::fail(msg.tag, error)
            }
        }
    }

    /// GSHalted arrived, either as a message or parsed out of GS stdout:
    /// latch GS-gone and forward to the launcher, exactly once per source.
    pub(crate) fn handle_gs_halted(&self, msg: &GSHalted) {
        self.set_gs_shutdown();
        info!("forwarding GSHalted to launcher be");
        if let Err(e) = self
            .be_in
            .send_str(&Message::GSHalted(msg.clone()).serialize())
        {
            warn!("GSHalted not delivered to launcher be: {e}");
        }
    }

    fn handle_halting_ta(&self, msg: &HaltTA) {
        info!("forwarding HaltTA");
        let Some(ta_in) = self.ta_in.as_ref() else {
            warn!("HaltTA received but no transport agent endpoint");
            return;
        };
        if let Err(e) = ta_in.send_str(&Message::HaltTA(msg.clone()).serialize()) {
            warn!("HaltTA not delivered: {e}");
        }
    }

    fn handle_ta_halted(&self, msg: &TAHalted) {
        self.set_ta_shutdown();
        info!("forwarding TAHalted to launcher be");
        if let Err(e) = self
            .be_in
            .send_str(&Message::TAHalted(msg.clone()).serialize())
        {
            warn!("TAHalted not delivered to launcher be: {e}");
        }
    }

    fn dump_state(&self, msg: &DumpState) {
        let the_dump = format!("{self}");
        match &msg.filename {
            None => info!("\n{the_dump}"),
            Some(filename) => {
                let write = std::fs::File::create(filename)
                    .and_then(|mut f| f.write_all(the_dump.as_bytes()));
                match write {
                    Ok(()) => info!("state dumped to {}", filename.display()),
                    Err(e) => warn!("state dump to {} failed: {e}", filename.display()),
                }
            }
        }
    }

    /// Destroys channels and pools and kills outstanding processes. None of
    /// the worker threads may be running at this point.
    pub fn cleanup(&self) {
        info!("cleanup start");

        self.clean_procs();

        let channels: Vec<_> = self.channels.lock().unwrap().drain().collect();
        info!("{} channels outstanding", channels.len());
        for (c_uid, ch) in channels {
            if let Err(e) = ch.destroy() {
                warn!("c_uid={c_uid} failed: {e}");
            }
        }

        let pools: Vec<_> = self.pools.lock().unwrap().drain().collect();
        info!("{} pools outstanding", pools.len());
        for (m_uid, pool) in pools {
            if let Err(e) = pool.destroy() {
                warn!("m_uid={m_uid} failed: {e}");
            }
        }

        info!("cleanup end");
    }
}

impl std::fmt::Display for LocalServer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let apt = self.apt.lock().unwrap();
        writeln!(f, "Procs:")?;
        for (p_uid, pid) in &apt.puid2pid {
            writeln!(f, "\t{p_uid}:{pid}")?;
        }
        drop(apt);
        writeln!(f, "Chans:")?;
        for c_uid in self.channels.lock().unwrap().keys() {
            write!(f, " {c_uid}")?;
        }
        writeln!(f)?;
        writeln!(f, "Pools:")?;
        for m_uid in self.pools.lock().unwrap().keys() {
            write!(f, " {m_uid}")?;
        }
        Ok(())
    }
}

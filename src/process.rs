//! Process management: spawning with prepared environment and stdio
//! plumbing, the active-process table, signal delivery, and stdin
//! forwarding.

use crate::channel::Channel;
use crate::connection::{inbound_over_descriptor, outbound_over_descriptor};
use crate::connectors::{FdKind, InputConnector, OutputConnector, SharedStdin};
use crate::facts::{self, CLEANUP_CHILD_WAIT, SHUTDOWN_RESP_TIMEOUT};
use crate::messages::{
    FwdInput, FwdInputErr, Message, PmiInfo, ProcessCreate, ProcessCreateResponse, ProcessKill,
    ProcessKillResponse, RespErr, StdioReq,
};
use crate::server::LocalServer;
use log::{debug, info, warn};
use mio::unix::SourceFd;
use mio::{Interest, Token};
use nix::sched::{CpuSet, sched_setaffinity};
use nix::sys::signal::{self, Signal};
use nix::unistd::Pid;
use serde::Serialize;
use std::collections::HashMap;
use std::fs::File;
use std::io::Write;
use std::os::fd::{AsRawFd, OwnedFd};
use std::os::unix::io::RawFd;
use std::process::{Child, Command, Stdio};
use std::sync::atomic::AtomicBool;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use wait_timeout::ChildExt;

/// One supervised child process.
pub struct ProcessRecord {
    pub(crate) p_uid: u64,
    pub(crate) critical: bool,
    pub(crate) r_c_uid: Option<u64>,
    pub(crate) child: Child,
    pub(crate) stdin: SharedStdin,
    pub(crate) exited: Arc<AtomicBool>,
    pub(crate) stdout_connector: Arc<OutputConnector>,
    pub(crate) stderr_connector: Arc<OutputConnector>,
    pub(crate) stdin_connector: Option<Arc<InputConnector>>,
}

/// Active-process table: `pid -> record` and `p_uid -> pid`, kept
/// consistent under one lock.
#[derive(Default)]
pub struct ProcTable {
    pub(crate) by_pid: HashMap<u32, ProcessRecord>,
    pub(crate) puid2pid: HashMap<u64, u32>,
}

impl ProcTable {
    pub(crate) fn insert(&mut self, record: ProcessRecord) {
        self.puid2pid.insert(record.p_uid, record.child.id());
        self.by_pid.insert(record.child.id(), record);
    }

    pub(crate) fn remove_by_pid(&mut self, pid: u32) -> Option<ProcessRecord> {
        let record = self.by_pid.remove(&pid)?;
        self.puid2pid.remove(&record.p_uid);
        Some(record)
    }
}

/// The record the node agent sends into the PMI launch channel so the rank
/// can wire itself up.
#[derive(Debug, Serialize)]
struct MpiWireUp<'a> {
    ppn: u64,
    nid: u64,
    nnodes: u64,
    nranks: u64,
    nidlist: &'a [u64],
    hostlist: &'a [String],
    job_id: u64,
    lrank: u64,
}

// Affinity is opened to all cores right after spawn. Grandchildren forked
// before this point will not inherit the setting; processes that need a
// guaranteed affinity must set their own.
fn open_affinity(pid: u32) -> nix::Result<()> {
    let cores = std::thread::available_parallelism().map_or(1, |n| n.get());
    let mut set = CpuSet::new();
    for cpu in 0..cores.min(CpuSet::count()) {
        set.set(cpu)?;
    }
    sched_setaffinity(Pid::from_raw(pid as i32), &set)
}

fn poll_writable(fd: RawFd, timeout: Duration) -> std::io::Result<bool> {
    let mut poll = mio::Poll::new()?;
    poll.registry()
        .register(&mut SourceFd(&fd), Token(0), Interest::WRITABLE)?;
    let mut events = mio::Events::with_capacity(1);
    match poll.poll(&mut events, Some(timeout)) {
        Err(e) if e.kind() == std::io::ErrorKind::Interrupted => {}
        Err(e) => return Err(e),
        Ok(()) => {}
    }
    Ok(!events.is_empty())
}

/// The stdout/stderr connectors of a freshly spawned process, to be handed
/// to the output pump only after the create response is on the wire. That
/// order is what keeps the response ahead of the first `FwdOutput`.
pub type NewProcStreams = (Arc<OutputConnector>, Arc<OutputConnector>);

impl LocalServer {
    /// Handles `ProcessCreate`: plumb stdio, spawn under the table lock,
    /// and answer with the helper channel descriptors. The returned streams
    /// must be published to the output pump by the caller, after the
    /// response.
    pub fn create_process(&self, msg: &ProcessCreate) -> (Message, Option<NewProcStreams>) {
        let mut streams = None;
        let resp = self.create_process_impl(msg, &mut streams);
        (resp, streams)
    }

    fn create_process_impl(
        &self,
        msg: &ProcessCreate,
        streams: &mut Option<NewProcStreams>,
    ) -> Message {
        if self
            .apt
            .lock()
            .unwrap()
            .puid2pid
            .contains_key(&msg.t_p_uid)
        {
            let error = format!("msg.t_p_uid={} already exists", msg.t_p_uid);
            warn!("{error}");
            return ProcessCreateResponse::fail(msg.tag, error);
        }

        // Caller environment is merged over ours, minus anything
        // node-local that must not leak into the child.
        debug!(
            "removing these from the request environment: {:?}",
            facts::NODE_LOCAL_PARAMS
        );
        let mut req_env = msg.env.clone();
        for var in facts::NODE_LOCAL_PARAMS {
            req_env.remove(*var);
        }
        let mut the_env: HashMap<String, String> = std::env::vars().collect();
        the_env.extend(req_env);

        let mut stdin_resp = None;
        let mut stdout_resp = None;
        let mut stderr_resp = None;
        let mut stdin_conn = None;
        let mut stdout_conn = None;
        let mut stderr_conn = None;
        let mut stdout_root = false;
        let mut stderr_root = false;

        if let Some(ch_msg) = &msg.stdin_msg {
            let resp = self.create_channel(ch_msg);
            if resp.err != RespErr::Success {
                return ProcessCreateResponse::fail(
                    msg.tag,
                    format!(
                        "Failed creating the stdin channel for new process: {}",
                        resp.err_info.as_deref().unwrap_or("unknown")
                    ),
                );
            }
            match attach_inbound(resp.desc.as_deref()) {
                Ok(conn) => stdin_conn = Some(conn),
                Err(error) => return ProcessCreateResponse::fail(msg.tag, error),
            }
            stdin_resp = Some(resp);
        }

        if let Some(ch_msg) = &msg.stdout_msg {
            let resp = self.create_channel(ch_msg);
            if resp.err != RespErr::Success {
                // The stdin helper channel, if any, is left for the caller
                // to clean up.
                return ProcessCreateResponse::fail(
                    msg.tag,
                    format!(
                        "Failed creating the stdout channel for new process: {}",
                        resp.err_info.as_deref().unwrap_or("unknown")
                    ),
                );
            }
            match attach_outbound(resp.desc.as_deref()) {
                Ok(conn) => stdout_conn = Some(conn),
                Err(error) => return ProcessCreateResponse::fail(msg.tag, error),
            }
            stdout_root = true;
            if let Some(desc) = &resp.desc {
                the_env.insert(facts::STDOUT_DESC.to_string(), desc.clone());
            }
            stdout_resp = Some(resp);
        } else if let Some(desc) = the_env.get(facts::STDOUT_DESC).cloned() {
            // A descriptor in the inherited environment means some parent
            // requested a pipe; all of its children write there too.
            match attach_outbound(Some(&desc)) {
                Ok(conn) => stdout_conn = Some(conn),
                Err(error) => return ProcessCreateResponse::fail(msg.tag, error),
            }
        }

        if let Some(ch_msg) = &msg.stderr_msg {
            let resp = self.create_channel(ch_msg);
            if resp.err != RespErr::Success {
                // Same leak-to-caller policy as above for stdin/stdout.
                return ProcessCreateResponse::fail(
                    msg.tag,
                    format!(
                        "Failed creating the stderr channel for new process: {}",
                        resp.err_info.as_deref().unwrap_or("unknown")
                    ),
                );
            }
            match attach_outbound(resp.desc.as_deref()) {
                Ok(conn) => stderr_conn = Some(conn),
                Err(error) => return ProcessCreateResponse::fail(msg.tag, error),
            }
            stderr_root = true;
            if let Some(desc) = &resp.desc {
                the_env.insert(facts::STDERR_DESC.to_string(), desc.clone());
            }
            stderr_resp = Some(resp);
        } else if msg.stderr == StdioReq::Stdout {
            // Subprocesses of this child should also write to the stdout
            // connection, so the stdout descriptor doubles as stderr's.
            stderr_conn = stdout_conn.clone();
            if let Some(desc) = stdout_resp.as_ref().and_then(|r| r.desc.clone()) {
                the_env.insert(facts::STDERR_DESC.to_string(), desc);
            }
        } else if let Some(desc) = the_env.get(facts::STDERR_DESC).cloned() {
            match attach_outbound(Some(&desc)) {
                Ok(conn) => stderr_conn = Some(conn),
                Err(error) => return ProcessCreateResponse::fail(msg.tag, error),
            }
        }

        let mut pmod_send = None;
        if let Some(pmi) = &msg.pmi_info {
            debug!("{pmi:?}");
            match self.provision_pmod(msg.t_p_uid, pmi, &mut the_env) {
                Ok(channel) => pmod_send = Some(channel),
                Err(error) => {
                    warn!("{error}");
                    return ProcessCreateResponse::fail(msg.tag, error);
                }
            }
        }

        let stdin_connector = stdin_conn.map(|conn| Arc::new(InputConnector::new(conn)));
        let stdout_connector = Arc::new(OutputConnector::new(
            self.be_in.clone(),
            msg.t_p_uid,
            self.hostname.clone(),
            FdKind::Stdout,
            stdout_conn,
            stdout_root,
            false,
            self.node_index,
        ));
        let stderr_connector = Arc::new(OutputConnector::new(
            self.be_in.clone(),
            msg.t_p_uid,
            self.hostname.clone(),
            FdKind::Stderr,
            stderr_conn,
            stderr_root,
            false,
            self.node_index,
        ));

        let shared_stdin;
        {
            // Race with the death reaper: the process must be in the table
            // before its exit can be observed.
            let mut apt = self.apt.lock().unwrap();

            let spawned = spawn_with_dispositions(msg, &the_env);
            let (mut child, stdout_file, stderr_file) = match spawned {
                Ok(parts) => parts,
                Err(e) => {
                    let error = format!("{msg:?} encountered {e}");
                    warn!("{error}");
                    return ProcessCreateResponse::fail(msg.tag, error);
                }
            };

            if let Err(e) = open_affinity(child.id()) {
                debug!("affinity for pid {} not opened: {e}", child.id());
            }

            let pid = child.id();
            shared_stdin = Arc::new(Mutex::new(child.stdin.take()));
            let exited = Arc::new(AtomicBool::new(false));

            stdout_connector.add_proc_info(stdout_file, pid);
            stderr_connector.add_proc_info(stderr_file, pid);
            if let Some(connector) = &stdin_connector {
                connector.add_proc_info(shared_stdin.clone(), exited.clone(), pid);
            }

            if msg.stdin == StdioReq::Pipe {
                if let Some(connector) = &stdin_connector {
                    self.new_inputs.put(connector.clone());
                }
            }

            apt.insert(ProcessRecord {
                p_uid: msg.t_p_uid,
                critical: false,
                r_c_uid: Some(msg.r_c_uid),
                child,
                stdin: shared_stdin.clone(),
                exited,
                stdout_connector: stdout_connector.clone(),
                stderr_connector: stderr_connector.clone(),
                stdin_connector,
            });
            info!("created process {} with pid {pid}", msg.exe);
        }

        if let Some(channel) = pmod_send {
            if let Some(pmi) = &msg.pmi_info {
                if let Err(e) = send_mpi_data(&channel, pmi) {
                    let error = format!("sending MPI wire-up for lrank {}: {e}", pmi.lrank);
                    warn!("{error}");
                    return ProcessCreateResponse::fail(msg.tag, error);
                }
                info!(
                    "p_uid {} sent mpi data for lrank {}",
                    msg.t_p_uid, pmi.lrank
                );
            }
        }

        // The process is live from here on even if a later step fails; the
        // pump must adopt its streams either way.
        *streams = Some((stdout_connector, stderr_connector));

        if !msg.initial_stdin.is_empty() {
            info!("writing initial stdin to newly created process");
            if let Err(e) = write_initial_stdin(&shared_stdin, &msg.initial_stdin) {
                let error = format!("{msg:?} encountered {e}");
                warn!("{error}");
                return ProcessCreateResponse::fail(msg.tag, error);
            }
        }

        ProcessCreateResponse::success(msg.tag, stdin_resp, stdout_resp, stderr_resp)
    }

    /// Registers an externally spawned infrastructure process (Global
    /// Services, transport agent) so its stdio and death are supervised
    /// like any other child. Criticality makes an uncommanded death
    /// escalate.
    pub fn add_proc(&self, mut child: Child, p_uid: u64, critical: bool, r_c_uid: Option<u64>) {
        let pid = child.id();
        let stdout_file = child.stdout.take().map(|s| File::from(OwnedFd::from(s)));
        let stderr_file = child.stderr.take().map(|s| File::from(OwnedFd::from(s)));
        let shared_stdin: SharedStdin = Arc::new(Mutex::new(child.stdin.take()));
        let exited = Arc::new(AtomicBool::new(false));

        let stdout_connector = Arc::new(OutputConnector::new(
            self.be_in.clone(),
            p_uid,
            self.hostname.clone(),
            FdKind::Stdout,
            None,
            false,
            critical,
            self.node_index,
        ));
        stdout_connector.add_proc_info(stdout_file, pid);
        let stderr_connector = Arc::new(OutputConnector::new(
            self.be_in.clone(),
            p_uid,
            self.hostname.clone(),
            FdKind::Stderr,
            None,
            false,
            critical,
            self.node_index,
        ));
        stderr_connector.add_proc_info(stderr_file, pid);

        self.apt.lock().unwrap().insert(ProcessRecord {
            p_uid,
            critical,
            r_c_uid,
            child,
            stdin: shared_stdin,
            exited,
            stdout_connector: stdout_connector.clone(),
            stderr_connector: stderr_connector.clone(),
            stdin_connector: None,
        });
        self.new_procs.put((stdout_connector, stderr_connector));
        info!("registered external process p_uid={p_uid} pid={pid} critical={critical}");
    }

    fn provision_pmod(
        &self,
        t_p_uid: u64,
        pmi: &PmiInfo,
        the_env: &mut HashMap<String, String>,
    ) -> Result<Channel, String> {
        let pmod_launch_cuid =
            facts::pmod_launch_cuid_from_jobinfo(facts::host_id(), pmi.job_id, pmi.lrank);
        info!("p_uid {t_p_uid} creating pmod launch channel with c_uid={pmod_launch_cuid}");

        let inf_muid = facts::infrastructure_pool_muid_from_index(self.node_index);
        let channel = {
            let pools = self.pools.lock().unwrap();
            let pool = pools
                .get(&inf_muid)
                .ok_or_else(|| format!("infrastructure pool m_uid={inf_muid} is not known"))?;
            Channel::create(pool, pmod_launch_cuid, None, None)
                .map_err(|e| format!("pmod launch channel failed: {e}"))?
        };
        self.channels
            .lock()
            .unwrap()
            .insert(pmod_launch_cuid, channel.clone());

        the_env.insert(
            facts::PMOD_CHILD_CHANNEL.to_string(),
            facts::b64_encode(&channel.serialize()),
        );

        info!("p_uid {t_p_uid} setting required PMI environment variables");
        the_env.insert("PMI_CONTROL_PORT".to_string(), pmi.control_port.to_string());
        the_env.insert(
            "MPICH_OFI_CXI_PID_BASE".to_string(),
            pmi.pid_base.to_string(),
        );
        the_env.insert("DL_PLUGIN_RESILIENCY".to_string(), "1".to_string());
        the_env.insert("LD_PRELOAD".to_string(), "libdragon.so".to_string());
        the_env.insert("_DRAGON_PALS_ENABLED".to_string(), "1".to_string());
        the_env.insert("FI_CXI_RX_MATCH_MODE".to_string(), "hybrid".to_string());

        Ok(channel)
    }

    /// Handles `ProcessKill`: deliver the requested signal to the target.
    pub fn kill_process(&self, msg: &ProcessKill) -> Message {
        let target = self
            .apt
            .lock()
            .unwrap()
            .puid2pid
            .get(&msg.t_p_uid)
            .copied();
        let Some(pid) = target else {
            let error = format!("{} not present", msg.t_p_uid);
            warn!("{error}");
            return ProcessKillResponse::fail(msg.tag, error);
        };

        let sig = match Signal::try_from(msg.sig) {
            Ok(sig) => sig,
            Err(e) => {
                let error = format!("signal {} invalid: {e}", msg.sig);
                warn!("{error}");
                return ProcessKillResponse::fail(msg.tag, error);
            }
        };

        match signal::kill(Pid::from_raw(pid as i32), sig) {
            Ok(()) => {
                info!("{msg:?} delivered to pid {pid}");
                ProcessKillResponse::success(msg.tag)
            }
            Err(e) => {
                let error = format!("delivering {msg:?} to pid {pid} encountered {e}");
                warn!("{error}");
                ProcessKillResponse::fail(msg.tag, error)
            }
        }
    }

    /// Handles `FwdInput`: bounded write into the target's stdin. Only a
    /// `confirm` request gets a response.
    pub fn fwd_input(&self, msg: &FwdInput) -> Option<Message> {
        let target = msg.t_p_uid;
        let mut error = String::new();

        let shared_stdin = {
            let apt = self.apt.lock().unwrap();
            match apt
                .puid2pid
                .get(&target)
                .and_then(|pid| apt.by_pid.get(pid))
            {
                Some(record) => Some(record.stdin.clone()),
                None => {
                    error = format!("p_uid {target} does not exist here and now");
                    None
                }
            }
        };

        if let Some(shared_stdin) = &shared_stdin {
            let mut stdin = shared_stdin.lock().unwrap();
            match stdin.as_mut() {
                None => error = format!("p_uid {target} has no stdin"),
                Some(handle) => match poll_writable(handle.as_raw_fd(), SHUTDOWN_RESP_TIMEOUT) {
                    Ok(true) => {
                        let data = msg.input.as_bytes();
                        if data.len() > FwdInput::MAX {
                            warn!("truncating request of {} to {}", data.len(), FwdInput::MAX);
                        }
                        let end = data.len().min(FwdInput::MAX);
                        if let Err(e) = handle.write_all(&data[..end]) {
                            error = e.to_string();
                        }
                    }
                    Ok(false) => {
                        error = format!("input of target={target} not ready for writing");
                    }
                    Err(e) => error = e.to_string(),
                },
            }
            if !error.is_empty() {
                // A stdin we failed to write is never written again.
                stdin.take();
            }
        }

        if !error.is_empty() {
            warn!("error={error} from {msg:?}");
        }

        msg.confirm.then(|| {
            if error.is_empty() {
                FwdInputErr::success(msg.tag)
            } else {
                FwdInputErr::fail(msg.tag, error.clone())
            }
        })
    }

    /// Kills and reaps every remaining child. Only called from the
    /// terminal sequence, after the workers have stopped.
    pub(crate) fn clean_procs(&self) {
        let mut apt = self.apt.lock().unwrap();
        info!("{} processes outstanding", apt.by_pid.len());

        for (p_uid, pid) in &apt.puid2pid {
            match signal::kill(Pid::from_raw(*pid as i32), Signal::SIGKILL) {
                Ok(()) => info!("kill sent to p_uid={p_uid}:pid={pid}"),
                Err(e) => warn!("kill on p_uid={p_uid}:pid={pid} failed: {e}"),
            }
        }
        apt.puid2pid.clear();

        for (pid, mut record) in std::mem::take(&mut apt.by_pid) {
            match record.child.wait_timeout(CLEANUP_CHILD_WAIT) {
                Ok(Some(_)) => {}
                Ok(None) => warn!("wait on p_uid={} timed out", record.p_uid),
                Err(e) => warn!("wait on p_uid={} pid={pid} failed: {e}", record.p_uid),
            }
        }
    }
}

fn attach_inbound(desc: Option<&str>) -> Result<crate::connection::Connection, String> {
    let desc = desc.ok_or("channel response carried no descriptor")?;
    let raw = facts::b64_decode(desc).map_err(|e| format!("bad stdin descriptor: {e}"))?;
    inbound_over_descriptor(&raw).map_err(|e| format!("attaching stdin channel: {e}"))
}

fn attach_outbound(desc: Option<&str>) -> Result<crate::connection::Connection, String> {
    let desc = desc.ok_or("channel response carried no descriptor")?;
    let raw = facts::b64_decode(desc).map_err(|e| format!("bad output descriptor: {e}"))?;
    outbound_over_descriptor(&raw).map_err(|e| format!("attaching output channel: {e}"))
}

/// Spawns the child with stdin piped and stdout/stderr set per the request,
/// returning the files the output pump will watch. A merged stderr has no
/// file of its own; its bytes arrive on the stdout file.
fn spawn_with_dispositions(
    msg: &ProcessCreate,
    the_env: &HashMap<String, String>,
) -> std::io::Result<(Child, Option<File>, Option<File>)> {
    let mut command = Command::new(&msg.exe);
    command.args(&msg.args);
    command.env_clear();
    command.envs(the_env);
    if !msg.rundir.is_empty() {
        command.current_dir(&msg.rundir);
    }
    command.stdin(Stdio::piped());

    let mut merged_read = None;
    match (msg.stdout, msg.stderr) {
        (StdioReq::Devnull, StdioReq::Stdout) => {
            // Merging into a discarded stream discards both.
            command.stdout(Stdio::null());
            command.stderr(Stdio::null());
        }
        (_, StdioReq::Stdout) => {
            let (read, write) = nix::unistd::pipe()?;
            let write_dup = write.try_clone()?;
            command.stdout(Stdio::from(write));
            command.stderr(Stdio::from(write_dup));
            merged_read = Some(read);
        }
        (stdout, stderr) => {
            command.stdout(if stdout == StdioReq::Devnull {
                Stdio::null()
            } else {
                Stdio::piped()
            });
            command.stderr(if stderr == StdioReq::Devnull {
                Stdio::null()
            } else {
                Stdio::piped()
            });
        }
    }

    let mut child = command.spawn()?;
    let stdout_file = match merged_read {
        Some(read) => Some(File::from(read)),
        None => child.stdout.take().map(|s| File::from(OwnedFd::from(s))),
    };
    let stderr_file = child.stderr.take().map(|s| File::from(OwnedFd::from(s)));
    Ok((child, stdout_file, stderr_file))
}

fn send_mpi_data(channel: &Channel, pmi: &PmiInfo) -> Result<(), String> {
    let record = MpiWireUp {
        ppn: pmi.ppn,
        nid: pmi.nid,
        nnodes: pmi.nnodes,
        nranks: pmi.nranks,
        nidlist: &pmi.nidlist,
        hostlist: &pmi.hostlist,
        job_id: pmi.job_id,
        lrank: pmi.lrank,
    };
    let bytes = serde_json::to_vec(&record).map_err(|e| e.to_string())?;
    channel.send(&bytes).map_err(|e| e.to_string())
}

fn write_initial_stdin(shared_stdin: &SharedStdin, text: &str) -> std::io::Result<()> {
    let mut stdin = shared_stdin.lock().unwrap();
    let Some(handle) = stdin.as_mut() else {
        return Err(std::io::Error::other("stdin is not available"));
    };
    handle.write_all(text.as_bytes())?;
    handle.write_all(b"\n")?;
    handle.flush()
}

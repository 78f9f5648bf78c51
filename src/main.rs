//! Daemon entry point.
//!
//! Parses the launcher argument surface, configures logging, bootstraps a
//! single-node in-process layout (infrastructure and default pools plus the
//! agent, Global Services, and back-end endpoints), and runs the server.
//! When a head program is given, it is launched through the normal
//! `ProcessCreate` path and its forwarded output is echoed to this
//! process's stdio; the daemon tears down when it exits and preserves its
//! exit code.

use anyhow::{Context, Result};
use clap::Parser;
use log::{LevelFilter, warn};
use shepd::channel::{Channel, ChannelError};
use shepd::connection::{Connection, ConnectionError, ConnectionOptions, Policy};
use shepd::facts;
use shepd::launchargs::{LaunchArgs, LogDevice};
use shepd::messages::{self, FwdOutput, Message, ProcessCreate, StdioReq, Teardown};
use shepd::pool::MemoryPool;
use shepd::server::{Endpoints, LocalServer};
use signal_hook::consts::{SIGINT, SIGTERM};
use signal_hook::iterator::Signals;
use std::collections::HashMap;
use std::io::Write;
use std::sync::Arc;
use std::time::Duration;

const HEAD_PROC_PUID: u64 = 1 << 16;
const BOOTSTRAP_POOL_BYTES: u64 = 1 << 22;

fn configure_logger(filter: LevelFilter) {
    let mut builder = env_logger::Builder::from_default_env();
    builder.target(env_logger::Target::Stderr);
    builder.filter_level(filter);
    builder.init();
}

fn main() -> Result<()> {
    let launch = LaunchArgs::parse().resolve()?;

    let filter = launch
        .log_device_level_map
        .get(&LogDevice::Stderr)
        .copied()
        .unwrap_or(LevelFilter::Warn);
    configure_logger(filter);

    let node_index = facts::node_index();

    let inf_pool = MemoryPool::create(
        BOOTSTRAP_POOL_BYTES,
        "infrastructure",
        facts::infrastructure_pool_muid_from_index(node_index),
    )
    .context("creating the infrastructure pool")?;
    let def_pool = MemoryPool::create(
        BOOTSTRAP_POOL_BYTES,
        "default",
        facts::default_pool_muid_from_index(node_index),
    )
    .context("creating the default pool")?;

    let shep_ch = Channel::create(
        &inf_pool,
        facts::shepherd_cuid_from_index(node_index),
        None,
        None,
    )
    .context("creating the agent channel")?;
    let gs_ch = Channel::create(&inf_pool, facts::GS_INPUT_CUID, None, None)
        .context("creating the gs channel")?;
    let be_ch = Channel::create(
        &inf_pool,
        facts::launcher_cuid_from_index(node_index),
        None,
        None,
    )
    .context("creating the back-end channel")?;

    let infra_in = |ch: &Channel| {
        Connection::new_inbound(
            ch.clone(),
            ConnectionOptions::default(),
            Policy::Infrastructure,
        )
    };
    let infra_out = |ch: &Channel| {
        Connection::new_outbound(
            ch.clone(),
            ConnectionOptions::default(),
            Policy::Infrastructure,
        )
    };

    let shep_tx = infra_out(&shep_ch);
    let be_rx = infra_in(&be_ch);

    let pools = HashMap::from([
        (inf_pool.m_uid(), inf_pool.clone()),
        (def_pool.m_uid(), def_pool.clone()),
    ]);
    let channels = HashMap::from([
        (shep_ch.c_uid(), shep_ch.clone()),
        (gs_ch.c_uid(), gs_ch.clone()),
        (be_ch.c_uid(), be_ch.clone()),
    ]);

    let server = Arc::new(LocalServer::new(
        Endpoints {
            shep_in: infra_in(&shep_ch),
            gs_in: infra_out(&gs_ch),
            be_in: infra_out(&be_ch),
            ta_in: None,
            is_primary: true,
        },
        pools,
        channels,
    ));

    let mut signals =
        Signals::new([SIGINT, SIGTERM]).context("Failed to register signal handlers")?;
    {
        let server = server.clone();
        std::thread::Builder::new()
            .name("signal-watch".to_string())
            .spawn(move || {
                if signals.forever().next().is_some() {
                    server.set_shutdown("signal");
                }
            })
            .context("Failed to create signal thread")?;
    }

    let expect_head = launch.head_proc.is_some();
    if let Some((prog, args)) = &launch.head_proc {
        let msg = Message::ProcessCreate(ProcessCreate {
            tag: messages::next_tag(),
            r_c_uid: facts::launcher_cuid_from_index(node_index),
            t_p_uid: HEAD_PROC_PUID,
            exe: prog.as_str().to_string(),
            args: args.clone(),
            env: HashMap::new(),
            rundir: String::new(),
            stdin: StdioReq::Pipe,
            stdout: StdioReq::Pipe,
            stderr: StdioReq::Pipe,
            stdin_msg: None,
            stdout_msg: None,
            stderr_msg: None,
            initial_stdin: String::new(),
            pmi_info: None,
        });
        shep_tx
            .send_str(&msg.serialize())
            .context("submitting the head program")?;
    }

    let drain = {
        let shep_tx = shep_tx.clone();
        std::thread::Builder::new()
            .name("backend-drain".to_string())
            .spawn(move || backend_drain(&be_rx, &shep_tx, expect_head))
            .context("Failed to create back-end drain thread")?
    };

    server.run(Vec::new())?;

    let exit_code = drain.join().ok().flatten().unwrap_or(0);
    std::process::exit(exit_code);
}

/// Plays the launcher back-end for the single-node layout: echoes forwarded
/// stdio, requests teardown once the head program exits, and stops on
/// `HaltBE`.
fn backend_drain(be_rx: &Connection, shep_tx: &Connection, expect_head: bool) -> Option<i32> {
    let mut exit_code = None;
    loop {
        match be_rx.recv_text_timeout(Duration::from_millis(100)) {
            Ok(frame) => match messages::parse(&frame) {
                Ok(Message::FwdOutput(out)) => echo_output(&out),
                Ok(Message::ProcessExit(exit)) => {
                    if expect_head && exit.p_uid == HEAD_PROC_PUID {
                        exit_code = Some(exit.exit_code);
                        let teardown = Message::Teardown(Teardown {
                            tag: messages::next_tag(),
                        });
                        if let Err(e) = shep_tx.send_str(&teardown.serialize()) {
                            warn!("teardown request not delivered: {e}");
                        }
                    }
                }
                Ok(Message::AbnormalTermination(m)) => {
                    eprintln!("abnormal termination: {}", m.err_info);
                }
                Ok(Message::HaltBE(_)) => break,
                Ok(_) => {}
                Err(e) => warn!("back-end frame failed parse: {e}"),
            },
            Err(ConnectionError::Channel(ChannelError::Timeout)) => {}
            // The back-end channel is gone; the terminal sequence is past
            // the point of talking to us.
            Err(_) => break,
        }
    }
    exit_code
}

fn echo_output(out: &FwdOutput) {
    if out.fd_num == FwdOutput::FD_STDERR {
        let mut stderr = std::io::stderr();
        let _ = stderr.write_all(out.data.as_bytes());
        let _ = stderr.flush();
    } else {
        let mut stdout = std::io::stdout();
        let _ = stdout.write_all(out.data.as_bytes());
        let _ = stdout.flush();
    }
}

//! Launcher front-end argument surface.
//!
//! The node agent itself never parses these; they are the CLI contract of
//! the launcher that starts it, kept here so the binary and the front end
//! agree on validation: node counts are non-negative, ports live in
//! 1024-65535, and hostnames follow POSIX label rules.

use anyhow::{Context, Result, bail};
use clap::{ArgAction, Parser, ValueEnum};
use log::LevelFilter;
use non_empty_string::NonEmptyString;
use nonempty::NonEmpty;
use std::collections::HashMap;
use std::path::{Path, PathBuf};

/// Default multinode communication port.
pub const DEFAULT_PORT: u16 = 7575;

/// Supported workload managers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum Wlm {
    Slurm,
    Pbs,
    Ssh,
}

/// Supported transport agents for backend node-to-node communication.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, ValueEnum)]
pub enum Transport {
    #[default]
    Tcp,
    Rdma,
}

/// Diagnostic log output devices.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LogDevice {
    Stderr,
    CombinedFile,
    ActorFile,
}

/// One `-l/--log-level` occurrence: either `LEVEL` (all devices) or
/// `device=LEVEL`.
#[derive(Debug, Clone)]
pub struct LogLevelSpec {
    pub device: Option<LogDevice>,
    pub level: LevelFilter,
}

fn parse_non_negative(value: &str) -> Result<u64, String> {
    value
        .parse()
        .map_err(|_| format!("{value} must be zero or a positive int value"))
}

fn parse_port(value: &str) -> Result<u16, String> {
    let port: u32 = value
        .parse()
        .map_err(|_| format!("{value} must be in port range 1024-65535"))?;
    if !(1024..=65535).contains(&port) {
        return Err(format!("{value} must be in port range 1024-65535"));
    }
    Ok(port as u16)
}

fn parse_level(value: &str) -> Result<LevelFilter, String> {
    if value.eq_ignore_ascii_case("none") {
        return Ok(LevelFilter::Off);
    }
    value
        .parse()
        .map_err(|_| format!("{value} is not a log level"))
}

fn parse_log_level(value: &str) -> Result<LogLevelSpec, String> {
    match value.split_once('=') {
        None => Ok(LogLevelSpec {
            device: None,
            level: parse_level(value)?,
        }),
        Some((device, level)) => {
            let device = match device.to_ascii_lowercase().as_str() {
                "stderr" => LogDevice::Stderr,
                "combined_file" => LogDevice::CombinedFile,
                "actor_file" => LogDevice::ActorFile,
                other => return Err(format!("{other} is not a log output device")),
            };
            Ok(LogLevelSpec {
                device: Some(device),
                level: parse_level(level)?,
            })
        }
    }
}

/// Launcher arguments and options.
#[derive(Debug, Parser)]
#[command(name = "shepd", version, about = "Distributed runtime launcher")]
pub struct LaunchArgs {
    /// Number of nodes to use; zero means all nodes in the allocation.
    #[arg(short = 'N', long = "nodes", value_name = "NODE_COUNT", value_parser = parse_non_negative)]
    pub node_count: Option<u64>,

    /// Backend hostnames as a comma-separated list. Required for the SSH
    /// workload manager unless a hostfile or network configuration is
    /// given.
    #[arg(long, value_name = "HOSTLIST", value_delimiter = ',', conflicts_with = "hostfile")]
    pub hostlist: Option<Vec<String>>,

    /// File with one backend hostname per line. Required for the SSH
    /// workload manager unless a hostlist or network configuration is
    /// given.
    #[arg(long, value_name = "HOSTFILE")]
    pub hostfile: Option<PathBuf>,

    /// Network prefix used to pick the interfaces for multinode
    /// connections.
    #[arg(long, value_name = "NETWORK_PREFIX")]
    pub network_prefix: Option<String>,

    /// Network configuration file describing the backend compute nodes.
    #[arg(long, value_name = "NETWORK_CONFIG")]
    pub network_config: Option<PathBuf>,

    /// Workload manager in use.
    #[arg(short = 'w', long, value_name = "WORKLOAD_MANAGER", value_enum)]
    pub wlm: Option<Wlm>,

    /// Port used for multinode communication.
    #[arg(short = 'p', long, value_name = "PORT", value_parser = parse_port, default_value_t = DEFAULT_PORT)]
    pub port: u16,

    /// Transport agent for backend node-to-node communication.
    #[arg(short = 't', long, value_name = "TRANSPORT_AGENT", value_enum, default_value_t = Transport::Tcp)]
    pub transport: Transport,

    /// Force the single-node launcher.
    #[arg(short = 's', long, conflicts_with = "multi_node_override")]
    pub single_node_override: bool,

    /// Force the multi-node launcher.
    #[arg(short = 'm', long)]
    pub multi_node_override: bool,

    /// Log verbosity, as LEVEL or device=LEVEL; may be repeated.
    #[arg(short = 'l', long = "log-level", value_name = "LOG_LEVEL", value_parser = parse_log_level, action = ArgAction::Append)]
    pub log_level: Vec<LogLevelSpec>,

    /// Do not label forwarded output lines. This is already the default;
    /// the flag is accepted for compatibility.
    #[arg(long)]
    pub no_label: bool,

    /// Label forwarded output lines with the source process.
    #[arg(long)]
    pub basic_label: bool,

    /// Label forwarded output lines with process, pid, and hostname.
    #[arg(long)]
    pub verbose_label: bool,

    /// Program to run on the primary compute node.
    #[arg(value_name = "PROG")]
    pub prog: Option<String>,

    /// Arguments passed to PROG.
    #[arg(value_name = "ARG", trailing_var_arg = true, allow_hyphen_values = true)]
    pub args: Vec<String>,
}

/// The settled launch configuration after cross-flag rules are applied.
#[derive(Debug)]
pub struct ResolvedLaunch {
    pub node_count: u64,
    pub hosts: Option<NonEmpty<String>>,
    pub network_prefix: Option<String>,
    pub network_config: Option<PathBuf>,
    pub wlm: Option<Wlm>,
    pub port: u16,
    pub transport: Transport,
    pub single_node_override: bool,
    pub multi_node_override: bool,
    pub log_device_level_map: HashMap<LogDevice, LevelFilter>,
    pub no_label: bool,
    pub basic_label: bool,
    pub verbose_label: bool,
    /// Head program and its arguments, when one was given.
    pub head_proc: Option<(NonEmptyString, Vec<String>)>,
}

impl LaunchArgs {
    /// Applies the cross-flag rules: label verbosity overrides `no-label`,
    /// SSH needs hosts, and the head program name must be non-empty.
    pub fn resolve(self) -> Result<ResolvedLaunch> {
        // no-label defaults on, whether or not the flag was given, and is
        // switched off by either label flag.
        let no_label = !(self.basic_label || self.verbose_label);

        let hosts = match (&self.hostlist, &self.hostfile) {
            (None, None) => {
                if self.wlm == Some(Wlm::Ssh) && self.network_config.is_none() {
                    bail!(
                        "When using WLM SSH, hostlist, hostfile, or existing network \
                         configuration is required."
                    );
                }
                None
            }
            (hostlist, hostfile) => {
                let hostlist = hostlist.as_ref().map(|hosts| {
                    hosts.iter().map(|h| h.trim().to_string()).collect()
                });
                Some(parse_hosts(hostlist, hostfile.as_deref())?)
            }
        };

        let mut log_device_level_map = HashMap::new();
        for spec in &self.log_level {
            match spec.device {
                Some(device) => {
                    log_device_level_map.insert(device, spec.level);
                }
                None => {
                    for device in [
                        LogDevice::Stderr,
                        LogDevice::CombinedFile,
                        LogDevice::ActorFile,
                    ] {
                        log_device_level_map.insert(device, spec.level);
                    }
                }
            }
        }

        let head_proc = match self.prog {
            None => None,
            Some(prog) => Some((
                NonEmptyString::new(prog)
                    .map_err(|_| anyhow::anyhow!("PROG cannot be empty"))?,
                self.args.clone(),
            )),
        };

        Ok(ResolvedLaunch {
            node_count: self.node_count.unwrap_or(0),
            hosts,
            network_prefix: self.network_prefix,
            network_config: self.network_config,
            wlm: self.wlm,
            port: self.port,
            transport: self.transport,
            single_node_override: self.single_node_override,
            multi_node_override: self.multi_node_override,
            log_device_level_map,
            no_label,
            basic_label: self.basic_label,
            verbose_label: self.verbose_label,
            head_proc,
        })
    }
}

/// Confirms a hostname conforms to POSIX rules: at most 255 characters,
/// labels of 1-63 alphanumerics or hyphens with no hyphen at either end,
/// and at most one trailing dot.
pub fn is_hostname_valid(hostname: &str) -> bool {
    if hostname.is_empty() || hostname.len() > 255 {
        return false;
    }
    let hostname = hostname.strip_suffix('.').unwrap_or(hostname);
    if hostname.is_empty() {
        return false;
    }
    hostname.split('.').all(|label| {
        !label.is_empty()
            && label.len() <= 63
            && !label.starts_with('-')
            && !label.ends_with('-')
            && label.bytes().all(|b| b.is_ascii_alphanumeric() || b == b'-')
    })
}

/// Reads the hostfile if one was given, and checks that every hostname
/// makes sense.
///
/// # Arguments
///
/// * `hostlist` - Hostnames already split from the command line.
/// * `hostfile` - File with one hostname per line; wins over `hostlist`.
///
/// # Errors
///
/// Returns an error if the hostfile cannot be read, any hostname fails
/// validation, or no hostnames are left at all.
pub fn parse_hosts(
    hostlist: Option<Vec<String>>,
    hostfile: Option<&Path>,
) -> Result<NonEmpty<String>> {
    let hostlist = match hostfile {
        Some(hostfile) => {
            let contents = std::fs::read_to_string(hostfile)
                .with_context(|| format!("Unable to parse {}", hostfile.display()))?;
            contents
                .lines()
                .map(str::trim)
                .filter(|line| !line.is_empty())
                .map(ToString::to_string)
                .collect()
        }
        None => hostlist.unwrap_or_default(),
    };

    for host in &hostlist {
        if !is_hostname_valid(host) {
            bail!("Hostname is invalid: {host}");
        }
    }

    NonEmpty::from_vec(hostlist).context("no hostnames were given")
}

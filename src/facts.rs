//! Runtime-wide identifiers, environment conventions, and timing constants.
//!
//! Every actor in the runtime derives the same uids from the same node index,
//! so the derivation functions here must stay in lockstep with the front end.

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::time::Duration;

/// Logical process id of the Global Services control plane.
pub const GS_PUID: u64 = 2;

/// Channel uid of the Global Services inbound endpoint.
pub const GS_INPUT_CUID: u64 = 2;

/// First uid in the per-node transport agent puid range.
pub const FIRST_TRANSPORT_PUID: u64 = 4;

/// Maximum number of nodes an allocation may span; bounds all per-node uid
/// ranges below.
pub const MAX_NODES: u64 = 4096;

const BASE_BE_CUID: u64 = 16;
const BASE_SHEP_CUID: u64 = 16 + MAX_NODES;
const BASE_PMOD_LAUNCH_CUID: u64 = 1 << 32;
const BASE_INFRASTRUCTURE_MUID: u64 = 4;
const BASE_DEFAULT_MUID: u64 = 4 + MAX_NODES;

/// Poll/select granularity for all worker loops; bounds shutdown latency.
pub const SHUTDOWN_RESP_TIMEOUT: Duration = Duration::from_millis(10);

/// Join timeout for worker threads during the terminal sequence.
pub const QUIESCE_TIME: Duration = Duration::from_secs(1);

/// How long `cleanup` waits for a killed child to be reaped.
pub const CLEANUP_CHILD_WAIT: Duration = Duration::from_secs(10);

/// Environment variable carrying the stdout channel descriptor inherited by
/// child processes.
pub const STDOUT_DESC: &str = "STDOUT_DESC";

/// Environment variable carrying the stderr channel descriptor inherited by
/// child processes.
pub const STDERR_DESC: &str = "STDERR_DESC";

/// Environment variable carrying the per-rank PMI wire-up channel descriptor.
pub const PMOD_CHILD_CHANNEL: &str = "DRAGON_PMOD_CHILD_CHANNEL";

/// Prefix for gateway channel descriptor registrations; the full name is the
/// prefix followed by a 1-based index.
pub const GW_ENV_PREFIX: &str = "LS_GW_";

/// Environment variable holding this node's index within the allocation.
pub const NODE_INDEX_VAR: &str = "LS_NODE_INDEX";

/// Node-local environment variables that must never leak into children
/// through a caller-supplied environment.
pub const NODE_LOCAL_PARAMS: &[&str] = &[
    NODE_INDEX_VAR,
    "LS_HOSTNAME",
    "LS_DEFAULT_POOL",
    "LS_INF_POOL",
    "LS_GW_COUNT",
];

/// Index of this node within the allocation, taken from the environment.
/// Unset means a single-node layout, index 0.
pub fn node_index() -> u64 {
    std::env::var(NODE_INDEX_VAR)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(0)
}

/// Channel uid of the launcher back-end endpoint on the given node.
pub const fn launcher_cuid_from_index(index: u64) -> u64 {
    BASE_BE_CUID + index
}

/// Channel uid of the Local Services inbound endpoint on the given node.
pub const fn shepherd_cuid_from_index(index: u64) -> u64 {
    BASE_SHEP_CUID + index
}

/// Memory pool uid of the infrastructure pool on the given node.
pub const fn infrastructure_pool_muid_from_index(index: u64) -> u64 {
    BASE_INFRASTRUCTURE_MUID + index
}

/// Memory pool uid of the default (user) pool on the given node.
pub const fn default_pool_muid_from_index(index: u64) -> u64 {
    BASE_DEFAULT_MUID + index
}

/// Whether the puid identifies a transport agent process.
pub const fn is_transport_puid(p_uid: u64) -> bool {
    p_uid >= FIRST_TRANSPORT_PUID && p_uid < FIRST_TRANSPORT_PUID + MAX_NODES
}

/// Channel uid of the PMI wire-up channel for one local rank of one job on
/// one host. Deterministic so the front end and the node agent agree without
/// coordination.
pub fn pmod_launch_cuid_from_jobinfo(host_id: u64, job_id: u64, lrank: u64) -> u64 {
    let mut h = DefaultHasher::new();
    host_id.hash(&mut h);
    job_id.hash(&mut h);
    BASE_PMOD_LAUNCH_CUID + ((h.finish() % (1 << 24)) << 8) + lrank
}

/// Stable numeric id of this host, derived from the hostname.
pub fn host_id() -> u64 {
    let name = nix::unistd::gethostname().unwrap_or_default();
    let mut h = DefaultHasher::new();
    name.hash(&mut h);
    h.finish()
}

/// Hostname of this node, or "NONE" when it cannot be determined.
pub fn hostname() -> String {
    nix::unistd::gethostname()
        .map(|h| h.to_string_lossy().into_owned())
        .unwrap_or_else(|_| "NONE".to_string())
}

/// Encodes a serialized pool or channel as a transportable descriptor
/// string. The descriptor is the only way a remote party can attach.
pub fn b64_encode(bytes: &[u8]) -> String {
    STANDARD.encode(bytes)
}

/// Decodes a descriptor string back into serialized bytes.
pub fn b64_decode(desc: &str) -> Result<Vec<u8>, base64::DecodeError> {
    STANDARD.decode(desc)
}

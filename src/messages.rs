//! Control-plane message taxonomy.
//!
//! Every message is a JSON object tagged by `_tc` and carrying a
//! producer-assigned `tag`. Responses echo `ref = request.tag` plus an
//! `err` of `SUCCESS` or `FAIL` (with `err_info` on failure).

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};

static TAG: AtomicU64 = AtomicU64::new(0);

/// Returns the next message tag. Tags are monotonic per producer process.
pub fn next_tag() -> u64 {
    TAG.fetch_add(1, Ordering::Relaxed)
}

/// Response outcome.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RespErr {
    Success,
    Fail,
}

/// Requested disposition for one of a child's standard streams.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum StdioReq {
    /// Pipe the stream through the node agent.
    #[default]
    Pipe,
    /// Hand the OS a /dev/null disposition.
    Devnull,
    /// Merge stderr into stdout. Only meaningful for stderr.
    Stdout,
}

/// Options for channel creation.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChannelOptions {
    #[serde(default)]
    pub capacity: Option<usize>,
    #[serde(default)]
    pub block_size: Option<usize>,
}

/// PMI job description for an MPI rank launched through the node agent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PmiInfo {
    pub job_id: u64,
    /// Local rank on this node.
    pub lrank: u64,
    /// Ranks per node.
    pub ppn: u64,
    /// This node's id within the job.
    pub nid: u64,
    pub nnodes: u64,
    pub nranks: u64,
    pub nidlist: Vec<u64>,
    pub hostlist: Vec<String>,
    pub control_port: u16,
    pub pid_base: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PoolCreate {
    pub tag: u64,
    pub r_c_uid: u64,
    pub m_uid: u64,
    pub size: u64,
    pub name: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PoolCreateResponse {
    pub tag: u64,
    pub r#ref: u64,
    pub err: RespErr,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub desc: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub err_info: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PoolDestroy {
    pub tag: u64,
    pub r_c_uid: u64,
    pub m_uid: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PoolDestroyResponse {
    pub tag: u64,
    pub r#ref: u64,
    pub err: RespErr,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub err_info: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChannelCreate {
    pub tag: u64,
    pub r_c_uid: u64,
    pub c_uid: u64,
    pub m_uid: u64,
    #[serde(default)]
    pub options: ChannelOptions,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChannelCreateResponse {
    pub tag: u64,
    pub r#ref: u64,
    pub err: RespErr,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub desc: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub err_info: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChannelDestroy {
    pub tag: u64,
    pub r_c_uid: u64,
    pub c_uid: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChannelDestroyResponse {
    pub tag: u64,
    pub r#ref: u64,
    pub err: RespErr,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub err_info: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProcessCreate {
    pub tag: u64,
    pub r_c_uid: u64,
    /// Target logical process id, assigned by the requester.
    pub t_p_uid: u64,
    pub exe: String,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub env: HashMap<String, String>,
    #[serde(default)]
    pub rundir: String,
    #[serde(default)]
    pub stdin: StdioReq,
    #[serde(default)]
    pub stdout: StdioReq,
    #[serde(default)]
    pub stderr: StdioReq,
    /// Channel to create and wire to the child's stdin.
    #[serde(default)]
    pub stdin_msg: Option<ChannelCreate>,
    /// Channel to create and wire to the child's stdout.
    #[serde(default)]
    pub stdout_msg: Option<ChannelCreate>,
    /// Channel to create and wire to the child's stderr.
    #[serde(default)]
    pub stderr_msg: Option<ChannelCreate>,
    /// Text written to the child's stdin right after spawn, newline
    /// terminated.
    #[serde(default)]
    pub initial_stdin: String,
    #[serde(default)]
    pub pmi_info: Option<PmiInfo>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProcessCreateResponse {
    pub tag: u64,
    pub r#ref: u64,
    pub err: RespErr,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub err_info: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stdin_resp: Option<ChannelCreateResponse>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stdout_resp: Option<ChannelCreateResponse>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stderr_resp: Option<ChannelCreateResponse>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProcessKill {
    pub tag: u64,
    pub r_c_uid: u64,
    pub t_p_uid: u64,
    /// Signal number to deliver.
    pub sig: i32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProcessKillResponse {
    pub tag: u64,
    pub r#ref: u64,
    pub err: RespErr,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub err_info: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProcessExit {
    pub tag: u64,
    pub p_uid: u64,
    pub exit_code: i32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FwdInput {
    pub tag: u64,
    pub r_c_uid: u64,
    pub t_p_uid: u64,
    pub input: String,
    #[serde(default)]
    pub confirm: bool,
}

impl FwdInput {
    /// Largest accepted stdin payload; longer payloads are truncated.
    pub const MAX: usize = 1024;
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FwdInputErr {
    pub tag: u64,
    pub r#ref: u64,
    pub err: RespErr,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub err_info: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FwdOutput {
    pub tag: u64,
    /// Node index of the emitting agent.
    pub idx: u64,
    pub p_uid: u64,
    pub data: String,
    /// 1 for stdout, 2 for stderr.
    pub fd_num: u8,
    pub pid: u32,
    pub hostname: String,
}

impl FwdOutput {
    /// Largest read, and therefore largest `data` payload, per frame.
    pub const MAX: usize = 1024;
    pub const FD_STDOUT: u8 = 1;
    pub const FD_STDERR: u8 = 2;
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AbnormalTermination {
    pub tag: u64,
    pub err_info: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GSHalted {
    pub tag: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Teardown {
    pub tag: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HaltTA {
    pub tag: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TAHalted {
    pub tag: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HaltBE {
    pub tag: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DumpState {
    pub tag: u64,
    #[serde(default)]
    pub filename: Option<PathBuf>,
}

/// The full control-plane taxonomy, dispatched on the `_tc` wire tag.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "_tc")]
pub enum Message {
    PoolCreate(PoolCreate),
    PoolCreateResponse(PoolCreateResponse),
    PoolDestroy(PoolDestroy),
    PoolDestroyResponse(PoolDestroyResponse),
    ChannelCreate(ChannelCreate),
    ChannelCreateResponse(ChannelCreateResponse),
    ChannelDestroy(ChannelDestroy),
    ChannelDestroyResponse(ChannelDestroyResponse),
    ProcessCreate(ProcessCreate),
    ProcessCreateResponse(ProcessCreateResponse),
    ProcessKill(ProcessKill),
    ProcessKillResponse(ProcessKillResponse),
    ProcessExit(ProcessExit),
    FwdInput(FwdInput),
    FwdInputErr(FwdInputErr),
    FwdOutput(FwdOutput),
    AbnormalTermination(AbnormalTermination),
    GSHalted(GSHalted),
    Teardown(Teardown),
    HaltTA(HaltTA),
    TAHalted(TAHalted),
    HaltBE(HaltBE),
    DumpState(DumpState),
}

impl Message {
    /// Return-channel uid of the originator, for requests that expect their
    /// response routed somewhere.
    pub fn r_c_uid(&self) -> Option<u64> {
        match self {
            Self::PoolCreate(m) => Some(m.r_c_uid),
            Self::PoolDestroy(m) => Some(m.r_c_uid),
            Self::ChannelCreate(m) => Some(m.r_c_uid),
            Self::ChannelDestroy(m) => Some(m.r_c_uid),
            Self::ProcessCreate(m) => Some(m.r_c_uid),
            Self::ProcessKill(m) => Some(m.r_c_uid),
            Self::FwdInput(m) => Some(m.r_c_uid),
            _ => None,
        }
    }

    /// Serializes for the wire.
    pub fn serialize(&self) -> String {
        // A message that came from our own constructors always serializes.
        serde_json::to_string(self).expect("message serialization")
    }
}

/// Parses one wire frame into a message.
pub fn parse(text: &str) -> Result<Message, serde_json::Error> {
    serde_json::from_str(text)
}

impl PoolCreateResponse {
    pub fn success(r#ref: u64, desc: String) -> Message {
        Message::PoolCreateResponse(Self {
            tag: next_tag(),
            r#ref,
            err: RespErr::Success,
            desc: Some(desc),
            err_info: None,
        })
    }

    pub fn fail(r#ref: u64, err_info: String) -> Message {
        Message::PoolCreateResponse(Self {
            tag: next_tag(),
            r#ref,
            err: RespErr::Fail,
            desc: None,
            err_info: Some(err_info),
        })
    }
}

impl PoolDestroyResponse {
    pub fn success(r#ref: u64) -> Message {
        Message::PoolDestroyResponse(Self {
            tag: next_tag(),
            r#ref,
            err: RespErr::Success,
            err_info: None,
        })
    }

    pub fn fail(r#ref: u64, err_info: String) -> Message {
        Message::PoolDestroyResponse(Self {
            tag: next_tag(),
            r#ref,
            err: RespErr::Fail,
            err_info: Some(err_info),
        })
    }
}

impl ChannelCreateResponse {
    pub fn success(r#ref: u64, desc: String) -> Self {
        Self {
            tag: next_tag(),
            r#ref,
            err: RespErr::Success,
            desc: Some(desc),
            err_info: None,
        }
    }

    pub fn fail(r#ref: u64, err_info: String) -> Self {
        Self {
            tag: next_tag(),
            r#ref,
            err: RespErr::Fail,
            desc: None,
            err_info: Some(err_info),
        }
    }
}

impl ChannelDestroyResponse {
    pub fn success(r#ref: u64) -> Message {
        Message::ChannelDestroyResponse(Self {
            tag: next_tag(),
            r#ref,
            err: RespErr::Success,
            err_info: None,
        })
    }

    pub fn fail(r#ref: u64, err_info: String) -> Message {
        Message::ChannelDestroyResponse(Self {
            tag: next_tag(),
            r#ref,
            err: RespErr::Fail,
            err_info: Some(err_info),
        })
    }
}

impl ProcessCreateResponse {
    pub fn success(
        r#ref: u64,
        stdin_resp: Option<ChannelCreateResponse>,
        stdout_resp: Option<ChannelCreateResponse>,
        stderr_resp: Option<ChannelCreateResponse>,
    ) -> Message {
        Message::ProcessCreateResponse(Self {
            tag: next_tag(),
            r#ref,
            err: RespErr::Success,
            err_info: None,
            stdin_resp,
            stdout_resp,
            stderr_resp,
        })
    }

    pub fn fail(r#ref: u64, err_info: String) -> Message {
        Message::ProcessCreateResponse(Self {
            tag: next_tag(),
            r#ref,
            err: RespErr::Fail,
            err_info: Some(err_info),
            stdin_resp: None,
            stdout_resp: None,
            stderr_resp: None,
        })
    }
}

impl ProcessKillResponse {
    pub fn success(r#ref: u64) -> Message {
        Message::ProcessKillResponse(Self {
            tag: next_tag(),
            r#ref,
            err: RespErr::Success,
            err_info: None,
        })
    }

    pub fn fail(r#ref: u64, err_info: String) -> Message {
        Message::ProcessKillResponse(Self {
            tag: next_tag(),
            r#ref,
            err: RespErr::Fail,
            err_info: Some(err_info),
        })
    }
}

impl FwdInputErr {
    pub fn success(r#ref: u64) -> Message {
        Message::FwdInputErr(Self {
            tag: next_tag(),
            r#ref,
            err: RespErr::Success,
            err_info: None,
        })
    }

    pub fn fail(r#ref: u64, err_info: String) -> Message {
        Message::FwdInputErr(Self {
            tag: next_tag(),
            r#ref,
            err: RespErr::Fail,
            err_info: Some(err_info),
        })
    }
}

impl ProcessExit {
    pub fn new(p_uid: u64, exit_code: i32) -> Message {
        Message::ProcessExit(Self {
            tag: next_tag(),
            p_uid,
            exit_code,
        })
    }
}

impl AbnormalTermination {
    pub fn new(err_info: String) -> Message {
        Message::AbnormalTermination(Self {
            tag: next_tag(),
            err_info,
        })
    }
}

impl HaltBE {
    pub fn new() -> Message {
        Message::HaltBE(Self { tag: next_tag() })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    mod next_tag {
        use super::*;

        #[test]
        fn monotonic() {
            let a = next_tag();
            let b = next_tag();
            assert!(b > a);
        }
    }

    mod parse {
        use super::*;

        #[test]
        fn channel_create_round_trip() {
            let msg = Message::ChannelCreate(ChannelCreate {
                tag: 5,
                r_c_uid: 2,
                c_uid: 77,
                m_uid: 4,
                options: ChannelOptions {
                    capacity: Some(16),
                    block_size: None,
                },
            });
            let wire = msg.serialize();
            assert!(wire.contains("\"_tc\":\"ChannelCreate\""));
            assert_eq!(parse(&wire).unwrap(), msg);
        }

        #[test]
        fn response_echoes_ref_on_the_wire() {
            let wire = PoolCreateResponse::success(42, "abc".to_string()).serialize();
            assert!(wire.contains("\"ref\":42"));
            assert!(wire.contains("\"err\":\"SUCCESS\""));
        }

        #[test]
        fn failure_carries_err_info() {
            let wire = PoolCreateResponse::fail(9, "m_uid=1 already in use".to_string()).serialize();
            assert!(wire.contains("\"err\":\"FAIL\""));
            assert!(wire.contains("already in use"));
            let Message::PoolCreateResponse(resp) = parse(&wire).unwrap() else {
                panic!("wrong variant");
            };
            assert_eq!(resp.err, RespErr::Fail);
            assert_eq!(resp.desc, None);
        }

        #[test]
        fn unknown_type_code_fails() {
            assert!(parse(r#"{"_tc":"NoSuchThing","tag":1}"#).is_err());
        }

        #[test]
        fn malformed_json_fails() {
            assert!(parse("{not json").is_err());
        }

        #[test]
        fn process_create_defaults() {
            let wire = r#"{"_tc":"ProcessCreate","tag":1,"r_c_uid":2,"t_p_uid":17,"exe":"/bin/echo"}"#;
            let Message::ProcessCreate(pc) = parse(wire).unwrap() else {
                panic!("wrong variant");
            };
            assert_eq!(pc.stdin, StdioReq::Pipe);
            assert_eq!(pc.stdout, StdioReq::Pipe);
            assert!(pc.args.is_empty());
            assert!(pc.stdout_msg.is_none());
            assert_eq!(pc.initial_stdin, "");
        }

        #[test]
        fn stdio_req_wire_names() {
            let wire = r#"{"_tc":"ProcessCreate","tag":1,"r_c_uid":2,"t_p_uid":17,"exe":"x",
                           "stdout":"DEVNULL","stderr":"STDOUT"}"#;
            let Message::ProcessCreate(pc) = parse(wire).unwrap() else {
                panic!("wrong variant");
            };
            assert_eq!(pc.stdout, StdioReq::Devnull);
            assert_eq!(pc.stderr, StdioReq::Stdout);
        }
    }

    mod r_c_uid {
        use super::*;

        #[test]
        fn requests_have_it() {
            let msg = Message::ProcessKill(ProcessKill {
                tag: 1,
                r_c_uid: 99,
                t_p_uid: 4,
                sig: 9,
            });
            assert_eq!(msg.r_c_uid(), Some(99));
        }

        #[test]
        fn notifications_do_not() {
            assert_eq!(Message::GSHalted(GSHalted { tag: 0 }).r_c_uid(), None);
            assert_eq!(ProcessExit::new(5, 0).r_c_uid(), None);
        }
    }
}

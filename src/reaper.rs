//! The death reaper: a non-blocking wait loop over all children.
//!
//! Every reaped pid is removed from the process table, its exit is
//! announced exactly once, and the uncommanded death of a critical process
//! escalates to abnormal termination.

use crate::facts::{self, SHUTDOWN_RESP_TIMEOUT};
use crate::messages::ProcessExit;
use crate::server::LocalServer;
use log::{info, warn};
use nix::errno::Errno;
use nix::sys::wait::{WaitPidFlag, WaitStatus, waitpid};
use nix::unistd::Pid;
use std::sync::atomic::Ordering;

impl LocalServer {
    /// Worker loop. Exits on the shutdown latch.
    pub(crate) fn watch_death(&self) {
        info!("watch death starting");

        while !self.check_shutdown() {
            match waitpid(Pid::from_raw(-1), Some(WaitPidFlag::WNOHANG)) {
                Ok(WaitStatus::Exited(pid, code)) => self.reap(pid, code),
                Ok(WaitStatus::Signaled(pid, sig, _)) => self.reap(pid, -(sig as i32)),
                Ok(WaitStatus::StillAlive) => std::thread::sleep(SHUTDOWN_RESP_TIMEOUT),
                // Stopped/continued children are not deaths.
                Ok(_) => {}
                Err(Errno::ECHILD) => std::thread::sleep(SHUTDOWN_RESP_TIMEOUT),
                Err(e) => {
                    warn!("waitpid failed: {e}");
                    std::thread::sleep(SHUTDOWN_RESP_TIMEOUT);
                }
            }
        }

        info!("watch death exit");
    }

    fn reap(&self, pid: Pid, exit_code: i32) {
        let pid = pid.as_raw() as u32;
        let record = self.apt.lock().unwrap().remove_by_pid(pid);
        let Some(mut record) = record else {
            warn!("unknown child pid {pid} exited!");
            return;
        };
        record.exited.store(true, Ordering::SeqCst);
        info!("p_uid: {} pid: {pid} ecode={exit_code}", record.p_uid);

        // Global Services' own death has nobody left to notify; everyone
        // else gets exactly one exit notification.
        if record.p_uid != facts::GS_PUID {
            let resp = ProcessExit::new(record.p_uid, exit_code);
            match record.r_c_uid {
                None => {
                    if let Err(e) = self.gs_in.send_str(&resp.serialize()) {
                        warn!("{resp:?} not delivered to gs: {e}");
                    } else {
                        info!("transmit {resp:?} via gs_in");
                    }
                }
                Some(r_c_uid) => {
                    self.send_response(Some(r_c_uid), resp);
                }
            }
        }

        // Uncommanded critical death escalates, unless teardown is already
        // in progress.
        if record.critical && !self.check_shutdown() {
            if record.p_uid == facts::GS_PUID {
                if self.is_primary && !self.check_gs_shutdown() && !self.check_shutdown() {
                    self.abnormal_termination(&format!(
                        "ls watch death - GS exited - puid {}",
                        record.p_uid
                    ));
                }
            } else if facts::is_transport_puid(record.p_uid) {
                if !self.check_ta_shutdown() && !self.check_shutdown() {
                    self.abnormal_termination(&format!(
                        "ls watch death - TA exited - puid {}",
                        record.p_uid
                    ));
                }
            } else {
                self.abnormal_termination(&format!(
                    "ls watch death - critical process exited - puid {}",
                    record.p_uid
                ));
            }
        }

        // The pid was already reaped by waitpid; this only settles the
        // handle's own bookkeeping.
        let _ = record.child.try_wait();

        // The output pump owns the file handles; it deregisters and closes
        // these, never this thread.
        self.exited_outputs.put(record.stdout_connector.clone());
        self.exited_outputs.put(record.stderr_connector.clone());
    }
}

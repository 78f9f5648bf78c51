//! Supervised worker threads.
//!
//! Every worker loop runs under a supervisor closure that catches a panic at
//! the top of the thread and routes it through the abnormal-termination
//! procedure, so a dying worker never fails silently. Shutdown joins are
//! bounded: a worker that does not finish within the deadline is logged and
//! abandoned, never force-killed.

use crate::server::LocalServer;
use anyhow::{Context, Result};
use log::{error, info};
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

pub(crate) struct Supervised {
    name: &'static str,
    handle: JoinHandle<()>,
}

/// Spawns `f` on a named thread holding its own reference to the server.
pub(crate) fn spawn_supervised<F>(
    server: &Arc<LocalServer>,
    name: &'static str,
    f: F,
) -> Result<Supervised>
where
    F: Fn(&LocalServer) + Send + 'static,
{
    let server = Arc::clone(server);
    let handle = std::thread::Builder::new()
        .name(name.to_string())
        .spawn(move || {
            if let Err(payload) = catch_unwind(AssertUnwindSafe(|| f(&server))) {
                let what = panic_message(payload.as_ref());
                error!("worker {name} panicked: {what}");
                server.abnormal_termination(&format!("from {name}: {what}"));
            }
        })
        .with_context(|| format!("failed to create thread {name}"))?;
    Ok(Supervised { name, handle })
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "opaque panic payload".to_string()
    }
}

/// Joins the workers, giving the whole group up to `deadline`. Threads still
/// alive afterwards are logged as hung and left behind.
pub(crate) fn join_with_deadline(workers: Vec<Supervised>, deadline: Duration) {
    let give_up = Instant::now() + deadline;
    let mut pending = workers;

    while !pending.is_empty() && Instant::now() < give_up {
        let (finished, still_running): (Vec<_>, Vec<_>) =
            pending.into_iter().partition(|w| w.handle.is_finished());
        for worker in finished {
            // A panic was already routed through the supervisor.
            let _ = worker.handle.join();
            info!("worker {} joined", worker.name);
        }
        pending = still_running;
        if !pending.is_empty() {
            std::thread::sleep(crate::facts::SHUTDOWN_RESP_TIMEOUT);
        }
    }

    for worker in &pending {
        error!("thread {} seems to have hung!", worker.name);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::minimal_server;

    mod spawn_supervised {
        use super::*;

        #[test]
        fn runs_the_worker() {
            let (server, _guard) = minimal_server(940_001);
            let worker = spawn_supervised(&server, "test-worker", |s| {
                s.set_ta_shutdown();
            })
            .unwrap();
            join_with_deadline(vec![worker], Duration::from_secs(1));
            assert!(server.check_ta_shutdown());
        }

        #[test]
        fn panic_routes_to_abnormal_termination() {
            let (server, guard) = minimal_server(940_002);
            let worker = spawn_supervised(&server, "panicking-worker", |_| {
                panic!("worker is panicking on purpose for testing");
            })
            .unwrap();
            join_with_deadline(vec![worker], Duration::from_secs(1));

            assert!(server.check_shutdown());
            let wire = guard
                .be_out
                .recv_text_timeout(Duration::from_millis(100))
                .unwrap();
            let msg = crate::messages::parse(&wire).unwrap();
            match msg {
                crate::messages::Message::AbnormalTermination(m) => {
                    assert!(m.err_info.contains("panicking-worker"));
                    assert!(m.err_info.contains("on purpose"));
                }
                other => panic!("expected AbnormalTermination, got {other:?}"),
            }
        }
    }

    mod join_with_deadline {
        use super::*;

        #[test]
        fn abandons_hung_threads() {
            let (server, _guard) = minimal_server(940_003);
            let worker = spawn_supervised(&server, "hung-worker", |_| {
                std::thread::sleep(Duration::from_secs(30));
            })
            .unwrap();
            let start = Instant::now();
            join_with_deadline(vec![worker], Duration::from_millis(50));
            assert!(start.elapsed() < Duration::from_secs(5));
        }
    }
}

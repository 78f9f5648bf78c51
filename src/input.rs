//! The input pump: drains inbound channels feeding each child's stdin.
//!
//! The pump keeps a `c_uid`-keyed set of active [`InputConnector`]s and a
//! derived [`ChannelSet`] polling all their inbound endpoints at once. The
//! set is rebuilt whenever connectors arrive or a dead one is discarded.

use crate::channel::{ChannelError, ChannelSet, PollEvent};
use crate::connectors::InputConnector;
use crate::facts::SHUTDOWN_RESP_TIMEOUT;
use crate::server::LocalServer;
use log::info;
use std::collections::HashMap;
use std::sync::Arc;

impl LocalServer {
    /// Worker loop. Exits on the shutdown latch.
    pub(crate) fn watch_input(&self) {
        info!("watch input starting");

        let mut connectors: HashMap<u64, Arc<InputConnector>> = HashMap::new();
        let mut channel_set: Option<ChannelSet> = None;
        let mut dead_connector: Option<Arc<InputConnector>> = None;

        while !self.check_shutdown() {
            let mut changed = false;

            for connector in self.new_inputs.drain() {
                if let Some(c_uid) = connector.c_uid() {
                    connectors.insert(c_uid, connector);
                    changed = true;
                }
            }

            // At most one connector dies per poll round; apply the removal
            // from the previous iteration.
            if let Some(dead) = dead_connector.take() {
                if let Some(c_uid) = dead.c_uid() {
                    connectors.remove(&c_uid);
                }
                changed = true;
            }

            if connectors.is_empty() {
                channel_set = None;
                std::thread::sleep(SHUTDOWN_RESP_TIMEOUT);
                continue;
            }

            if changed || channel_set.is_none() {
                let channels = connectors
                    .values()
                    .filter_map(|c| c.inbound_channel())
                    .collect();
                channel_set = Some(ChannelSet::new(channels));
            }

            // The set was just rebuilt when empty; always present here.
            let Some(set) = channel_set.as_ref() else {
                continue;
            };
            match set.poll(SHUTDOWN_RESP_TIMEOUT) {
                Ok((c_uid, event)) => {
                    let Some(connector) = connectors.get(&c_uid).cloned() else {
                        continue;
                    };

                    let mut eof = false;
                    if event == PollEvent::In {
                        eof = connector.forward();
                    }

                    if eof || event == PollEvent::Nothing || !connector.proc_is_alive() {
                        connector.close();
                        dead_connector = Some(connector);
                    }
                }
                Err(ChannelError::Timeout) => {}
                Err(e) => {
                    // Any other error is likely the child going away under
                    // us; nothing to retire until an event names a member.
                    info!("input connector error: {e}");
                }
            }
        }

        info!("watch input exiting");
    }
}

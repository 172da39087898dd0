//! The Helm - master election for the lease store
//!
//! Decides where lease writes go:
//! - Adopts the master advertised under the master key, if any
//! - Otherwise claims mastership with a TTL-bound key and keeps it alive
//! - Falls back to writing locally when there is nothing to advertise
//!
//! A discovered master is kept for the lifetime of the process.

use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crossbeam::channel::{bounded, select, tick, Sender};
use tracing::{debug, error, info, warn};

use crate::error::{Error, Result};
use crate::store::{Backend, Dialer};

use machine::{DynamicHelmMachine, HelmMachine, HelmMachineEvent};

// Kept apart so the generated code sees std's two-argument `Result`
mod machine {
    use state_machines::state_machine;

    state_machine! {
        name: HelmMachine,
        dynamic: true,
        initial: Unelected,
        states: [Unelected, MasterKnown],
        events {
            claim {
                transition: { from: Unelected, to: MasterKnown }
            }
            adopt {
                transition: { from: Unelected, to: MasterKnown }
            }
        }
    }
}

/// Election parameters
#[derive(Debug, Clone)]
pub struct ElectionOptions {
    /// Address to publish if this process becomes master
    pub advertise: Option<String>,
    /// Key holding the master's address
    pub master_key: String,
    /// Lifetime of the master key
    pub ttl: Duration,
    /// Interval between master key refreshes
    pub refresh: Duration,
}

/// Who receives writes
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Role {
    /// No master known; writes go to the local endpoint
    Unelected,
    /// This process holds the master key
    Leader(String),
    /// Another process holds the master key
    Follower(String),
}

/// Result of master election, owning the write backend
pub struct Helm {
    machine: DynamicHelmMachine<()>,
    role: Role,
    writer: Arc<dyn Backend>,
    heartbeat: Option<Heartbeat>,
}

impl Helm {
    /// Look up the master key on `local` and settle on a write target
    pub fn take(
        local: Arc<dyn Backend>,
        dialer: &dyn Dialer,
        options: &ElectionOptions,
    ) -> Result<Self> {
        let mut machine = HelmMachine::new(()).into_dynamic();

        let master = local
            .get(&options.master_key)
            .map_err(|e| Error::MasterDiscovery(format!("get master key: {}", e)))?;

        if let Some(master) = master {
            info!(master = %master, "routing writes to discovered master");
            let writer = dialer.dial(&master)?;
            machine
                .handle(HelmMachineEvent::Adopt)
                .map_err(|e| Error::ElectionState(format!("{:?}", e)))?;
            return Ok(Self {
                machine,
                role: Role::Follower(master),
                writer,
                heartbeat: None,
            });
        }

        let Some(me) = options.advertise.clone() else {
            debug!(store = local.address(), "no master and nothing to advertise, writing locally");
            return Ok(Self {
                machine,
                role: Role::Unelected,
                writer: local,
                heartbeat: None,
            });
        };

        local
            .set_with_ttl(&options.master_key, &me, options.ttl)
            .map_err(|e| Error::MasterDiscovery(format!("set master key with ttl: {}", e)))?;
        machine
            .handle(HelmMachineEvent::Claim)
            .map_err(|e| Error::ElectionState(format!("{:?}", e)))?;
        info!(advertise = %me, ttl = ?options.ttl, "claimed mastership");

        let heartbeat = Heartbeat::spawn(
            Arc::clone(&local),
            options.master_key.clone(),
            me.clone(),
            options.ttl,
            options.refresh,
        )?;

        Ok(Self {
            machine,
            role: Role::Leader(me),
            writer: local,
            heartbeat: Some(heartbeat),
        })
    }

    pub fn role(&self) -> &Role {
        &self.role
    }

    /// Check if a master (this process or a peer) is known
    pub fn is_master_known(&self) -> bool {
        self.machine.current_state() == "MasterKnown"
    }

    /// Backend that accepts lease writes
    pub fn writer(&self) -> Arc<dyn Backend> {
        Arc::clone(&self.writer)
    }

    /// Stop refreshing the master key; it expires after its TTL
    pub fn shutdown(&mut self) {
        if let Some(mut heartbeat) = self.heartbeat.take() {
            heartbeat.stop();
            info!("stopped refreshing master key");
        }
    }
}

/// Background refresh of the master key
struct Heartbeat {
    stop: Option<Sender<()>>,
    handle: Option<JoinHandle<()>>,
}

impl Heartbeat {
    fn spawn(
        backend: Arc<dyn Backend>,
        key: String,
        value: String,
        ttl: Duration,
        every: Duration,
    ) -> Result<Self> {
        let (stop_tx, stop_rx) = bounded::<()>(0);

        let handle = thread::Builder::new()
            .name("moorage-heartbeat".into())
            .spawn(move || {
                let ticker = tick(every);
                loop {
                    select! {
                        recv(ticker) -> _ => {
                            debug!(key = %key, "setting master key");
                            if let Err(e) = backend.set_with_ttl(&key, &value, ttl) {
                                // Retried on the next tick with a fresh connection
                                error!(error = %e, "set master key");
                            }
                        }
                        recv(stop_rx) -> _ => break,
                    }
                }
            })?;

        Ok(Self {
            stop: Some(stop_tx),
            handle: Some(handle),
        })
    }

    fn stop(&mut self) {
        // Disconnecting the channel wakes the loop
        drop(self.stop.take());
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                warn!("heartbeat thread panicked");
            }
        }
    }
}

impl Drop for Heartbeat {
    fn drop(&mut self) {
        self.stop();
    }
}

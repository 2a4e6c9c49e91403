/// Network availability — polled from the local interfaces and broadcast on a
/// watch channel to the stream gate and the command-channel host.

use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{info, warn};

use crate::stream_gate::StreamGate;

pub struct NetworkMonitor {
    tx: watch::Sender<bool>,
}

impl NetworkMonitor {
    pub fn new(initial: bool) -> Self {
        let (tx, _rx) = watch::channel(initial);
        Self { tx }
    }

    /// `true` when the host has a routable (non-loopback) local address.
    pub fn detect() -> bool {
        match local_ip_address::local_ip() {
            Ok(ip) => is_routable(ip),
            Err(_) => false,
        }
    }

    pub fn subscribe(&self) -> watch::Receiver<bool> {
        self.tx.subscribe()
    }

    pub fn is_available(&self) -> bool {
        *self.tx.borrow()
    }

    /// Publish a new state. Returns whether it changed.
    pub fn set(&self, available: bool) -> bool {
        let changed = self.tx.send_if_modified(|current| {
            if *current == available {
                false
            } else {
                *current = available;
                true
            }
        });
        if changed {
            if available {
                info!("network comes alive");
            } else {
                warn!("network lost");
            }
        }
        changed
    }

    /// Poll `detect` every `interval` until `shutdown` flips to `true`.
    pub async fn run(self: Arc<Self>, interval: Duration, mut shutdown: watch::Receiver<bool>) {
        loop {
            self.set(Self::detect());
            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
                _ = tokio::time::sleep(interval) => {}
            }
        }
    }
}

fn is_routable(ip: IpAddr) -> bool {
    !ip.is_loopback() && !ip.is_unspecified()
}

/// `localhost` or a loopback address literal. Reachable without any network.
pub fn is_loopback_host(host: &str) -> bool {
    host.eq_ignore_ascii_case("localhost")
        || host
            .trim_start_matches('[')
            .trim_end_matches(']')
            .parse::<IpAddr>()
            .is_ok_and(|ip| ip.is_loopback())
}

/// Mirror network state into the stream gate until the monitor goes away or
/// `shutdown` flips.
pub async fn forward_to_gate(
    mut network: watch::Receiver<bool>,
    gate: Arc<StreamGate>,
    mut shutdown: watch::Receiver<bool>,
) {
    gate.set_network_available(*network.borrow_and_update());
    loop {
        tokio::select! {
            changed = network.changed() => {
                if changed.is_err() {
                    break;
                }
                gate.set_network_available(*network.borrow_and_update());
            }
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    break;
                }
            }
        }
    }
}

//! One tokio task per IKE_SA
//!
//! The actor owns its [`IkeSa`] outright. Datagrams, timer expiries and
//! local commands reach it through a bounded inbox and are handled one at a
//! time, which serializes all work on the SA without a lock. After every
//! event the actor carries out the [`Effect`]s the SA asked for.

use std::net::SocketAddr;
use std::sync::Arc;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use super::daemon::Runtime;
use super::ike_sa::{Effect, IkeSa, SaCommand, Timer};
use super::scheduler::Scheduler;
use super::{Error, Result};

/// Event delivered to an IKE_SA actor
#[derive(Debug)]
pub enum SaEvent {
    /// IKE datagram routed to this SA
    Packet {
        /// Message bytes, without the non-ESP marker
        data: Vec<u8>,
        /// Peer address
        from: SocketAddr,
        /// Local address it arrived on
        to: SocketAddr,
    },
    /// A timer expired
    Timer {
        /// Timer kind
        timer: Timer,
        /// Generation it was armed with
        generation: u64,
    },
    /// Local request
    Command(SaCommand),
}

/// Address of a running IKE_SA actor
#[derive(Debug, Clone)]
pub struct SaHandle {
    local_spi: [u8; 8],
    tx: mpsc::Sender<SaEvent>,
}

impl SaHandle {
    /// Our SPI of the IKE_SA
    pub fn local_spi(&self) -> [u8; 8] {
        self.local_spi
    }

    /// Deliver an event, waiting for inbox space
    ///
    /// # Errors
    ///
    /// Returns `SaNotFound` if the actor has exited.
    pub async fn send(&self, event: SaEvent) -> Result<()> {
        self.tx.send(event).await.map_err(|_| self.gone())
    }

    /// Deliver an event if the inbox has room
    ///
    /// # Errors
    ///
    /// Returns `SaNotFound` if the actor has exited and `TemporaryFailure`
    /// if its inbox is full.
    pub fn try_send(&self, event: SaEvent) -> Result<()> {
        self.tx.try_send(event).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => Error::TemporaryFailure,
            mpsc::error::TrySendError::Closed(_) => self.gone(),
        })
    }

    /// Whether the actor is still running
    pub fn is_alive(&self) -> bool {
        !self.tx.is_closed()
    }

    fn gone(&self) -> Error {
        Error::SaNotFound(hex::encode(self.local_spi))
    }
}

struct SaActor {
    sa: IkeSa,
    rx: mpsc::Receiver<SaEvent>,
    scheduler: Scheduler,
    runtime: Arc<Runtime>,
}

/// Register `sa` and start its actor
///
/// The SA is registered before the task starts, so datagrams that arrive
/// right after its first message is sent already find it.
pub(crate) fn spawn(
    runtime: Arc<Runtime>,
    sa: IkeSa,
    half_open_key: Option<(SocketAddr, [u8; 8])>,
) -> SaHandle {
    let (tx, rx) = mpsc::channel(runtime.settings.inbox_capacity);
    let local_spi = sa.local_spi();
    let handle = SaHandle {
        local_spi,
        tx: tx.clone(),
    };

    runtime
        .manager
        .register(local_spi, handle.clone(), half_open_key);
    if sa.state().is_established() {
        if let Some(identity) = sa.remote_identity() {
            runtime
                .manager
                .authenticated(&local_spi, identity.clone(), false);
        }
    }

    let actor = SaActor {
        sa,
        rx,
        scheduler: Scheduler::new(tx),
        runtime,
    };
    tokio::spawn(actor.run());
    handle
}

/// Tell a replaced IKE_SA to go away
///
/// Waits for inbox space on a separate task, so a busy SA is still
/// discarded and this actor never blocks on another one.
fn discard(handle: SaHandle) -> JoinHandle<()> {
    tokio::spawn(async move {
        if let Err(e) = handle.send(SaEvent::Command(SaCommand::Discard)).await {
            debug!(
                replaced = %hex::encode(handle.local_spi()),
                error = %e,
                "Replaced IKE_SA already gone"
            );
        }
    })
}

impl SaActor {
    async fn run(mut self) {
        if self.apply_effects().await {
            return;
        }

        while let Some(event) = self.rx.recv().await {
            match event {
                SaEvent::Packet { data, from, to } => {
                    if let Err(e) = self.sa.handle_packet(&data, from, to) {
                        debug!(ike_sa = %self.sa.id(), peer = %from, error = %e, "Datagram dropped");
                    }
                }
                SaEvent::Timer { timer, generation } => self.sa.handle_timer(timer, generation),
                SaEvent::Command(command) => {
                    if let Err(e) = self.sa.handle_command(command.clone()) {
                        warn!(ike_sa = %self.sa.id(), ?command, error = %e, "Command rejected");
                    }
                }
            }
            if self.apply_effects().await {
                break;
            }
        }
    }

    /// Carry out pending effects; `true` once the SA is destroyed
    async fn apply_effects(&mut self) -> bool {
        let local_spi = self.sa.local_spi();
        let mut destroyed = false;

        for effect in self.sa.take_effects() {
            match effect {
                Effect::Send { to, from, packet } => {
                    // Lost datagrams are recovered by retransmission
                    let _ = self.runtime.transport.send(to, from, &packet).await;
                }
                Effect::Schedule {
                    timer,
                    generation,
                    after,
                } => self.scheduler.schedule(timer, generation, after),
                Effect::Cancel { timer } => self.scheduler.cancel(timer),
                Effect::Spawn(successor) => {
                    spawn(self.runtime.clone(), *successor, None);
                }
                Effect::Authenticated {
                    remote_id,
                    initial_contact,
                } => {
                    let replaced =
                        self.runtime
                            .manager
                            .authenticated(&local_spi, remote_id, initial_contact);
                    for handle in replaced {
                        debug!(
                            ike_sa = %self.sa.id(),
                            replaced = %hex::encode(handle.local_spi()),
                            "INITIAL_CONTACT replaces older IKE_SA"
                        );
                        discard(handle);
                    }
                }
                Effect::Destroyed { cause } => {
                    debug!(
                        ike_sa = %self.sa.id(),
                        %cause,
                        timers = self.scheduler.pending(),
                        "IKE_SA actor exiting"
                    );
                    self.scheduler.cancel_all();
                    self.runtime.manager.remove(&local_spi);
                    destroyed = true;
                }
            }
        }
        destroyed
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn handle(capacity: usize) -> (SaHandle, mpsc::Receiver<SaEvent>) {
        let (tx, rx) = mpsc::channel(capacity);
        (
            SaHandle {
                local_spi: [7; 8],
                tx,
            },
            rx,
        )
    }

    #[tokio::test]
    async fn test_discard_waits_for_full_inbox() {
        let (handle, mut rx) = handle(1);
        handle.try_send(SaEvent::Command(SaCommand::Dpd)).unwrap();
        assert_eq!(
            handle.try_send(SaEvent::Command(SaCommand::Dpd)),
            Err(Error::TemporaryFailure)
        );

        let pending = discard(handle);
        assert!(matches!(
            rx.recv().await,
            Some(SaEvent::Command(SaCommand::Dpd))
        ));
        assert!(matches!(
            rx.recv().await,
            Some(SaEvent::Command(SaCommand::Discard))
        ));
        pending.await.unwrap();
    }

    #[tokio::test]
    async fn test_discard_of_exited_actor() {
        let (handle, rx) = handle(1);
        drop(rx);
        assert!(!handle.is_alive());
        discard(handle).await.unwrap();
    }
}

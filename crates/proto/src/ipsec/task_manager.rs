//! Per-IKE_SA exchange scheduling
//!
//! IKEv2 runs one request of ours and one request of the peer's in parallel
//! (window size 1, RFC 7296 Section 2.3). The [`TaskManager`] owns both
//! halves:
//!
//! - **Initiating**: queued tasks are batched into exchanges and sent one at
//!   a time under increasing message IDs. The request is retransmitted with
//!   backoff until the matching response arrives or the budget runs out.
//! - **Responding**: the peer's requests must arrive in message ID order.
//!   The last response is cached and replayed verbatim when the same request
//!   is retransmitted.

use std::collections::VecDeque;
use std::mem;
use std::net::SocketAddr;

use sha2::{Digest, Sha256};
use tracing::debug;

use super::config::RetransmitConfig;
use super::ike_sa::{DestroyCause, IkeSaCore, IkeSaState, Timer};
use super::ikev2::{
    constants::ExchangeType,
    message::{IkeHeader, IkeMessage},
    payload::{IkePayload, NotifyPayload},
};
use super::logging;
use super::task::{notify_for, responder_plan, Inbound, Task, TaskStatus};
use super::{Error, Result};

/// Request in flight
struct Exchange {
    message_id: u32,
    exchange: ExchangeType,
    packet: Vec<u8>,
    retransmitted: u32,
    policy: RetransmitConfig,
    tasks: Vec<Task>,
}

/// Last response sent, for retransmitted requests
struct CachedResponse {
    message_id: u32,
    digest: [u8; 32],
    packet: Vec<u8>,
}

#[derive(Default)]
struct Responding {
    expected: u32,
    last: Option<CachedResponse>,
}

/// Exchange state of one IKE_SA
#[derive(Default)]
pub(crate) struct TaskManager {
    next_message_id: u32,
    initiating: Option<Exchange>,
    responding: Responding,
    queued: VecDeque<Task>,
}

impl TaskManager {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn queue(&mut self, task: Task) {
        self.queued.push_back(task);
    }

    /// No request of ours is outstanding
    pub(crate) fn is_idle(&self) -> bool {
        self.initiating.is_none()
    }

    pub(crate) fn next_message_id(&self) -> u32 {
        self.next_message_id
    }

    pub(crate) fn expected_message_id(&self) -> u32 {
        self.responding.expected
    }

    pub(crate) fn retransmissions(&self) -> Option<u32> {
        self.initiating.as_ref().map(|ex| ex.retransmitted)
    }

    /// Abort everything, in flight and queued
    pub(crate) fn clear(&mut self, core: &mut IkeSaCore) {
        if let Some(mut exchange) = self.initiating.take() {
            for task in &mut exchange.tasks {
                task.abort(core);
            }
        }
        for mut task in self.queued.drain(..) {
            task.abort(core);
        }
    }

    /// Take every queued task except IKE_SA deletes
    pub(crate) fn take_queued(&mut self) -> VecDeque<Task> {
        let (deletes, rest) = mem::take(&mut self.queued)
            .into_iter()
            .partition(|t| matches!(t, Task::IkeDelete(_)));
        self.queued = deletes;
        rest
    }

    /// An IKE_SA delete is queued or in flight
    pub(crate) fn has_delete(&self) -> bool {
        let is_delete = |t: &Task| matches!(t, Task::IkeDelete(_));
        self.queued.iter().any(is_delete)
            || self
                .initiating
                .as_ref()
                .is_some_and(|ex| ex.tasks.iter().any(is_delete))
    }

    /// Start the next exchange if none is in flight
    pub(crate) fn initiate(&mut self, core: &mut IkeSaCore) {
        while self.initiating.is_none()
            && core.state != IkeSaState::Destroyed
            && core.destroy_requested.is_none()
        {
            let Some(tasks) = self.next_batch(core) else {
                return;
            };
            let exchange = tasks[0].exchange(core);
            let message_id = self.next_message_id;
            self.launch(core, exchange, message_id, tasks);
        }
    }

    fn next_batch(&mut self, core: &IkeSaCore) -> Option<Vec<Task>> {
        if core.state == IkeSaState::Deleting {
            let pos = self
                .queued
                .iter()
                .position(|t| matches!(t, Task::IkeDelete(_)))?;
            return self.queued.remove(pos).map(|t| vec![t]);
        }

        let first = self.queued.pop_front()?;
        let exchange = first.exchange(core);
        let mut batch = vec![first];
        if exchange == ExchangeType::IkeAuth {
            let (joined, rest): (VecDeque<Task>, VecDeque<Task>) = mem::take(&mut self.queued)
                .into_iter()
                .partition(|t| t.exchange(core) == ExchangeType::IkeAuth);
            batch.extend(joined);
            self.queued = rest;
        }
        Some(batch)
    }

    /// Build, send and arm retransmission for a request
    fn launch(&mut self, core: &mut IkeSaCore, exchange: ExchangeType, message_id: u32, mut tasks: Vec<Task>) {
        let mut msg = core.new_message(exchange, false, message_id);
        let built = tasks
            .iter_mut()
            .try_for_each(|task| task.build(core, &mut msg));
        let packet = built.and_then(|()| {
            let key = if exchange == ExchangeType::IkeSaInit {
                None
            } else {
                core.sk_out()
            };
            msg.encode(key)
        });

        let packet = match packet {
            Ok(packet) => packet,
            Err(e) => {
                core.note_failure(exchange, &e);
                for task in &mut tasks {
                    task.abort(core);
                }
                if core.state == IkeSaState::Connecting || e.is_fatal() {
                    core.request_destroy(DestroyCause::Failed(e));
                }
                return;
            }
        };

        if exchange == ExchangeType::IkeSaInit {
            core.sent_init = packet.clone();
        }
        let policy = tasks[0].retransmit_policy(core);
        logging::log_exchange_started(&core.id.spi_i, exchange, message_id);
        core.send(packet.clone(), exchange);
        core.schedule(Timer::Retransmit, policy.delay(0));

        self.initiating = Some(Exchange {
            message_id,
            exchange,
            packet,
            retransmitted: 0,
            policy,
            tasks,
        });
    }

    /// Retransmission timer fired
    pub(crate) fn retransmit(&mut self, core: &mut IkeSaCore) {
        let Some(ex) = self.initiating.as_mut() else {
            return;
        };

        if ex.retransmitted >= ex.policy.tries {
            logging::log_peer_unreachable(&core.id.spi_i, core.remote_addr, ex.retransmitted);
            core.services.metrics.record_peer_unreachable();
            if let Some(mut exchange) = self.initiating.take() {
                for task in &mut exchange.tasks {
                    task.abort(core);
                }
            }
            core.request_destroy(DestroyCause::Failed(Error::PeerUnreachable));
            return;
        }

        ex.retransmitted += 1;
        logging::log_retransmit(&core.id.spi_i, ex.exchange, ex.message_id, ex.retransmitted);
        core.services.metrics.record_retransmit();
        let (packet, exchange, delay) = (ex.packet.clone(), ex.exchange, ex.policy.delay(ex.retransmitted));
        core.send(packet, exchange);
        core.schedule(Timer::Retransmit, delay);
    }

    /// Response to our outstanding request
    ///
    /// # Errors
    ///
    /// The datagram is dropped if it does not answer the request in flight
    /// or cannot be decoded.
    pub(crate) fn process_response(
        &mut self,
        core: &mut IkeSaCore,
        raw: &[u8],
        header: &IkeHeader,
        from: SocketAddr,
        to: SocketAddr,
    ) -> Result<()> {
        let Some(ex) = self.initiating.as_ref() else {
            return Err(Error::InvalidMessageId {
                expected: self.next_message_id,
                received: header.message_id,
            });
        };
        if header.message_id != ex.message_id {
            return Err(Error::InvalidMessageId {
                expected: ex.message_id,
                received: header.message_id,
            });
        }
        if header.exchange_type != ex.exchange {
            return Err(Error::MalformedMessage(format!(
                "{} response to {} request",
                header.exchange_type, ex.exchange
            )));
        }
        let exchange = ex.exchange;

        let key = if exchange == ExchangeType::IkeSaInit {
            None
        } else {
            core.sk_in()
        };
        let message = match IkeMessage::decode(raw, key) {
            Ok(message) => message,
            Err(Error::DecryptionFailed) => {
                core.note_failure(exchange, &Error::DecryptionFailed);
                self.clear(core);
                core.request_destroy(DestroyCause::Failed(Error::DecryptionFailed));
                return Err(Error::DecryptionFailed);
            }
            Err(e) => return Err(e),
        };

        logging::log_message_recv(exchange, from, raw.len());
        core.note_inbound(from, to);
        core.cancel(Timer::Retransmit);

        let Some(mut ex) = self.initiating.take() else {
            return Ok(());
        };
        let inbound = Inbound {
            message: &message,
            raw,
            from,
            to,
        };

        let mut retry = false;
        for i in 0..ex.tasks.len() {
            match ex.tasks[i].process_response(core, &inbound) {
                Ok(TaskStatus::Done) => {}
                Ok(TaskStatus::Retry) => retry = true,
                Err(e) => {
                    core.note_failure(exchange, &e);
                    for task in &mut ex.tasks[i + 1..] {
                        task.abort(core);
                    }
                    if core.state == IkeSaState::Connecting || e.is_fatal() {
                        core.request_destroy(DestroyCause::Failed(e));
                    }
                    break;
                }
            }
        }

        if retry && core.destroy_requested.is_none() {
            self.launch(core, exchange, ex.message_id, ex.tasks);
            return Ok(());
        }
        self.next_message_id = self.next_message_id.wrapping_add(1);
        Ok(())
    }

    /// Request from the peer
    ///
    /// # Errors
    ///
    /// The datagram is dropped if its message ID is outside the window or it
    /// cannot be decoded.
    pub(crate) fn process_request(
        &mut self,
        core: &mut IkeSaCore,
        raw: &[u8],
        header: &IkeHeader,
        from: SocketAddr,
        to: SocketAddr,
    ) -> Result<()> {
        let message_id = header.message_id;
        let exchange = header.exchange_type;

        if let Some(cached) = &self.responding.last {
            if cached.message_id == message_id {
                let digest: [u8; 32] = Sha256::digest(raw).into();
                if digest != cached.digest {
                    return Err(Error::MalformedMessage(format!(
                        "request {} differs from the one already answered",
                        message_id
                    )));
                }
                debug!(ike_sa = %core.id, message_id, "Retransmitting cached response");
                let packet = cached.packet.clone();
                core.send(packet, exchange);
                return Ok(());
            }
        }
        if message_id != self.responding.expected {
            return Err(Error::InvalidMessageId {
                expected: self.responding.expected,
                received: message_id,
            });
        }

        let key = if exchange == ExchangeType::IkeSaInit {
            None
        } else {
            core.sk_in()
        };
        let message = match IkeMessage::decode(raw, key) {
            Ok(message) => message,
            Err(e) => return Err(self.reject(core, header, e)),
        };
        logging::log_message_recv(exchange, from, raw.len());
        core.note_inbound(from, to);

        let (mut tasks, mut failure) = match responder_plan(core, &message) {
            Ok(tasks) => (tasks, None),
            Err(e) => (Vec::new(), Some(e)),
        };
        let inbound = Inbound {
            message: &message,
            raw,
            from,
            to,
        };

        let mut succeeded = 0;
        if failure.is_none() {
            for task in tasks.iter_mut() {
                if let Err(e) = task.process_request(core, &inbound) {
                    failure = Some(e);
                    break;
                }
                succeeded += 1;
            }
        }
        for task in &mut tasks[succeeded..] {
            task.abort(core);
        }

        let mut response = core.new_message(exchange, true, message_id);
        for task in &mut tasks[..succeeded] {
            if let Err(e) = task.build(core, &mut response) {
                failure.get_or_insert(e);
                break;
            }
        }

        if let Some(err) = &failure {
            core.note_failure(exchange, err);
            response.push(IkePayload::Notify(notify_for(err)));
            if exchange == ExchangeType::IkeSaInit {
                response.responder_spi = [0u8; 8];
            }
            if err.is_fatal()
                || exchange == ExchangeType::IkeSaInit
                || core.state == IkeSaState::Connecting
            {
                core.request_destroy(DestroyCause::Failed(err.clone()));
            }
        }

        let key = if exchange == ExchangeType::IkeSaInit {
            None
        } else {
            core.sk_out()
        };
        let packet = response.encode(key)?;
        if exchange == ExchangeType::IkeSaInit && failure.is_none() {
            core.sent_init = packet.clone();
        }

        self.responding.last = Some(CachedResponse {
            message_id,
            digest: Sha256::digest(raw).into(),
            packet: packet.clone(),
        });
        self.responding.expected = message_id.wrapping_add(1);
        core.send(packet, exchange);
        Ok(())
    }

    /// Answer an undecodable request; the message ID is not consumed
    fn reject(&mut self, core: &mut IkeSaCore, header: &IkeHeader, err: Error) -> Error {
        let exchange = header.exchange_type;
        core.note_failure(exchange, &err);

        if err == Error::DecryptionFailed {
            core.request_destroy(DestroyCause::Failed(err.clone()));
            return err;
        }
        if let Some(notify_type) = err.notify_type() {
            let mut response = core.new_message(exchange, true, header.message_id);
            if exchange == ExchangeType::IkeSaInit {
                response.responder_spi = [0u8; 8];
            }
            response.push(IkePayload::Notify(NotifyPayload::new(notify_type, Vec::new())));
            let key = if exchange == ExchangeType::IkeSaInit {
                None
            } else {
                core.sk_out()
            };
            match response.encode(key) {
                Ok(packet) => core.send(packet, exchange),
                Err(e) => debug!(ike_sa = %core.id, error = %e, "Cannot encode error response"),
            }
        }
        if exchange == ExchangeType::IkeSaInit {
            core.request_destroy(DestroyCause::Failed(err.clone()));
        }
        err
    }
}

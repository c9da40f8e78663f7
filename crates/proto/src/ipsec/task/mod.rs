//! Exchange tasks
//!
//! Every exchange an IKE_SA performs is composed of tasks. A task contributes
//! payloads to an outbound message and consumes the payloads of the matching
//! inbound one. The same task type serves both roles: as exchange initiator
//! it builds the request and processes the response, as responder it
//! processes the request and builds the response.
//!
//! | Task          | Exchange                   |
//! |---------------|----------------------------|
//! | `IkeInit`     | IKE_SA_INIT                |
//! | `IkeAuth`     | IKE_AUTH                   |
//! | `ChildCreate` | IKE_AUTH / CREATE_CHILD_SA |
//! | `ChildRekey`  | CREATE_CHILD_SA            |
//! | `IkeRekey`    | CREATE_CHILD_SA            |
//! | `ChildDelete` | INFORMATIONAL              |
//! | `IkeDelete`   | INFORMATIONAL              |
//! | `IkeDpd`      | INFORMATIONAL              |

mod child_create;
mod child_delete;
mod child_rekey;
mod ike_auth;
mod ike_delete;
mod ike_dpd;
mod ike_init;
mod ike_rekey;

pub(crate) use child_create::ChildCreate;
pub(crate) use child_delete::ChildDelete;
pub(crate) use child_rekey::ChildRekey;
pub(crate) use ike_auth::IkeAuth;
pub(crate) use ike_delete::IkeDelete;
pub(crate) use ike_dpd::IkeDpd;
pub(crate) use ike_init::IkeInit;
pub(crate) use ike_rekey::IkeRekey;

use std::net::SocketAddr;

use super::config::RetransmitConfig;
use super::ike_sa::{IkeSaCore, IkeSaState};
use super::ikev2::{
    constants::{ExchangeType, NotifyType},
    message::IkeMessage,
    payload::NotifyPayload,
    proposal::ProtocolId,
};
use super::{Error, Result};

/// Outcome of processing a response
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum TaskStatus {
    /// Task complete
    Done,
    /// Send the request again under the same message ID (COOKIE, INVALID_KE)
    Retry,
}

/// A decoded inbound message with its transport context
pub(crate) struct Inbound<'a> {
    pub(crate) message: &'a IkeMessage,
    /// Datagram as received, for AUTH over IKE_SA_INIT
    pub(crate) raw: &'a [u8],
    pub(crate) from: SocketAddr,
    pub(crate) to: SocketAddr,
}

/// One half of a request/response exchange, for both roles
pub(crate) trait IkeTask {
    /// Add payloads to our request
    fn build_i(&mut self, core: &mut IkeSaCore, msg: &mut IkeMessage) -> Result<()>;

    /// Consume the peer's response
    fn process_i(&mut self, core: &mut IkeSaCore, inbound: &Inbound<'_>) -> Result<TaskStatus>;

    /// Consume the peer's request
    fn process_r(&mut self, core: &mut IkeSaCore, inbound: &Inbound<'_>) -> Result<()>;

    /// Add payloads to our response
    fn build_r(&mut self, core: &mut IkeSaCore, msg: &mut IkeMessage) -> Result<()>;

    /// Release whatever the task holds; the exchange is abandoned
    fn abort(&mut self, _core: &mut IkeSaCore) {}
}

/// Unit of work queued on an IKE_SA
#[derive(Debug)]
pub(crate) enum Task {
    IkeInit(IkeInit),
    IkeAuth(IkeAuth),
    ChildCreate(ChildCreate),
    ChildRekey(ChildRekey),
    ChildDelete(ChildDelete),
    IkeRekey(IkeRekey),
    IkeDelete(IkeDelete),
    IkeDpd(IkeDpd),
}

impl Task {
    fn handler(&mut self) -> &mut dyn IkeTask {
        match self {
            Task::IkeInit(t) => t,
            Task::IkeAuth(t) => t,
            Task::ChildCreate(t) => t,
            Task::ChildRekey(t) => t,
            Task::ChildDelete(t) => t,
            Task::IkeRekey(t) => t,
            Task::IkeDelete(t) => t,
            Task::IkeDpd(t) => t,
        }
    }

    /// Name for logs
    pub(crate) fn name(&self) -> &'static str {
        match self {
            Task::IkeInit(_) => "IKE_INIT",
            Task::IkeAuth(_) => "IKE_AUTH",
            Task::ChildCreate(_) => "CHILD_CREATE",
            Task::ChildRekey(_) => "CHILD_REKEY",
            Task::ChildDelete(_) => "CHILD_DELETE",
            Task::IkeRekey(_) => "IKE_REKEY",
            Task::IkeDelete(_) => "IKE_DELETE",
            Task::IkeDpd(_) => "IKE_DPD",
        }
    }

    /// Exchange this task runs in
    pub(crate) fn exchange(&self, core: &IkeSaCore) -> ExchangeType {
        match self {
            Task::IkeInit(_) => ExchangeType::IkeSaInit,
            Task::IkeAuth(_) => ExchangeType::IkeAuth,
            Task::ChildCreate(_) if core.state == IkeSaState::Connecting => ExchangeType::IkeAuth,
            Task::ChildCreate(_) | Task::ChildRekey(_) | Task::IkeRekey(_) => {
                ExchangeType::CreateChildSa
            }
            Task::ChildDelete(_) | Task::IkeDelete(_) | Task::IkeDpd(_) => {
                ExchangeType::Informational
            }
        }
    }

    /// Add this task's payloads to `msg`, request or response
    pub(crate) fn build(&mut self, core: &mut IkeSaCore, msg: &mut IkeMessage) -> Result<()> {
        if msg.is_response() {
            self.handler().build_r(core, msg)
        } else {
            self.handler().build_i(core, msg)
        }
    }

    pub(crate) fn process_response(
        &mut self,
        core: &mut IkeSaCore,
        inbound: &Inbound<'_>,
    ) -> Result<TaskStatus> {
        self.handler().process_i(core, inbound)
    }

    pub(crate) fn process_request(&mut self, core: &mut IkeSaCore, inbound: &Inbound<'_>) -> Result<()> {
        self.handler().process_r(core, inbound)
    }

    pub(crate) fn abort(&mut self, core: &mut IkeSaCore) {
        self.handler().abort(core)
    }

    /// Retransmission policy for the exchange this task starts
    pub(crate) fn retransmit_policy(&self, core: &IkeSaCore) -> RetransmitConfig {
        match self {
            Task::IkeDpd(_) => core.config.dpd.retransmit_policy(),
            _ => core.settings.retransmit.clone(),
        }
    }
}

/// Tasks that answer a peer request
///
/// # Errors
///
/// Returns the error to report to the peer when the request cannot be taken
/// in the current state.
pub(crate) fn responder_plan(core: &IkeSaCore, msg: &IkeMessage) -> Result<Vec<Task>> {
    match msg.exchange_type {
        ExchangeType::IkeSaInit => Ok(vec![Task::IkeInit(IkeInit::default())]),
        ExchangeType::IkeAuth => {
            if core.state != IkeSaState::Connecting || core.keys.is_none() {
                return Err(Error::InvalidState(format!(
                    "IKE_AUTH request on {} IKE_SA",
                    core.state
                )));
            }
            let mut tasks = vec![Task::IkeAuth(IkeAuth::default())];
            if msg.sa().is_some() {
                tasks.push(Task::ChildCreate(ChildCreate::new()));
            }
            Ok(tasks)
        }
        ExchangeType::CreateChildSa => {
            // Also covers a colliding IKE_SA rekey
            if core.state != IkeSaState::Established {
                return Err(Error::TemporaryFailure);
            }
            let rekeys_ike = msg
                .sa()
                .map_or(false, |sa| sa.proposals.iter().any(|p| p.protocol_id == ProtocolId::Ike));
            if msg.notify(NotifyType::RekeySa).is_some() {
                Ok(vec![Task::ChildRekey(ChildRekey::responder())])
            } else if rekeys_ike {
                Ok(vec![Task::IkeRekey(IkeRekey::new())])
            } else {
                Ok(vec![Task::ChildCreate(ChildCreate::new())])
            }
        }
        ExchangeType::Informational => {
            if msg.deletes().any(|d| d.protocol_id == ProtocolId::Ike) {
                Ok(vec![Task::IkeDelete(IkeDelete::default())])
            } else if msg.deletes().any(|d| d.protocol_id == ProtocolId::Esp) {
                Ok(vec![Task::ChildDelete(ChildDelete::new(Vec::new()))])
            } else {
                Ok(vec![Task::IkeDpd(IkeDpd)])
            }
        }
    }
}

/// Error notify answering a failed request
pub(crate) fn notify_for(err: &Error) -> NotifyPayload {
    match err {
        Error::InvalidKePayload { group } => {
            NotifyPayload::new(NotifyType::InvalidKePayload, group.to_be_bytes().to_vec())
        }
        Error::ChildSaNotFound(spi) => {
            NotifyPayload::with_child_spi(NotifyType::ChildSaNotFound, ProtocolId::Esp, *spi)
        }
        other => NotifyPayload::new(
            other.notify_type().unwrap_or(NotifyType::TemporaryFailure),
            Vec::new(),
        ),
    }
}

/// The single proposal a responder returned
fn chosen_proposal(msg: &IkeMessage) -> Result<super::ikev2::proposal::Proposal> {
    let sa = msg
        .sa()
        .ok_or_else(|| Error::InvalidPayload(format!("{} response without SA", msg.exchange_type)))?;
    match sa.proposals.as_slice() {
        [one] => Ok(one.clone()),
        _ => Err(Error::NoProposalChosen),
    }
}

/// Error carried by an error notify in a response, if any
fn notified_error(msg: &IkeMessage) -> Option<Error> {
    msg.error_notify()
        .map(|n| Error::from_notify(n.notify_type, &n.data))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ipsec::ikev2::payload::{DeletePayload, IkePayload};

    #[test]
    fn test_notify_for_carries_group() {
        let notify = notify_for(&Error::InvalidKePayload { group: 31 });
        assert_eq!(notify.notify_type, NotifyType::InvalidKePayload);
        assert_eq!(notify.data, vec![0, 31]);
    }

    #[test]
    fn test_notify_for_internal_errors() {
        let notify = notify_for(&Error::KernelInstallFailure("full".into()));
        assert_eq!(notify.notify_type, NotifyType::TemporaryFailure);

        let notify = notify_for(&Error::ChildSaNotFound(0x1234));
        assert_eq!(notify.notify_type, NotifyType::ChildSaNotFound);
        assert_eq!(notify.spi_u32(), Some(0x1234));

        let notify = notify_for(&Error::NoProposalChosen);
        assert_eq!(notify.notify_type, NotifyType::NoProposalChosen);
    }

    #[test]
    fn test_notified_error() {
        use crate::ipsec::ikev2::constants::IkeFlags;

        let mut msg = IkeMessage::new(ExchangeType::Informational, [1; 8], [2; 8], IkeFlags::response(true), 3);
        assert!(notified_error(&msg).is_none());
        msg.push(IkePayload::Notify(NotifyPayload::new(NotifyType::Cookie, vec![1])));
        assert!(notified_error(&msg).is_none());
        msg.push(IkePayload::Notify(NotifyPayload::new(NotifyType::TsUnacceptable, Vec::new())));
        assert_eq!(notified_error(&msg), Some(Error::TsUnacceptable));
        msg.push(IkePayload::Delete(DeletePayload::ike()));
        assert_eq!(msg.deletes().count(), 1);
    }
}

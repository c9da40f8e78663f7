//! IKE_SA deletion (RFC 7296 Section 1.4.1)

use super::{Inbound, IkeTask, TaskStatus};
use crate::ipsec::ike_sa::{DestroyCause, IkeSaCore, IkeSaState, Timer};
use crate::ipsec::ikev2::{
    message::IkeMessage,
    payload::{DeletePayload, IkePayload},
};
use crate::ipsec::Result;

#[derive(Debug, Default)]
pub(crate) struct IkeDelete;

impl IkeTask for IkeDelete {
    fn build_i(&mut self, core: &mut IkeSaCore, msg: &mut IkeMessage) -> Result<()> {
        core.set_state(IkeSaState::Deleting)?;
        // Armed when the delete was requested, if it had to wait its turn
        if !core.is_scheduled(Timer::DeleteTimeout) {
            let timeout = core.settings.delete_timeout;
            core.schedule(Timer::DeleteTimeout, timeout);
        }
        msg.push(IkePayload::Delete(DeletePayload::ike()));
        Ok(())
    }

    fn process_i(&mut self, core: &mut IkeSaCore, _inbound: &Inbound<'_>) -> Result<TaskStatus> {
        let cause = core.delete_cause.clone();
        core.request_destroy(cause);
        Ok(TaskStatus::Done)
    }

    fn process_r(&mut self, core: &mut IkeSaCore, _inbound: &Inbound<'_>) -> Result<()> {
        // The old SA of a rekey we answered is expected to go this way
        let cause = match core.delete_cause {
            DestroyCause::Rekeyed => DestroyCause::Rekeyed,
            _ => DestroyCause::DeletedByPeer,
        };
        core.request_destroy(cause);
        Ok(())
    }

    fn build_r(&mut self, _core: &mut IkeSaCore, _msg: &mut IkeMessage) -> Result<()> {
        Ok(())
    }
}

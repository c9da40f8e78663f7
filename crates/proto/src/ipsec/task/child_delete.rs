//! CHILD_SA deletion (RFC 7296 Section 1.4.1)
//!
//! Delete payloads name the sender's inbound SPIs. Both directions of each
//! CHILD_SA are removed once the exchange completes.

use super::{Inbound, IkeTask, TaskStatus};
use crate::ipsec::child_sa::ChildSaState;
use crate::ipsec::ike_sa::IkeSaCore;
use crate::ipsec::ikev2::{
    message::IkeMessage,
    payload::{DeletePayload, IkePayload},
    proposal::ProtocolId,
};
use crate::ipsec::Result;

#[derive(Debug)]
pub(crate) struct ChildDelete {
    /// Our inbound SPIs
    spis: Vec<u32>,
}

impl ChildDelete {
    pub(crate) fn new(spis: Vec<u32>) -> Self {
        ChildDelete { spis }
    }
}

impl IkeTask for ChildDelete {
    fn build_i(&mut self, core: &mut IkeSaCore, msg: &mut IkeMessage) -> Result<()> {
        for spi in &self.spis {
            if let Some(child) = core.child_mut(*spi) {
                if child.state() != ChildSaState::Deleting {
                    let _ = child.set_state(ChildSaState::Deleting);
                }
            }
        }
        msg.push(IkePayload::Delete(DeletePayload::esp(self.spis.clone())));
        Ok(())
    }

    fn process_i(&mut self, core: &mut IkeSaCore, _inbound: &Inbound<'_>) -> Result<TaskStatus> {
        for spi in &self.spis {
            core.remove_child(*spi, "deleted");
        }
        Ok(TaskStatus::Done)
    }

    fn process_r(&mut self, core: &mut IkeSaCore, inbound: &Inbound<'_>) -> Result<()> {
        let peer_spis: Vec<u32> = inbound
            .message
            .deletes()
            .filter(|d| d.protocol_id == ProtocolId::Esp)
            .flat_map(|d| d.spis.iter().copied())
            .collect();

        for peer_spi in peer_spis {
            let Some(spi_in) = core
                .children
                .iter()
                .find(|c| c.spi_out == peer_spi)
                .map(|c| c.spi_in)
            else {
                continue;
            };
            core.remove_child(spi_in, "deleted by peer");
            self.spis.push(spi_in);
        }
        Ok(())
    }

    fn build_r(&mut self, _core: &mut IkeSaCore, msg: &mut IkeMessage) -> Result<()> {
        if !self.spis.is_empty() {
            msg.push(IkePayload::Delete(DeletePayload::esp(self.spis.clone())));
        }
        Ok(())
    }
}

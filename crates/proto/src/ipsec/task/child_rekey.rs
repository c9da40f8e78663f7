//! CHILD_SA rekeying (RFC 7296 Section 2.8)
//!
//! The replacement is created first; the old CHILD_SA keeps carrying traffic
//! until the new one is installed and is deleted afterwards.

use super::{ChildCreate, ChildDelete, Inbound, IkeTask, Task, TaskStatus};
use crate::ipsec::child_sa::ChildSaState;
use crate::ipsec::ike_sa::{IkeSaCore, Timer};
use crate::ipsec::ikev2::{constants::NotifyType, message::IkeMessage};
use crate::ipsec::{logging, Error, Result};

#[derive(Debug)]
pub(crate) struct ChildRekey {
    /// Inbound SPI of the CHILD_SA being replaced
    old_spi: u32,
    create: ChildCreate,
}

impl ChildRekey {
    pub(crate) fn new(old_spi: u32) -> Self {
        ChildRekey {
            old_spi,
            create: ChildCreate::rekeying(old_spi),
        }
    }

    /// Answer to a peer's REKEY_SA request; the old SA is learned from it
    pub(crate) fn responder() -> Self {
        ChildRekey {
            old_spi: 0,
            create: ChildCreate::new(),
        }
    }

    fn restore(&self, core: &mut IkeSaCore) {
        if let Some(old) = core.child_mut(self.old_spi) {
            if old.state() == ChildSaState::Rekeying {
                let _ = old.set_state(ChildSaState::Installed);
            }
        }
    }

    fn completed(&self, core: &mut IkeSaCore, new_spi: u32) {
        logging::log_child_rekey_complete(self.old_spi, new_spi);
        core.services.metrics.record_child_rekey();
    }
}

impl IkeTask for ChildRekey {
    fn build_i(&mut self, core: &mut IkeSaCore, msg: &mut IkeMessage) -> Result<()> {
        let old = core
            .child_mut(self.old_spi)
            .ok_or(Error::ChildSaNotFound(self.old_spi))?;
        old.set_state(ChildSaState::Rekeying)?;
        self.create.build_i(core, msg)
    }

    fn process_i(&mut self, core: &mut IkeSaCore, inbound: &Inbound<'_>) -> Result<TaskStatus> {
        match self.create.process_i(core, inbound) {
            Ok(status) => {
                if let Some(new_spi) = self.create.installed {
                    if let Some(old) = core.child_mut(self.old_spi) {
                        let _ = old.set_state(ChildSaState::Deleting);
                    }
                    self.completed(core, new_spi);
                    core.followups
                        .push(Task::ChildDelete(ChildDelete::new(vec![self.old_spi])));
                }
                Ok(status)
            }
            Err(e) => {
                self.restore(core);
                if e == Error::TemporaryFailure {
                    core.defer(Timer::RekeyChild(self.old_spi));
                }
                Err(e)
            }
        }
    }

    fn process_r(&mut self, core: &mut IkeSaCore, inbound: &Inbound<'_>) -> Result<()> {
        let notify = inbound
            .message
            .notify(NotifyType::RekeySa)
            .ok_or_else(|| Error::InvalidPayload("rekey request without REKEY_SA".into()))?;
        let peer_spi = notify
            .spi_u32()
            .ok_or_else(|| Error::InvalidPayload("REKEY_SA without SPI".into()))?;

        let old = core
            .child_by_spi_out_mut(peer_spi)
            .ok_or(Error::ChildSaNotFound(peer_spi))?;
        match old.state() {
            ChildSaState::Installed => {}
            // Both ends rekeying the same CHILD_SA
            ChildSaState::Rekeying => return Err(Error::TemporaryFailure),
            _ => return Err(Error::ChildSaNotFound(peer_spi)),
        }
        self.old_spi = old.spi_in;
        self.create.rekey = Some(self.old_spi);

        self.create.process_r(core, inbound)?;
        if let Some(old) = core.child_mut(self.old_spi) {
            let _ = old.set_state(ChildSaState::Rekeying);
        }
        if let Some(new_spi) = self.create.installed {
            self.completed(core, new_spi);
        }
        Ok(())
    }

    fn build_r(&mut self, core: &mut IkeSaCore, msg: &mut IkeMessage) -> Result<()> {
        self.create.build_r(core, msg)
    }

    fn abort(&mut self, core: &mut IkeSaCore) {
        self.restore(core);
        self.create.abort(core);
    }
}

//! Liveness check: an empty INFORMATIONAL exchange (RFC 7296 Section 2.4)
//!
//! Activity is recorded when the response authenticates, before the task
//! runs, so there is nothing left to do here.

use super::{Inbound, IkeTask, TaskStatus};
use crate::ipsec::ike_sa::IkeSaCore;
use crate::ipsec::ikev2::message::IkeMessage;
use crate::ipsec::Result;

#[derive(Debug, Default)]
pub(crate) struct IkeDpd;

impl IkeTask for IkeDpd {
    fn build_i(&mut self, _core: &mut IkeSaCore, _msg: &mut IkeMessage) -> Result<()> {
        Ok(())
    }

    fn process_i(&mut self, _core: &mut IkeSaCore, _inbound: &Inbound<'_>) -> Result<TaskStatus> {
        Ok(TaskStatus::Done)
    }

    fn process_r(&mut self, _core: &mut IkeSaCore, _inbound: &Inbound<'_>) -> Result<()> {
        Ok(())
    }

    fn build_r(&mut self, _core: &mut IkeSaCore, _msg: &mut IkeMessage) -> Result<()> {
        Ok(())
    }
}

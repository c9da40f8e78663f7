//! IKE_SA_INIT (RFC 7296 Section 1.2)
//!
//! Negotiates the IKE suite, runs the DH exchange, derives SKEYSEED and the
//! SK_* keys, and performs NAT detection. A COOKIE or INVALID_KE_PAYLOAD
//! answer restarts the exchange with the same message ID.

use tracing::info;

use super::{chosen_proposal, notified_error, Inbound, IkeTask, TaskStatus};
use crate::ipsec::crypto::{DhSecret, IkeSuite};
use crate::ipsec::ike_sa::{IkeKeys, IkeSaCore};
use crate::ipsec::ikev2::{
    constants::NotifyType,
    message::IkeMessage,
    payload::{IkePayload, KePayload, NoncePayload, NotifyPayload, SaPayload},
    proposal::{select_proposal, DhTransformId, Proposal},
};
use crate::ipsec::{logging, nat, Error, Result};

#[derive(Debug, Default)]
pub(crate) struct IkeInit {
    /// Group for our KE payload; the first configured one unless the peer
    /// asked for another
    group: Option<DhTransformId>,
    public: Vec<u8>,
    secret: Option<DhSecret>,
    offered: Vec<Proposal>,
    /// Responder: selected proposal
    chosen: Option<Proposal>,
}

impl IkeInit {
    fn restart(&mut self, core: &mut IkeSaCore, reason: &str) -> Result<()> {
        core.init_retries += 1;
        if core.init_retries > core.settings.max_init_retries {
            return Err(Error::Internal(format!(
                "IKE_SA_INIT restarted {} times, giving up after {}",
                core.init_retries - 1,
                reason
            )));
        }
        info!(ike_sa = %core.id, reason, attempt = core.init_retries, "Restarting IKE_SA_INIT");
        Ok(())
    }

    fn initial_group(core: &IkeSaCore) -> Result<DhTransformId> {
        core.config
            .ike_proposals
            .iter()
            .filter_map(|p| p.dh_group().and_then(DhTransformId::from_u16))
            .next()
            .ok_or_else(|| Error::InvalidParameter("no usable DH group configured".into()))
    }

    fn push_nat_detection(core: &IkeSaCore, msg: &mut IkeMessage) {
        let spi_r = msg.responder_spi;
        for notify in nat::detection_notifies(&core.id.spi_i, &spi_r, core.local_addr, core.remote_addr) {
            msg.push(IkePayload::Notify(notify));
        }
    }
}

impl IkeTask for IkeInit {
    fn build_i(&mut self, core: &mut IkeSaCore, msg: &mut IkeMessage) -> Result<()> {
        let group = match self.group {
            Some(group) => group,
            None => Self::initial_group(core)?,
        };
        self.group = Some(group);

        // Keep nonce and key share across a COOKIE restart; the cookie is
        // bound to the nonce
        if self.secret.as_ref().map(DhSecret::group) != Some(group) {
            let (public, secret) = core.services.crypto.generate_dh_keypair(group)?;
            self.public = public;
            self.secret = Some(secret);
        }
        if core.nonce_i.is_empty() {
            core.nonce_i = core.services.crypto.nonce();
        }
        self.offered = core.config.ike_proposals.clone();

        if let Some(cookie) = &core.cookie {
            msg.push(IkePayload::Notify(NotifyPayload::new(NotifyType::Cookie, cookie.clone())));
        }
        msg.push(IkePayload::SA(SaPayload::new(self.offered.clone())));
        msg.push(IkePayload::KE(KePayload::new(group.to_u16(), self.public.clone())));
        msg.push(IkePayload::Nonce(NoncePayload::new(core.nonce_i.clone())?));
        Self::push_nat_detection(core, msg);
        Ok(())
    }

    fn process_i(&mut self, core: &mut IkeSaCore, inbound: &Inbound<'_>) -> Result<TaskStatus> {
        let msg = inbound.message;

        if let Some(cookie) = msg.notify(NotifyType::Cookie) {
            self.restart(core, "COOKIE")?;
            core.cookie = Some(cookie.data.clone());
            return Ok(TaskStatus::Retry);
        }
        if let Some(err) = notified_error(msg) {
            if let Error::InvalidKePayload { group } = err {
                let offered = self
                    .offered
                    .iter()
                    .any(|p| p.dh_group() == Some(group));
                if let (true, Some(wanted)) = (offered, DhTransformId::from_u16(group)) {
                    self.restart(core, "INVALID_KE_PAYLOAD")?;
                    self.group = Some(wanted);
                    return Ok(TaskStatus::Retry);
                }
            }
            return Err(err);
        }

        let chosen = chosen_proposal(msg)?;
        if !chosen.is_selection_of(&self.offered) {
            return Err(Error::NoProposalChosen);
        }
        logging::log_proposal_negotiation(self.offered.len(), Some(chosen.proposal_num));
        let suite = IkeSuite::from_proposal(&chosen)?;

        let ke = msg
            .ke()
            .ok_or_else(|| Error::InvalidPayload("IKE_SA_INIT response without KE".into()))?;
        let nonce_r = msg
            .nonce()
            .ok_or_else(|| Error::InvalidPayload("IKE_SA_INIT response without nonce".into()))?
            .to_vec();
        let secret = self
            .secret
            .take()
            .ok_or_else(|| Error::Internal("IKE_SA_INIT key share already consumed".into()))?;
        if ke.dh_group != suite.dh.to_u16() || secret.group() != suite.dh {
            return Err(Error::InvalidPayload(format!(
                "KE group {} does not match selected group {}",
                ke.dh_group,
                suite.dh.to_u16()
            )));
        }
        if msg.responder_spi == [0u8; 8] {
            return Err(Error::InvalidPayload("responder SPI is zero".into()));
        }

        let shared = secret.agree(&ke.key_data)?;
        core.id.spi_r = msg.responder_spi;
        let material = core.services.crypto.derive_keys(
            &suite,
            &shared,
            &core.nonce_i,
            &nonce_r,
            &core.id.spi_i,
            &core.id.spi_r,
        )?;
        core.keys = Some(IkeKeys { suite, material });
        core.proposal = Some(chosen);
        core.nonce_r = nonce_r;
        core.received_init = inbound.raw.to_vec();
        core.cookie = None;

        core.nat = nat::detect(msg, &core.id.spi_i, &core.id.spi_r, inbound.to, inbound.from);
        if let Some(status) = core.nat.filter(|n| n.is_nat_present()) {
            info!(ike_sa = %core.id, nat = ?status, "NAT detected, switching to port 4500");
            core.float_to_nat_port();
        }
        Ok(TaskStatus::Done)
    }

    fn process_r(&mut self, core: &mut IkeSaCore, inbound: &Inbound<'_>) -> Result<()> {
        let msg = inbound.message;
        let sa = msg
            .sa()
            .ok_or_else(|| Error::InvalidPayload("IKE_SA_INIT request without SA".into()))?;

        let chosen = match select_proposal(&sa.proposals, &core.config.ike_proposals) {
            Ok(chosen) => chosen,
            Err(e) => {
                logging::log_proposal_negotiation(sa.proposals.len(), None);
                return Err(e);
            }
        };
        logging::log_proposal_negotiation(sa.proposals.len(), Some(chosen.proposal_num));
        let suite = IkeSuite::from_proposal(&chosen)?;

        let ke = msg
            .ke()
            .ok_or_else(|| Error::InvalidPayload("IKE_SA_INIT request without KE".into()))?;
        if ke.dh_group != suite.dh.to_u16() {
            return Err(Error::InvalidKePayload {
                group: suite.dh.to_u16(),
            });
        }
        let nonce_i = msg
            .nonce()
            .ok_or_else(|| Error::InvalidPayload("IKE_SA_INIT request without nonce".into()))?
            .to_vec();

        let (public, secret) = core.services.crypto.generate_dh_keypair(suite.dh)?;
        let shared = secret.agree(&ke.key_data)?;
        let nonce_r = core.services.crypto.nonce();
        let material = core.services.crypto.derive_keys(
            &suite,
            &shared,
            &nonce_i,
            &nonce_r,
            &core.id.spi_i,
            &core.id.spi_r,
        )?;

        core.keys = Some(IkeKeys { suite, material });
        core.proposal = Some(chosen.clone());
        core.nonce_i = nonce_i;
        core.nonce_r = nonce_r;
        core.received_init = inbound.raw.to_vec();
        // The initiator hashed with a zero responder SPI
        core.nat = nat::detect(msg, &core.id.spi_i, &[0u8; 8], inbound.to, inbound.from);

        self.group = Some(suite.dh);
        self.public = public;
        self.chosen = Some(chosen);
        Ok(())
    }

    fn build_r(&mut self, core: &mut IkeSaCore, msg: &mut IkeMessage) -> Result<()> {
        let (Some(chosen), Some(group)) = (self.chosen.take(), self.group) else {
            return Err(Error::Internal("IKE_SA_INIT response before request".into()));
        };
        msg.push(IkePayload::SA(SaPayload::new(vec![chosen])));
        msg.push(IkePayload::KE(KePayload::new(group.to_u16(), std::mem::take(&mut self.public))));
        msg.push(IkePayload::Nonce(NoncePayload::new(core.nonce_r.clone())?));
        Self::push_nat_detection(core, msg);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ipsec::task::notify_for;

    #[test]
    fn test_invalid_ke_notify_parsed_as_group_request() {
        let notify = notify_for(&Error::InvalidKePayload {
            group: DhTransformId::Modp2048.to_u16(),
        });
        let err = Error::from_notify(notify.notify_type, &notify.data);
        assert_eq!(err, Error::InvalidKePayload { group: 14 });
    }
}

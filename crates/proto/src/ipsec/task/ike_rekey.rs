//! IKE_SA rekeying (RFC 7296 Section 2.18)
//!
//! A CREATE_CHILD_SA exchange with an IKE proposal produces a new IKE_SA
//! keyed from the old SK_d. The CHILD_SAs move to the new SA, and the old
//! one is deleted by the exchange initiator.

use super::{chosen_proposal, notified_error, IkeDelete, Inbound, IkeTask, Task, TaskStatus};
use crate::ipsec::crypto::{DhSecret, IkeSuite, KeyMaterial, SecretBytes};
use crate::ipsec::ike_sa::{
    DestroyCause, Effect, IkeKeys, IkeSa, IkeSaCore, IkeSaId, IkeSaState, SaCommand, Timer,
};
use crate::ipsec::ikev2::{
    message::IkeMessage,
    payload::{IkePayload, KePayload, NoncePayload, SaPayload},
    proposal::{select_proposal, Proposal},
};
use crate::ipsec::{logging, Error, Result};

#[derive(Debug, Default)]
pub(crate) struct IkeRekey {
    /// Our SPI for the new IKE_SA
    new_spi: Option<[u8; 8]>,
    offered: Vec<Proposal>,
    nonce: Vec<u8>,
    secret: Option<DhSecret>,
    /// Responder: selected proposal and our KE
    answer: Option<(Proposal, KePayload)>,
}

impl IkeRekey {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    fn release_spi(&mut self, core: &IkeSaCore) {
        if let Some(spi) = self.new_spi.take() {
            core.services.spis.release(&spi);
        }
    }

    /// SKEYSEED from the old SK_d and the new DH result
    fn derive(
        core: &IkeSaCore,
        suite: &IkeSuite,
        shared: &SecretBytes,
        nonce_i: &[u8],
        nonce_r: &[u8],
        id: &IkeSaId,
    ) -> Result<KeyMaterial> {
        let old = core
            .keys
            .as_ref()
            .ok_or_else(|| Error::InvalidState("IKE_SA rekey without keys".into()))?;
        core.services.crypto.derive_rekeyed_keys(
            suite,
            old.suite.prf,
            &old.material.sk_d,
            shared,
            nonce_i,
            nonce_r,
            &id.spi_i,
            &id.spi_r,
        )
    }

    /// Hand the new IKE_SA to the runtime and retire this one
    #[allow(clippy::too_many_arguments)]
    fn spawn(
        core: &mut IkeSaCore,
        id: IkeSaId,
        suite: IkeSuite,
        material: KeyMaterial,
        proposal: Proposal,
        nonce_i: Vec<u8>,
        nonce_r: Vec<u8>,
    ) -> Result<()> {
        let old_spi_i = core.id.spi_i;
        let terminating = core.state == IkeSaState::Deleting;
        let mut successor = IkeSa::from_rekey(
            core,
            id,
            IkeKeys { suite, material },
            proposal,
            nonce_i,
            nonce_r,
        );
        if terminating {
            // Deleted while the rekey was in flight: the new SA goes too
            successor.handle_command(SaCommand::Terminate)?;
        }
        core.emit(Effect::Spawn(Box::new(successor)));
        logging::log_ike_rekey_complete(&old_spi_i, &id.spi_i, &id.spi_r);
        core.services.metrics.record_ike_rekey();

        core.set_state(IkeSaState::Deleting)?;
        core.delete_cause = DestroyCause::Rekeyed;
        Ok(())
    }

    fn complete_i(&mut self, core: &mut IkeSaCore, msg: &IkeMessage) -> Result<()> {
        if let Some(err) = notified_error(msg) {
            return Err(err);
        }
        let chosen = chosen_proposal(msg)?;
        if !chosen.is_selection_of(&self.offered) {
            return Err(Error::NoProposalChosen);
        }
        let peer_spi = chosen
            .spi_ike()
            .ok_or_else(|| Error::InvalidPayload("IKE rekey proposal without SPI".into()))?;
        let suite = IkeSuite::from_proposal(&chosen)?;

        let ke = msg
            .ke()
            .ok_or_else(|| Error::InvalidPayload("IKE rekey response without KE".into()))?;
        let secret = self
            .secret
            .take()
            .ok_or_else(|| Error::Internal("IKE rekey key share already consumed".into()))?;
        if ke.dh_group != suite.dh.to_u16() || secret.group() != suite.dh {
            return Err(Error::InvalidPayload(format!(
                "KE group {} does not match selected group {}",
                ke.dh_group,
                suite.dh.to_u16()
            )));
        }
        let nonce_r = msg
            .nonce()
            .ok_or_else(|| Error::InvalidPayload("IKE rekey response without nonce".into()))?
            .to_vec();
        let shared = secret.agree(&ke.key_data)?;

        let new_spi = self
            .new_spi
            .ok_or_else(|| Error::Internal("IKE rekey without local SPI".into()))?;
        let id = IkeSaId {
            spi_i: new_spi,
            spi_r: peer_spi,
            initiator: true,
        };
        let nonce_i = self.nonce.clone();
        let material = Self::derive(core, &suite, &shared, &nonce_i, &nonce_r, &id)?;

        // The SPI now belongs to the new IKE_SA
        self.new_spi = None;
        Self::spawn(core, id, suite, material, chosen, nonce_i, nonce_r)?;
        core.followups.push(Task::IkeDelete(IkeDelete));
        Ok(())
    }

    fn complete_r(&mut self, core: &mut IkeSaCore, msg: &IkeMessage) -> Result<()> {
        let sa = msg
            .sa()
            .ok_or_else(|| Error::InvalidPayload("IKE rekey request without SA".into()))?;
        let chosen = select_proposal(&sa.proposals, &core.config.ike_proposals)?;
        let peer_spi = chosen
            .spi_ike()
            .ok_or_else(|| Error::InvalidPayload("IKE rekey proposal without SPI".into()))?;
        let suite = IkeSuite::from_proposal(&chosen)?;

        let ke = msg
            .ke()
            .ok_or_else(|| Error::InvalidPayload("IKE rekey request without KE".into()))?;
        if ke.dh_group != suite.dh.to_u16() {
            return Err(Error::InvalidKePayload {
                group: suite.dh.to_u16(),
            });
        }
        let nonce_i = msg
            .nonce()
            .ok_or_else(|| Error::InvalidPayload("IKE rekey request without nonce".into()))?
            .to_vec();
        let (public, secret) = core.services.crypto.generate_dh_keypair(suite.dh)?;
        let shared = secret.agree(&ke.key_data)?;
        self.nonce = core.services.crypto.nonce();

        let new_spi = core.services.spis.allocate()?;
        self.new_spi = Some(new_spi);
        let id = IkeSaId {
            spi_i: peer_spi,
            spi_r: new_spi,
            initiator: false,
        };
        let material = Self::derive(core, &suite, &shared, &nonce_i, &self.nonce, &id)?;

        let proposal = chosen.with_spi(new_spi.to_vec());
        self.answer = Some((proposal.clone(), KePayload::new(suite.dh.to_u16(), public)));
        self.new_spi = None;
        Self::spawn(core, id, suite, material, proposal, nonce_i, self.nonce.clone())?;

        // The initiator deletes the old IKE_SA
        let timeout = core.settings.delete_timeout;
        core.schedule(Timer::DeleteTimeout, timeout);
        Ok(())
    }
}

impl IkeTask for IkeRekey {
    fn build_i(&mut self, core: &mut IkeSaCore, msg: &mut IkeMessage) -> Result<()> {
        if core.state != IkeSaState::Established {
            return Err(Error::InvalidState(format!(
                "cannot rekey {} IKE_SA",
                core.state
            )));
        }
        let group = core
            .keys
            .as_ref()
            .map(|k| k.suite.dh)
            .ok_or_else(|| Error::InvalidState("IKE_SA rekey without keys".into()))?;

        let new_spi = core.services.spis.allocate()?;
        self.new_spi = Some(new_spi);
        self.offered = core
            .config
            .ike_proposals
            .iter()
            .map(|p| p.clone().with_spi(new_spi.to_vec()))
            .collect();
        let (public, secret) = core.services.crypto.generate_dh_keypair(group)?;
        self.secret = Some(secret);
        self.nonce = core.services.crypto.nonce();

        msg.push(IkePayload::SA(SaPayload::new(self.offered.clone())));
        msg.push(IkePayload::Nonce(NoncePayload::new(self.nonce.clone())?));
        msg.push(IkePayload::KE(KePayload::new(group.to_u16(), public)));
        core.set_state(IkeSaState::Rekeying)
    }

    fn process_i(&mut self, core: &mut IkeSaCore, inbound: &Inbound<'_>) -> Result<TaskStatus> {
        match self.complete_i(core, inbound.message) {
            Ok(()) => Ok(TaskStatus::Done),
            Err(e) => {
                self.abort(core);
                if e == Error::TemporaryFailure {
                    core.defer(Timer::RekeyIke);
                }
                Err(e)
            }
        }
    }

    fn process_r(&mut self, core: &mut IkeSaCore, inbound: &Inbound<'_>) -> Result<()> {
        if core.state != IkeSaState::Established {
            return Err(Error::TemporaryFailure);
        }
        let result = self.complete_r(core, inbound.message);
        if result.is_err() {
            self.release_spi(core);
        }
        result
    }

    fn build_r(&mut self, _core: &mut IkeSaCore, msg: &mut IkeMessage) -> Result<()> {
        let (proposal, ke) = self
            .answer
            .take()
            .ok_or_else(|| Error::Internal("IKE rekey response before request".into()))?;
        msg.push(IkePayload::SA(SaPayload::new(vec![proposal])));
        msg.push(IkePayload::Nonce(NoncePayload::new(self.nonce.clone())?));
        msg.push(IkePayload::KE(ke));
        Ok(())
    }

    fn abort(&mut self, core: &mut IkeSaCore) {
        self.release_spi(core);
        self.secret = None;
        if core.state == IkeSaState::Rekeying {
            let _ = core.set_state(IkeSaState::Established);
        }
    }
}

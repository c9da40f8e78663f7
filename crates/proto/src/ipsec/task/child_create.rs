//! CHILD_SA creation (RFC 7296 Sections 1.3.1 and 2.17)
//!
//! Runs piggybacked on IKE_AUTH for the first CHILD_SA, using the
//! IKE_SA_INIT nonces, or as its own CREATE_CHILD_SA exchange with fresh
//! nonces and an optional PFS key exchange. Also the inner half of a
//! CHILD_SA rekey.

use super::{chosen_proposal, notified_error, ChildDelete, Inbound, IkeTask, Task, TaskStatus};
use crate::ipsec::child_sa::{ChildSa, ChildSuite};
use crate::ipsec::crypto::{ChildKeys, DhSecret, SecretBytes};
use crate::ipsec::ike_sa::IkeSaCore;
use crate::ipsec::ikev2::{
    constants::{ExchangeType, NotifyType},
    message::IkeMessage,
    payload::{
        narrow_selectors, IkePayload, KePayload, NoncePayload, NotifyPayload, SaPayload,
        TrafficSelector, TsPayload,
    },
    proposal::{select_proposal, DhTransformId, Proposal, ProtocolId},
};
use crate::ipsec::{Error, Result};

/// What a responder sends back
#[derive(Debug)]
struct Answer {
    proposal: Proposal,
    ke: Option<KePayload>,
    ts_i: Vec<TrafficSelector>,
    ts_r: Vec<TrafficSelector>,
}

#[derive(Debug, Default)]
pub(crate) struct ChildCreate {
    /// Running inside IKE_AUTH
    in_auth: bool,
    /// Inbound SPI of the CHILD_SA being replaced
    pub(super) rekey: Option<u32>,
    /// Inbound SPI allocated but not yet owned by an installed CHILD_SA
    spi_in: Option<u32>,
    /// Inbound SPI of the CHILD_SA this task installed
    pub(super) installed: Option<u32>,
    offered: Vec<Proposal>,
    nonce: Vec<u8>,
    dh: Option<DhSecret>,
    answer: Option<Answer>,
}

impl ChildCreate {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Replacement for the CHILD_SA with inbound SPI `old`
    pub(super) fn rekeying(old: u32) -> Self {
        ChildCreate {
            rekey: Some(old),
            ..Self::default()
        }
    }

    fn release_spi(&mut self, core: &IkeSaCore) {
        if let Some(spi) = self.spi_in.take() {
            core.services.kernel.release_spi(spi);
        }
    }

    /// Nonces for KEYMAT: the IKE_SA_INIT ones inside IKE_AUTH, otherwise
    /// those of this exchange with the requester's first
    fn nonces(
        &self,
        core: &IkeSaCore,
        peer_nonce: Option<&[u8]>,
        requester: bool,
    ) -> Result<(Vec<u8>, Vec<u8>)> {
        if self.in_auth {
            return Ok((core.nonce_i.clone(), core.nonce_r.clone()));
        }
        let peer_nonce = peer_nonce
            .ok_or_else(|| Error::InvalidPayload("CREATE_CHILD_SA without nonce".into()))?
            .to_vec();
        if requester {
            Ok((self.nonce.clone(), peer_nonce))
        } else {
            Ok((peer_nonce, self.nonce.clone()))
        }
    }

    fn derive(
        &self,
        core: &IkeSaCore,
        suite: &ChildSuite,
        shared: Option<&SecretBytes>,
        nonce_i: &[u8],
        nonce_r: &[u8],
    ) -> Result<ChildKeys> {
        let keys = core
            .keys
            .as_ref()
            .ok_or_else(|| Error::InvalidState("CHILD_SA negotiation without IKE keys".into()))?;
        core.services.crypto.derive_child_keys(
            keys.suite.prf,
            &keys.material.sk_d,
            shared.map(|s| &s[..]),
            nonce_i,
            nonce_r,
            suite.encr_keymat_len,
            suite.integ_key_len(),
        )
    }

    /// Everything up to the kernel install, for our own request
    fn negotiate_i(&mut self, core: &IkeSaCore, msg: &IkeMessage, spi_in: u32) -> Result<ChildSa> {
        if let Some(err) = notified_error(msg) {
            return Err(err);
        }
        let chosen = chosen_proposal(msg)?;
        if !chosen.is_selection_of(&self.offered) {
            return Err(Error::NoProposalChosen);
        }
        let spi_out = chosen
            .spi_u32()
            .ok_or_else(|| Error::InvalidPayload("CHILD_SA proposal without SPI".into()))?;
        let suite = ChildSuite::from_proposal(&chosen)?;

        let ts_i = msg
            .ts_i()
            .ok_or_else(|| Error::InvalidPayload("response without TSi".into()))?
            .selectors
            .clone();
        let ts_r = msg
            .ts_r()
            .ok_or_else(|| Error::InvalidPayload("response without TSr".into()))?
            .selectors
            .clone();
        let within = |returned: &[TrafficSelector], ours: &[TrafficSelector]| {
            !returned.is_empty() && returned.iter().all(|t| ours.iter().any(|o| o.contains(t)))
        };
        if !within(&ts_i, &core.config.local_ts) || !within(&ts_r, &core.config.remote_ts) {
            return Err(Error::TsUnacceptable);
        }

        let shared = match self.dh.take() {
            Some(secret) => {
                let ke = msg
                    .ke()
                    .ok_or_else(|| Error::InvalidPayload("PFS response without KE".into()))?;
                if ke.dh_group != secret.group().to_u16() {
                    return Err(Error::InvalidPayload(format!(
                        "KE group {} does not match {}",
                        ke.dh_group,
                        secret.group().to_u16()
                    )));
                }
                Some(secret.agree(&ke.key_data)?)
            }
            None => None,
        };
        let (nonce_i, nonce_r) = self.nonces(core, msg.nonce(), true)?;
        let keys = self.derive(core, &suite, shared.as_ref(), &nonce_i, &nonce_r)?;

        let mut child = ChildSa::new(
            spi_in,
            spi_out,
            chosen,
            suite,
            ts_i,
            ts_r,
            core.config.child_lifetime,
            keys,
            true,
        );
        child.rekeyed_from = self.rekey;
        Ok(child)
    }

    /// Everything up to the kernel install, for the peer's request
    fn negotiate_r(&mut self, core: &IkeSaCore, msg: &IkeMessage) -> Result<(ChildSa, Answer)> {
        let config = &core.config;
        let sa = msg
            .sa()
            .ok_or_else(|| Error::InvalidPayload("request without SA".into()))?;
        let acceptable = if self.in_auth {
            config.child_proposals(None)
        } else {
            config.acceptable_child_proposals()
        };
        let chosen = select_proposal(&sa.proposals, &acceptable)?;
        let spi_out = chosen
            .spi_u32()
            .ok_or_else(|| Error::InvalidPayload("CHILD_SA proposal without SPI".into()))?;
        let suite = ChildSuite::from_proposal(&chosen)?;

        let proposed_i = &msg
            .ts_i()
            .ok_or_else(|| Error::InvalidPayload("request without TSi".into()))?
            .selectors;
        let proposed_r = &msg
            .ts_r()
            .ok_or_else(|| Error::InvalidPayload("request without TSr".into()))?
            .selectors;
        let ts_i = narrow_selectors(proposed_i, &config.remote_ts)?;
        let ts_r = narrow_selectors(proposed_r, &config.local_ts)?;

        let mut ke_out = None;
        let shared = match suite.dh.filter(|_| !self.in_auth) {
            Some(group) => {
                let wanted = Error::InvalidKePayload {
                    group: group.to_u16(),
                };
                let ke = msg.ke().ok_or_else(|| wanted.clone())?;
                if ke.dh_group != group.to_u16() {
                    return Err(wanted);
                }
                let (public, secret) = core.services.crypto.generate_dh_keypair(group)?;
                ke_out = Some(KePayload::new(group.to_u16(), public));
                Some(secret.agree(&ke.key_data)?)
            }
            None => None,
        };
        if !self.in_auth {
            self.nonce = core.services.crypto.nonce();
        }
        let (nonce_i, nonce_r) = self.nonces(core, msg.nonce(), false)?;
        let keys = self.derive(core, &suite, shared.as_ref(), &nonce_i, &nonce_r)?;

        let spi_in = core.services.kernel.allocate_spi(ProtocolId::Esp)?;
        self.spi_in = Some(spi_in);
        let proposal = chosen.with_spi(spi_in.to_be_bytes().to_vec());

        let mut child = ChildSa::new(
            spi_in,
            spi_out,
            proposal.clone(),
            suite,
            ts_r.clone(),
            ts_i.clone(),
            config.child_lifetime,
            keys,
            false,
        );
        child.rekeyed_from = self.rekey;
        let answer = Answer {
            proposal,
            ke: ke_out,
            ts_i,
            ts_r,
        };
        Ok((child, answer))
    }

    /// Install and hand the CHILD_SA to the IKE_SA
    fn install(&mut self, core: &mut IkeSaCore, mut child: ChildSa) -> Result<()> {
        let endpoints = core.endpoints();
        // A failed install releases the SPI itself
        self.spi_in = None;
        child.install(core.services.kernel.as_ref(), &endpoints)?;
        self.installed = Some(child.spi_in);
        core.add_child(child);
        Ok(())
    }
}

impl IkeTask for ChildCreate {
    fn build_i(&mut self, core: &mut IkeSaCore, msg: &mut IkeMessage) -> Result<()> {
        self.in_auth = msg.exchange_type == ExchangeType::IkeAuth;
        let config = core.config.clone();

        let spi_in = match self.spi_in {
            Some(spi) => spi,
            None => core.services.kernel.allocate_spi(ProtocolId::Esp)?,
        };
        self.spi_in = Some(spi_in);

        let pfs: Option<DhTransformId> = if self.in_auth { None } else { config.pfs_group };
        self.offered = config
            .child_proposals(pfs)
            .into_iter()
            .map(|p| p.with_spi(spi_in.to_be_bytes().to_vec()))
            .collect();

        if let Some(old) = self.rekey {
            msg.push(IkePayload::Notify(NotifyPayload::with_child_spi(
                NotifyType::RekeySa,
                ProtocolId::Esp,
                old,
            )));
        }
        msg.push(IkePayload::SA(SaPayload::new(self.offered.clone())));
        if !self.in_auth {
            self.nonce = core.services.crypto.nonce();
            msg.push(IkePayload::Nonce(NoncePayload::new(self.nonce.clone())?));
            if let Some(group) = pfs {
                let (public, secret) = core.services.crypto.generate_dh_keypair(group)?;
                self.dh = Some(secret);
                msg.push(IkePayload::KE(KePayload::new(group.to_u16(), public)));
            }
        }
        msg.push(IkePayload::TSi(TsPayload::new(config.local_ts.clone())));
        msg.push(IkePayload::TSr(TsPayload::new(config.remote_ts.clone())));
        Ok(())
    }

    fn process_i(&mut self, core: &mut IkeSaCore, inbound: &Inbound<'_>) -> Result<TaskStatus> {
        let spi_in = self
            .spi_in
            .ok_or_else(|| Error::Internal("CHILD_SA response without allocated SPI".into()))?;

        let child = match self.negotiate_i(core, inbound.message, spi_in) {
            Ok(child) => child,
            Err(e) => {
                self.release_spi(core);
                return Err(e);
            }
        };
        if let Err(e) = self.install(core, child) {
            // The peer already installed its half
            core.followups
                .push(Task::ChildDelete(ChildDelete::new(vec![spi_in])));
            return Err(e);
        }
        Ok(TaskStatus::Done)
    }

    fn process_r(&mut self, core: &mut IkeSaCore, inbound: &Inbound<'_>) -> Result<()> {
        self.in_auth = inbound.message.exchange_type == ExchangeType::IkeAuth;
        let (child, answer) = match self.negotiate_r(core, inbound.message) {
            Ok(negotiated) => negotiated,
            Err(e) => {
                self.release_spi(core);
                return Err(e);
            }
        };
        self.install(core, child)?;
        self.answer = Some(answer);
        Ok(())
    }

    fn build_r(&mut self, _core: &mut IkeSaCore, msg: &mut IkeMessage) -> Result<()> {
        let answer = self
            .answer
            .take()
            .ok_or_else(|| Error::Internal("CHILD_SA response before request".into()))?;
        msg.push(IkePayload::SA(SaPayload::new(vec![answer.proposal])));
        if !self.in_auth {
            msg.push(IkePayload::Nonce(NoncePayload::new(self.nonce.clone())?));
            if let Some(ke) = answer.ke {
                msg.push(IkePayload::KE(ke));
            }
        }
        msg.push(IkePayload::TSi(TsPayload::new(answer.ts_i)));
        msg.push(IkePayload::TSr(TsPayload::new(answer.ts_r)));
        Ok(())
    }

    fn abort(&mut self, core: &mut IkeSaCore) {
        self.release_spi(core);
        self.dh = None;
    }
}

//! IKE_AUTH (RFC 7296 Section 1.2)
//!
//! Each side signs its own IKE_SA_INIT message, the other side's nonce and
//! prf(SK_p, ID). A verified peer moves the IKE_SA to ESTABLISHED.

use super::{notified_error, Inbound, IkeTask, TaskStatus};
use crate::ipsec::credentials::AuthProof;
use crate::ipsec::ike_sa::IkeSaCore;
use crate::ipsec::ikev2::{
    auth::signed_octets,
    constants::NotifyType,
    message::IkeMessage,
    payload::{AuthPayload, Identity, IkePayload, NotifyPayload},
};
use crate::ipsec::{logging, Error, Result};

#[derive(Debug, Default)]
pub(crate) struct IkeAuth;

impl IkeAuth {
    /// Our AUTH payload; `sent_init` and the peer nonce must be known
    fn sign(core: &IkeSaCore, peer_nonce: &[u8]) -> Result<AuthPayload> {
        let keys = core
            .keys
            .as_ref()
            .ok_or_else(|| Error::InvalidState("IKE_AUTH without keys".into()))?;
        let prf = keys.suite.prf;
        let octets = signed_octets(
            prf,
            &core.sent_init,
            peer_nonce,
            keys.sk_p(core.id.initiator),
            &core.local_id,
        );
        let peer = core.remote_id.as_ref().or(core.config.remote_id.as_ref());
        core.services
            .credentials
            .sign(&core.local_id, peer, prf, &octets)
    }

    /// Whether another IKE_SA with the configured peer is authenticated
    ///
    /// Without a configured remote identity there is nothing to look up and
    /// the peer is treated as a first contact.
    fn has_contact(core: &IkeSaCore) -> bool {
        core.config.remote_id.as_ref().is_some_and(|peer| {
            core.services
                .contacts
                .has_contact(peer, &core.id.local_spi())
        })
    }

    /// Check the peer's AUTH payload against its IKE_SA_INIT message
    fn verify(core: &IkeSaCore, peer: &Identity, auth: &AuthPayload, our_nonce: &[u8]) -> Result<()> {
        let keys = core
            .keys
            .as_ref()
            .ok_or_else(|| Error::InvalidState("IKE_AUTH without keys".into()))?;
        let prf = keys.suite.prf;
        let octets = signed_octets(
            prf,
            &core.received_init,
            our_nonce,
            keys.sk_p(!core.id.initiator),
            peer,
        );
        let proof = AuthProof {
            prf,
            signed_octets: &octets,
            auth,
        };
        if core.services.credentials.authenticate(peer, &proof) {
            logging::log_authentication_success(&peer.to_string(), &format!("{:?}", auth.auth_method));
            Ok(())
        } else {
            Err(Error::AuthenticationFailed(format!(
                "AUTH payload of {} does not verify",
                peer
            )))
        }
    }
}

impl IkeTask for IkeAuth {
    fn build_i(&mut self, core: &mut IkeSaCore, msg: &mut IkeMessage) -> Result<()> {
        let auth = Self::sign(core, &core.nonce_r)?;
        msg.push(IkePayload::IDi(core.local_id.clone()));
        if let Some(remote_id) = &core.config.remote_id {
            msg.push(IkePayload::IDr(remote_id.clone()));
        }
        msg.push(IkePayload::AUTH(auth));
        if !Self::has_contact(core) {
            msg.push(IkePayload::Notify(NotifyPayload::new(
                NotifyType::InitialContact,
                Vec::new(),
            )));
        }
        Ok(())
    }

    fn process_i(&mut self, core: &mut IkeSaCore, inbound: &Inbound<'_>) -> Result<TaskStatus> {
        let msg = inbound.message;
        let Some(auth) = msg.auth() else {
            return Err(notified_error(msg).unwrap_or_else(|| {
                Error::InvalidPayload("IKE_AUTH response without AUTH".into())
            }));
        };
        let id_r = msg
            .id_r()
            .ok_or_else(|| Error::AuthenticationFailed("IKE_AUTH response without IDr".into()))?;
        if !core.config.accepts_identity(id_r) {
            return Err(Error::AuthenticationFailed(format!(
                "peer authenticated as unexpected identity {}",
                id_r
            )));
        }

        Self::verify(core, id_r, auth, &core.nonce_i)?;
        core.remote_id = Some(id_r.clone());
        core.establish()?;
        Ok(TaskStatus::Done)
    }

    fn process_r(&mut self, core: &mut IkeSaCore, inbound: &Inbound<'_>) -> Result<()> {
        let msg = inbound.message;
        let id_i = msg
            .id_i()
            .ok_or_else(|| Error::AuthenticationFailed("IKE_AUTH request without IDi".into()))?;
        let auth = msg
            .auth()
            .ok_or_else(|| Error::AuthenticationFailed("IKE_AUTH request without AUTH".into()))?;

        // The address-based guess from IKE_SA_INIT may be the wrong peer
        if !core.config.accepts_identity(id_i) {
            let config = core.settings.peer_for_identity(id_i).ok_or_else(|| {
                Error::AuthenticationFailed(format!("no configuration for peer {}", id_i))
            })?;
            core.local_id = config.local_id.clone();
            core.config = config;
        }

        Self::verify(core, id_i, auth, &core.nonce_r)?;
        core.remote_id = Some(id_i.clone());
        core.initial_contact = msg.notify(NotifyType::InitialContact).is_some();
        core.establish()
    }

    fn build_r(&mut self, core: &mut IkeSaCore, msg: &mut IkeMessage) -> Result<()> {
        let auth = Self::sign(core, &core.nonce_i)?;
        msg.push(IkePayload::IDr(core.local_id.clone()));
        msg.push(IkePayload::AUTH(auth));
        Ok(())
    }
}

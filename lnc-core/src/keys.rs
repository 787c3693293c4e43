use core::fmt;

use bitcoin::secp256k1::{self, All, PublicKey, Secp256k1, SecretKey};
use lightning::ln::chan_utils::{build_commitment_secret, CounterpartyCommitmentSecrets};
use serde_derive::{Deserialize, Serialize};
use serde_with::{hex::Hex, serde_as};

use crate::util::crypto_utils::hkdf_sha256_keys;
use crate::util::ser_util::CommitmentSecretsHandler;

/// Per-commitment secrets are generated from the seed at index `INITIAL_COMMITMENT_NUMBER - n`
/// for commitment number `n`
pub const INITIAL_COMMITMENT_NUMBER: u64 = (1 << 48) - 1;

/// The public half of one side's channel keys
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChannelPublicKeys {
    pub funding_pubkey: PublicKey,
    pub revocation_basepoint: PublicKey,
    /// Static, used directly for the counterparty's `to_remote` output
    pub payment_point: PublicKey,
    pub delayed_payment_basepoint: PublicKey,
    pub htlc_basepoint: PublicKey,
}

/// Local secret key material for one channel
#[serde_as]
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChannelKeys {
    pub funding_key: SecretKey,
    pub revocation_base_key: SecretKey,
    pub payment_key: SecretKey,
    pub delayed_payment_base_key: SecretKey,
    pub htlc_base_key: SecretKey,
    #[serde_as(as = "Hex")]
    pub commitment_seed: [u8; 32],
}

// Never print secrets
impl fmt::Debug for ChannelKeys {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ChannelKeys").finish_non_exhaustive()
    }
}

impl ChannelKeys {
    /// Derive the keys of channel `channel_index` from a node secret
    pub fn derive(node_secret: &[u8; 32], channel_index: u32) -> Result<Self, secp256k1::Error> {
        let mut info = b"lnc channel ".to_vec();
        info.extend_from_slice(&channel_index.to_be_bytes());
        let okm = hkdf_sha256_keys(node_secret, &info, &[]);
        let key = |i: usize| SecretKey::from_slice(&okm[i * 32..(i + 1) * 32]);
        let mut commitment_seed = [0u8; 32];
        commitment_seed.copy_from_slice(&okm[5 * 32..]);
        Ok(ChannelKeys {
            funding_key: key(0)?,
            revocation_base_key: key(1)?,
            payment_key: key(2)?,
            delayed_payment_base_key: key(3)?,
            htlc_base_key: key(4)?,
            commitment_seed,
        })
    }

    pub fn pubkeys(&self, secp_ctx: &Secp256k1<All>) -> ChannelPublicKeys {
        let public = |key: &SecretKey| PublicKey::from_secret_key(secp_ctx, key);
        ChannelPublicKeys {
            funding_pubkey: public(&self.funding_key),
            revocation_basepoint: public(&self.revocation_base_key),
            payment_point: public(&self.payment_key),
            delayed_payment_basepoint: public(&self.delayed_payment_base_key),
            htlc_basepoint: public(&self.htlc_base_key),
        }
    }

    /// The secret for our commitment `commitment_number`.
    /// Must not be revealed before commitment `commitment_number + 1` is held.
    pub fn per_commitment_secret(
        &self,
        commitment_number: u64,
    ) -> Result<SecretKey, secp256k1::Error> {
        let secret = build_commitment_secret(
            &self.commitment_seed,
            INITIAL_COMMITMENT_NUMBER - commitment_number,
        );
        SecretKey::from_slice(&secret)
    }

    pub fn per_commitment_point(
        &self,
        secp_ctx: &Secp256k1<All>,
        commitment_number: u64,
    ) -> Result<PublicKey, secp256k1::Error> {
        Ok(PublicKey::from_secret_key(secp_ctx, &self.per_commitment_secret(commitment_number)?))
    }
}

/// Per-commitment secrets revealed by the counterparty, in compact form
#[serde_as]
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RevealedSecrets(
    #[serde_as(as = "CommitmentSecretsHandler")] CounterpartyCommitmentSecrets,
);

impl fmt::Debug for RevealedSecrets {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RevealedSecrets").field("last_revealed", &self.last_revealed()).finish()
    }
}

impl Default for RevealedSecrets {
    fn default() -> Self {
        RevealedSecrets(CounterpartyCommitmentSecrets::new())
    }
}

impl RevealedSecrets {
    /// Record the secret for counterparty commitment `commitment_number`.
    /// Fails if it is inconsistent with the secrets already stored.
    pub fn provide(&mut self, commitment_number: u64, secret: [u8; 32]) -> Result<(), ()> {
        self.0.provide_secret(INITIAL_COMMITMENT_NUMBER - commitment_number, secret)
    }

    pub fn get(&self, commitment_number: u64) -> Option<[u8; 32]> {
        if commitment_number > INITIAL_COMMITMENT_NUMBER {
            return None;
        }
        let idx = INITIAL_COMMITMENT_NUMBER - commitment_number;
        if idx < self.0.get_min_seen_secret() {
            return None;
        }
        self.0.get_secret(idx)
    }

    /// The highest commitment number revealed so far
    pub fn last_revealed(&self) -> Option<u64> {
        let min = self.0.get_min_seen_secret();
        if min > INITIAL_COMMITMENT_NUMBER {
            None
        } else {
            Some(INITIAL_COMMITMENT_NUMBER - min)
        }
    }
}

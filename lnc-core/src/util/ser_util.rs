//! By convention, structs ending with `Handler` are serde_with adapters
//! for remote types that either lack serde support or need a canonical
//! encoding in the persisted JSON.

use std::borrow::Cow;

use bitcoin::consensus::encode;
use bitcoin::secp256k1::ecdsa::Signature;
use bitcoin::Transaction;
use lightning::ln::chan_utils::CounterpartyCommitmentSecrets;
use lightning::util::ser::{Readable, Writeable};
use lnc_protocol::msgs::{DeBolt, SerBolt};
use serde::de::Error as _;
use serde::{Deserialize, Deserializer, Serializer};
use serde_with::{DeserializeAs, SerializeAs};

fn deserialize_hex<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
    let res = <Cow<'de, str> as Deserialize<'de>>::deserialize(deserializer)?;
    hex::decode(&*res).map_err(D::Error::custom)
}

/// Signatures are stored in 64 byte compact form
#[derive(Copy, Clone, Debug, Default)]
pub struct SignatureHandler;

impl SerializeAs<Signature> for SignatureHandler {
    fn serialize_as<S>(source: &Signature, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&hex::encode(source.serialize_compact()))
    }
}

impl<'de> DeserializeAs<'de, Signature> for SignatureHandler {
    fn deserialize_as<D>(deserializer: D) -> Result<Signature, D::Error>
    where
        D: Deserializer<'de>,
    {
        let bytes = deserialize_hex(deserializer)?;
        Signature::from_compact(&bytes).map_err(D::Error::custom)
    }
}

/// Transactions are stored as consensus-encoded hex
#[derive(Copy, Clone, Debug, Default)]
pub struct TransactionHandler;

impl SerializeAs<Transaction> for TransactionHandler {
    fn serialize_as<S>(source: &Transaction, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&encode::serialize_hex(source))
    }
}

impl<'de> DeserializeAs<'de, Transaction> for TransactionHandler {
    fn deserialize_as<D>(deserializer: D) -> Result<Transaction, D::Error>
    where
        D: Deserializer<'de>,
    {
        let bytes = deserialize_hex(deserializer)?;
        encode::deserialize(&bytes).map_err(D::Error::custom)
    }
}

/// The counterparty's revealed secrets, in their compact shachain form
#[derive(Copy, Clone, Debug, Default)]
pub struct CommitmentSecretsHandler;

impl SerializeAs<CounterpartyCommitmentSecrets> for CommitmentSecretsHandler {
    fn serialize_as<S>(
        source: &CounterpartyCommitmentSecrets,
        serializer: S,
    ) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&hex::encode(source.encode()))
    }
}

impl<'de> DeserializeAs<'de, CounterpartyCommitmentSecrets> for CommitmentSecretsHandler {
    fn deserialize_as<D>(deserializer: D) -> Result<CounterpartyCommitmentSecrets, D::Error>
    where
        D: Deserializer<'de>,
    {
        let bytes = deserialize_hex(deserializer)?;
        let mut cursor = lightning::io::Cursor::new(bytes);
        CounterpartyCommitmentSecrets::read(&mut cursor)
            .map_err(|e| D::Error::custom(format!("commitment secrets: {:?}", e)))
    }
}

/// Peer messages are stored in their wire encoding, type prefix included
#[derive(Copy, Clone, Debug, Default)]
pub struct WireHandler;

impl<T: SerBolt> SerializeAs<T> for WireHandler {
    fn serialize_as<S>(source: &T, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&hex::encode(source.as_vec()))
    }
}

impl<'de, T: DeBolt> DeserializeAs<'de, T> for WireHandler {
    fn deserialize_as<D>(deserializer: D) -> Result<T, D::Error>
    where
        D: Deserializer<'de>,
    {
        let bytes = deserialize_hex(deserializer)?;
        T::from_vec(bytes).map_err(D::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bitcoin::secp256k1::{Message, Secp256k1, SecretKey};
    use serde_derive::{Deserialize, Serialize};
    use serde_with::serde_as;
    use test_log::test;

    #[serde_as]
    #[derive(PartialEq, Serialize, Deserialize)]
    struct Holder {
        #[serde_as(as = "SignatureHandler")]
        sig: Signature,
        #[serde_as(as = "Vec<SignatureHandler>")]
        sigs: Vec<Signature>,
        #[serde_as(as = "CommitmentSecretsHandler")]
        secrets: CounterpartyCommitmentSecrets,
    }

    #[test]
    fn signatures_are_compact_hex() {
        let secp_ctx = Secp256k1::new();
        let key = SecretKey::from_slice(&[9u8; 32]).unwrap();
        let sig = secp_ctx.sign_ecdsa(&Message::from_digest([3u8; 32]), &key);
        let mut secrets = CounterpartyCommitmentSecrets::new();
        let idx = (1u64 << 48) - 1;
        secrets.provide_secret(idx, [5u8; 32]).unwrap();
        let holder = Holder { sig, sigs: vec![sig], secrets };

        let json = serde_json::to_string(&holder).unwrap();
        assert!(json.contains(&hex::encode(sig.serialize_compact())));
        let back: Holder = serde_json::from_str(&json).unwrap();
        assert!(back == holder);
        assert_eq!(back.secrets.get_secret(idx), Some([5u8; 32]));
    }

    #[test]
    fn rejects_bad_hex() {
        let json = r#"{"sig":"zz","sigs":[],"secrets":""}"#;
        assert!(serde_json::from_str::<Holder>(json).is_err());
    }
}

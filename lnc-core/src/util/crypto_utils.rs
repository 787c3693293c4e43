use bitcoin::hashes::sha256::Hash as BitcoinSha256;
use bitcoin::hashes::{Hash, HashEngine, Hmac, HmacEngine};
use bitcoin::secp256k1::{self, ecdsa::Signature, All, Message, PublicKey, Secp256k1, SecretKey};
use bitcoin::sighash::{EcdsaSighashType, SighashCache};
use bitcoin::{Amount, Script, Transaction};

fn hkdf_extract_expand(salt: &[u8], secret: &[u8], info: &[u8], output: &mut [u8]) {
    let mut hmac = HmacEngine::<BitcoinSha256>::new(salt);
    hmac.input(secret);
    let prk = Hmac::from_engine(hmac).to_byte_array();

    let mut t = [0; 32];
    let mut n: u8 = 0;

    for chunk in output.chunks_mut(32) {
        let mut hmac = HmacEngine::<BitcoinSha256>::new(&prk[..]);
        n = n.wrapping_add(1);
        if n != 1 {
            hmac.input(&t);
        }
        hmac.input(info);
        hmac.input(&[n]);
        t = Hmac::from_engine(hmac).to_byte_array();
        chunk.copy_from_slice(&t[..chunk.len()]);
    }
}

/// derive a secret from another secret using HKDF-SHA256
pub fn hkdf_sha256(secret: &[u8], info: &[u8], salt: &[u8]) -> [u8; 32] {
    let mut result = [0u8; 32];
    hkdf_extract_expand(salt, secret, info, &mut result);
    result
}

pub(crate) fn hkdf_sha256_keys(secret: &[u8], info: &[u8], salt: &[u8]) -> [u8; 32 * 6] {
    let mut result = [0u8; 32 * 6];
    hkdf_extract_expand(salt, secret, info, &mut result);
    result
}

/// Convert a [Signature] to Bitcoin signature bytes, with SIGHASH_ALL
pub fn signature_to_bitcoin_vec(sig: Signature) -> Vec<u8> {
    let mut sigvec = sig.serialize_der().to_vec();
    sigvec.push(EcdsaSighashType::All as u8);
    sigvec
}

/// Convert a Bitcoin signature bytes, with the specified EcdsaSighashType, to [Signature]
pub fn bitcoin_vec_to_signature(
    sigvec: &[u8],
    sighash_type: EcdsaSighashType,
) -> Result<Signature, secp256k1::Error> {
    let mut sv = sigvec.to_vec();
    let mode = sv.pop().ok_or(secp256k1::Error::InvalidSignature)?;
    if mode != sighash_type as u8 {
        return Err(secp256k1::Error::InvalidSignature);
    }
    Signature::from_der(&sv[..])
}

fn p2wsh_sighash(
    tx: &Transaction,
    input_index: usize,
    witness_script: &Script,
    value: Amount,
) -> Result<Message, secp256k1::Error> {
    let sighash = SighashCache::new(tx)
        .p2wsh_signature_hash(input_index, witness_script, value, EcdsaSighashType::All)
        .map_err(|_| secp256k1::Error::InvalidMessage)?;
    Ok(Message::from_digest(sighash.to_byte_array()))
}

/// Sign a P2WSH input with SIGHASH_ALL
pub fn sign_p2wsh_input(
    secp_ctx: &Secp256k1<All>,
    tx: &Transaction,
    input_index: usize,
    witness_script: &Script,
    value: Amount,
    key: &SecretKey,
) -> Result<Signature, secp256k1::Error> {
    let message = p2wsh_sighash(tx, input_index, witness_script, value)?;
    Ok(secp_ctx.sign_ecdsa(&message, key))
}

/// Verify a SIGHASH_ALL signature on a P2WSH input
pub fn verify_p2wsh_input(
    secp_ctx: &Secp256k1<All>,
    tx: &Transaction,
    input_index: usize,
    witness_script: &Script,
    value: Amount,
    sig: &Signature,
    pubkey: &PublicKey,
) -> bool {
    match p2wsh_sighash(tx, input_index, witness_script, value) {
        Ok(message) => secp_ctx.verify_ecdsa(&message, sig, pubkey).is_ok(),
        Err(_) => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_log::test;

    #[test]
    fn test_hkdf() {
        let secret = [1u8];
        let info = [2u8];
        let salt = [3u8];
        let mut output = [0u8; 32];
        hkdf_extract_expand(&salt, &secret, &info, &mut output);
        assert_eq!(
            hex::encode(output),
            "13a04658302cc5173a8077f2f296662a7a3ddb2359be92770b13e0b9e63a23d0"
        );
        assert_eq!(&hkdf_sha256_keys(&secret, &info, &salt)[..32], &output[..]);
    }

    #[test]
    fn revocation_key_spendable_after_secret_revealed() {
        use lightning::ln::chan_utils::derive_private_revocation_key;
        use lightning::ln::channel_keys::{RevocationBasepoint, RevocationKey};

        let secp_ctx = Secp256k1::new();
        let per_commitment_secret = SecretKey::from_slice(&[0x11; 32]).unwrap();
        let revocation_base_secret = SecretKey::from_slice(&[0x22; 32]).unwrap();
        let per_commitment_point = PublicKey::from_secret_key(&secp_ctx, &per_commitment_secret);
        let revocation_basepoint =
            RevocationBasepoint::from(PublicKey::from_secret_key(&secp_ctx, &revocation_base_secret));

        let pubkey =
            RevocationKey::from_basepoint(&secp_ctx, &revocation_basepoint, &per_commitment_point);
        let privkey =
            derive_private_revocation_key(&secp_ctx, &per_commitment_secret, &revocation_base_secret);
        assert_eq!(PublicKey::from_secret_key(&secp_ctx, &privkey), pubkey.to_public_key());

        // a signature with the derived key verifies against the commitment's revocation key
        let mut tx = Transaction {
            version: bitcoin::transaction::Version::TWO,
            lock_time: bitcoin::absolute::LockTime::ZERO,
            input: vec![bitcoin::TxIn::default()],
            output: vec![],
        };
        tx.input[0].sequence = bitcoin::Sequence::ZERO;
        let script = bitcoin::ScriptBuf::new();
        let sig = sign_p2wsh_input(&secp_ctx, &tx, 0, &script, Amount::from_sat(1000), &privkey)
            .unwrap();
        assert!(verify_p2wsh_input(
            &secp_ctx,
            &tx,
            0,
            &script,
            Amount::from_sat(1000),
            &sig,
            &pubkey.to_public_key()
        ));
    }

    #[test]
    fn test_bitcoin_vec_to_signature() {
        let secp_ctx = Secp256k1::new();
        let key = SecretKey::from_slice(&[0x55; 32]).unwrap();
        let sig = secp_ctx.sign_ecdsa(&Message::from_digest([7u8; 32]), &key);
        let vec = signature_to_bitcoin_vec(sig);
        assert_eq!(bitcoin_vec_to_signature(&vec, EcdsaSighashType::All).unwrap(), sig);
        assert!(bitcoin_vec_to_signature(&vec, EcdsaSighashType::None).is_err());
        assert!(bitcoin_vec_to_signature(&[], EcdsaSighashType::All).is_err());
    }
}

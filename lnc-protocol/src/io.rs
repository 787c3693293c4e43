use std::io::Read;

use bitcoin::secp256k1::{ecdsa::Signature, PublicKey};

use crate::error::{Error, Result};

fn fill<R: Read>(reader: &mut R, buf: &mut [u8]) -> Result<()> {
    let mut filled = 0;
    while filled < buf.len() {
        let len = reader.read(&mut buf[filled..]).map_err(|e| Error::Io(e.kind()))?;
        if len == 0 {
            return Err(if filled == 0 { Error::Eof } else { Error::ShortRead });
        }
        filled += len;
    }
    Ok(())
}

pub(crate) fn read_bytes<R: Read, const N: usize>(reader: &mut R) -> Result<[u8; N]> {
    let mut buf = [0u8; N];
    fill(reader, &mut buf)?;
    Ok(buf)
}

pub(crate) fn read_u64<R: Read>(reader: &mut R) -> Result<u64> {
    Ok(u64::from_be_bytes(read_bytes(reader)?))
}

pub(crate) fn read_u32<R: Read>(reader: &mut R) -> Result<u32> {
    Ok(u32::from_be_bytes(read_bytes(reader)?))
}

pub(crate) fn read_u16<R: Read>(reader: &mut R) -> Result<u16> {
    Ok(u16::from_be_bytes(read_bytes(reader)?))
}

/// A u16 length followed by that many bytes
pub(crate) fn read_var_bytes<R: Read>(reader: &mut R) -> Result<Vec<u8>> {
    let len = read_u16(reader)? as usize;
    let mut buf = vec![0u8; len];
    if len > 0 {
        fill(reader, &mut buf).map_err(|_| Error::ShortRead)?;
    }
    Ok(buf)
}

pub(crate) fn read_pubkey<R: Read>(reader: &mut R) -> Result<PublicKey> {
    let buf: [u8; 33] = read_bytes(reader)?;
    PublicKey::from_slice(&buf).map_err(|_| Error::InvalidValue("point"))
}

pub(crate) fn read_signature<R: Read>(reader: &mut R) -> Result<Signature> {
    let buf: [u8; 64] = read_bytes(reader)?;
    Signature::from_compact(&buf).map_err(|_| Error::InvalidValue("signature"))
}

pub(crate) fn write_u16(out: &mut Vec<u8>, val: u16) {
    out.extend_from_slice(&val.to_be_bytes());
}

pub(crate) fn write_u32(out: &mut Vec<u8>, val: u32) {
    out.extend_from_slice(&val.to_be_bytes());
}

pub(crate) fn write_u64(out: &mut Vec<u8>, val: u64) {
    out.extend_from_slice(&val.to_be_bytes());
}

/// Callers keep `bytes` below 64KiB; longer input is truncated
pub(crate) fn write_var_bytes(out: &mut Vec<u8>, bytes: &[u8]) {
    let len = bytes.len().min(u16::MAX as usize);
    write_u16(out, len as u16);
    out.extend_from_slice(&bytes[..len]);
}

pub(crate) fn write_pubkey(out: &mut Vec<u8>, key: &PublicKey) {
    out.extend_from_slice(&key.serialize());
}

pub(crate) fn write_signature(out: &mut Vec<u8>, sig: &Signature) {
    out.extend_from_slice(&sig.serialize_compact());
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_log::test;

    #[test]
    fn eof_versus_short_read() {
        let empty: &[u8] = &[];
        assert_eq!(read_u32(&mut &empty[..]), Err(Error::Eof));
        let short: &[u8] = &[1, 2];
        assert_eq!(read_u32(&mut &short[..]), Err(Error::ShortRead));
        let ok: &[u8] = &[0, 0, 1, 2];
        assert_eq!(read_u32(&mut &ok[..]), Ok(258));
    }

    #[test]
    fn var_bytes_length_prefix() {
        let mut out = Vec::new();
        write_var_bytes(&mut out, b"abc");
        assert_eq!(out, vec![0, 3, b'a', b'b', b'c']);
        assert_eq!(read_var_bytes(&mut &out[..]).unwrap(), b"abc".to_vec());
        assert_eq!(read_var_bytes(&mut &out[..4]), Err(Error::ShortRead));
    }
}

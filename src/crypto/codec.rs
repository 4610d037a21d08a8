//! Signed and encrypted block framing for usage-table blobs.
//!
//! ```text
//! signature (32, HMAC-SHA256 over iv | ciphertext)
//! iv        (16)
//! ciphertext: AES-128-CBC, PKCS#7, of magic (8) | payload
//! ```

use aes::cipher::{BlockDecryptMut, BlockEncryptMut, KeyIvInit};
use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use hmac::{Hmac, Mac};
use rand_core::{OsRng, RngCore};
use sha2::Sha256;

use crate::error::{Error, Result};

type Aes128CbcEnc = cbc::Encryptor<aes::Aes128>;
type Aes128CbcDec = cbc::Decryptor<aes::Aes128>;
type HmacSha256 = Hmac<Sha256>;

pub const HEADER_MAGIC: &[u8; 8] = b"USEHEADR";
pub const ENTRY_MAGIC: &[u8; 8] = b"USEENTRY";

const SIGNATURE_LEN: usize = 32;
const IV_LEN: usize = 16;
const BLOCK_LEN: usize = 16;

fn mac(key: &[u8; 16]) -> Result<HmacSha256> {
    HmacSha256::new_from_slice(key).map_err(|e| Error::Other(format!("Invalid HMAC key: {}", e)))
}

/// Encrypt and sign `payload` under `key`.
pub fn seal(key: &[u8; 16], magic: &[u8; 8], payload: &[u8]) -> Result<Vec<u8>> {
    let mut iv = [0u8; IV_LEN];
    OsRng.fill_bytes(&mut iv);

    let plain_len = magic.len() + payload.len();
    let mut buffer = Vec::with_capacity(plain_len + BLOCK_LEN);
    buffer.extend_from_slice(magic);
    buffer.extend_from_slice(payload);
    buffer.resize(plain_len + BLOCK_LEN - plain_len % BLOCK_LEN, 0);

    let ciphertext = Aes128CbcEnc::new(&(*key).into(), &iv.into())
        .encrypt_padded_mut::<aes::cipher::block_padding::Pkcs7>(&mut buffer, plain_len)
        .map_err(|e| Error::Other(format!("Failed to encrypt block: {}", e)))?
        .to_vec();

    let mut signer = mac(key)?;
    signer.update(&iv);
    signer.update(&ciphertext);
    let signature = signer.finalize().into_bytes();

    let mut blob = Vec::with_capacity(SIGNATURE_LEN + IV_LEN + ciphertext.len());
    blob.extend_from_slice(&signature);
    blob.extend_from_slice(&iv);
    blob.extend_from_slice(&ciphertext);
    Ok(blob)
}

/// Verify and decrypt a block sealed with `magic`, returning the payload.
///
/// `kind` names the block in errors.
pub fn open(key: &[u8; 16], magic: &[u8; 8], kind: &'static str, blob: &[u8]) -> Result<Vec<u8>> {
    if blob.len() < SIGNATURE_LEN + IV_LEN + BLOCK_LEN {
        return Err(Error::MalformedBlock(format!(
            "{} block too short: {} bytes",
            kind,
            blob.len()
        )));
    }
    let (signature, rest) = blob.split_at(SIGNATURE_LEN);
    let (iv, ciphertext) = rest.split_at(IV_LEN);
    if ciphertext.len() % BLOCK_LEN != 0 {
        return Err(Error::MalformedBlock(format!(
            "{} ciphertext is not block aligned",
            kind
        )));
    }

    let mut verifier = mac(key)?;
    verifier.update(iv);
    verifier.update(ciphertext);
    verifier
        .verify_slice(signature)
        .map_err(|_| Error::SignatureMismatch(format!("{} block signature", kind)))?;

    let iv: [u8; IV_LEN] = iv
        .try_into()
        .map_err(|_| Error::MalformedBlock(format!("{} iv", kind)))?;
    let mut buffer = ciphertext.to_vec();
    let plain = Aes128CbcDec::new(&(*key).into(), &iv.into())
        .decrypt_padded_mut::<aes::cipher::block_padding::Pkcs7>(&mut buffer)
        .map_err(|e| Error::MalformedBlock(format!("{} padding: {}", kind, e)))?;

    if plain.len() < magic.len() || &plain[..magic.len()] != magic {
        return Err(Error::BadMagic(kind));
    }
    Ok(plain[magic.len()..].to_vec())
}

/// Plaintext of a usage table header.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HeaderPayload {
    pub master_generation: i64,
    /// Generation number of every entry, by index.
    pub generations: Vec<i64>,
}

impl HeaderPayload {
    pub fn encode(&self) -> Result<Vec<u8>> {
        let mut out = Vec::with_capacity(12 + 8 * self.generations.len());
        out.write_i64::<LittleEndian>(self.master_generation)?;
        out.write_u32::<LittleEndian>(self.generations.len() as u32)?;
        for generation in &self.generations {
            out.write_i64::<LittleEndian>(*generation)?;
        }
        Ok(out)
    }

    pub fn decode(data: &[u8]) -> Result<Self> {
        let mut reader = data;
        let master_generation = reader.read_i64::<LittleEndian>()?;
        let count = reader.read_u32::<LittleEndian>()? as usize;
        if reader.len() != count * 8 {
            return Err(Error::MalformedBlock(format!(
                "header lists {} entries but carries {} bytes",
                count,
                reader.len()
            )));
        }
        let mut generations = Vec::with_capacity(count);
        for _ in 0..count {
            generations.push(reader.read_i64::<LittleEndian>()?);
        }
        Ok(Self {
            master_generation,
            generations,
        })
    }
}

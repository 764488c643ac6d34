//! Sealing and opening of individual data sectors.

use subtle::ConstantTimeEq;

use tokenkms_common::{Error, Result};
use tokenkms_crypto::{
    CipherMode, CipherParams, CryptoToken, Direction, Signature, BLOCK_SIZE, SIGNATURE_SIZE,
};

use crate::header::FileHeader;
use crate::layout::{add_counter_offset, SectorLayout, USED_LEN_SIZE};

/// Largest chunk handed to a single session update.
const UPDATE_CHUNK: usize = 64 * BLOCK_SIZE;

/// Run a whole buffer through one token session in block-aligned chunks.
pub(crate) fn run_session(
    token: &dyn CryptoToken,
    params: &CipherParams,
    data: &mut [u8],
) -> Result<Option<Signature>> {
    let mut session = token.begin_cipher(params)?;
    for chunk in data.chunks_mut(UPDATE_CHUNK) {
        session.update(chunk)?;
    }
    session.finalize()
}

/// Compare a recomputed signature with the stored one.
pub(crate) fn verify_signature(
    computed: Option<Signature>,
    stored: &[u8],
    what: &str,
) -> Result<()> {
    let computed =
        computed.ok_or_else(|| Error::Crypto("Token returned no signature".to_string()))?;
    if stored.len() != SIGNATURE_SIZE || !bool::from(computed[..].ct_eq(stored)) {
        return Err(Error::Integrity(format!("Signature mismatch in {}", what)));
    }
    Ok(())
}

/// Decrypted content of a data sector.
pub(crate) struct SectorPayload {
    /// Logical bytes in use.
    pub used: usize,
    /// Full payload area, zero past `used` on freshly written sectors.
    pub data: Vec<u8>,
}

impl SectorPayload {
    pub(crate) fn empty(layout: &SectorLayout) -> Self {
        Self {
            used: 0,
            data: vec![0u8; layout.payload_size()],
        }
    }
}

fn sector_params(header: &FileHeader, layout: &SectorLayout, index: u64, direction: Direction) -> CipherParams {
    let iv = add_counter_offset(&header.ctr_nonce, index * layout.blocks_per_sector());
    CipherParams::new(header.key_id, header.algorithm, CipherMode::Ctr, direction)
        .with_iv(iv)
        .authenticated(header.derivation_nonce)
}

/// Encrypt and sign a data sector.
pub(crate) fn seal(
    token: &dyn CryptoToken,
    header: &FileHeader,
    layout: &SectorLayout,
    index: u64,
    payload: &SectorPayload,
) -> Result<Vec<u8>> {
    let used = u16::try_from(payload.used)
        .ok()
        .filter(|&u| (u as usize) <= layout.payload_size())
        .ok_or_else(|| Error::Parameter(format!("Used length {} too large", payload.used)))?;

    let mut sector = vec![0u8; layout.sector_size()];
    let encrypted = layout.encrypted_size();
    sector[..USED_LEN_SIZE].copy_from_slice(&used.to_le_bytes());
    let start = layout.payload_offset();
    sector[start..start + payload.data.len()].copy_from_slice(&payload.data);

    let params = sector_params(header, layout, index, Direction::Encrypt);
    let signature = run_session(token, &params, &mut sector[..encrypted])?
        .ok_or_else(|| Error::Crypto("Token returned no signature".to_string()))?;
    sector[encrypted..].copy_from_slice(&signature);
    Ok(sector)
}

/// Decrypt and verify a data sector.
pub(crate) fn open(
    token: &dyn CryptoToken,
    header: &FileHeader,
    layout: &SectorLayout,
    index: u64,
    mut sector: Vec<u8>,
) -> Result<SectorPayload> {
    if sector.len() != layout.sector_size() {
        return Err(Error::Integrity(format!("Sector {} is truncated", index)));
    }
    let encrypted = layout.encrypted_size();
    let params = sector_params(header, layout, index, Direction::Decrypt);
    let (body, stored) = sector.split_at_mut(encrypted);
    let computed = run_session(token, &params, body)?;
    verify_signature(computed, stored, &format!("sector {}", index))?;

    let used = u16::from_le_bytes([body[0], body[1]]) as usize;
    if used > layout.payload_size() {
        return Err(Error::Integrity(format!(
            "Sector {} claims {} used bytes",
            index, used
        )));
    }
    let start = layout.payload_offset();
    Ok(SectorPayload {
        used,
        data: body[start..].to_vec(),
    })
}

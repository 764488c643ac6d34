//! Software implementation of the token contract.
//!
//! `SoftToken` keeps keys in process memory and implements the cipher
//! sessions with the RustCrypto AES, CBC, CTR and HMAC crates. It is used in tests
//! and on hosts without an attached device; it offers none of the tamper
//! resistance of real hardware.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard};

use aes::cipher::{
    generic_array::GenericArray, BlockDecrypt, BlockDecryptMut, BlockEncrypt, BlockEncryptMut,
    KeyInit, KeyIvInit, StreamCipher,
};
use aes::{Aes128, Aes192, Aes256};
use ctr::Ctr128BE;
use hmac::{Hmac, Mac};
use sha2::Sha256;
use subtle::ConstantTimeEq;
use tracing::debug;

use tokenkms_common::{Error, Result};

use crate::algorithm::{
    Algorithm, CipherMode, Direction, BLOCK_SIZE, DERIVATION_NONCE_SIZE, SIGNATURE_SIZE,
};
use crate::keys::KeyMaterial;
use crate::token::{
    CipherParams, CipherSession, CryptoToken, DeviceInfo, DeviceManager, LoginRole, Signature,
    TokenKeyInfo,
};

type HmacSha256 = Hmac<Sha256>;

/// Label mixed into MAC key derivation.
const MAC_LABEL: &[u8] = b"tokenkms/sector-mac";

/// Derivation nonce used for key wrapping.
const WRAP_NONCE: [u8; DERIVATION_NONCE_SIZE] = [0x57; DERIVATION_NONCE_SIZE];

fn new_mac(key: &[u8]) -> Result<HmacSha256> {
    <HmacSha256 as Mac>::new_from_slice(key)
        .map_err(|e| Error::Crypto(format!("MAC init failed: {}", e)))
}

fn derive_mac_key(key: &[u8], nonce: &[u8; DERIVATION_NONCE_SIZE]) -> Result<[u8; SIGNATURE_SIZE]> {
    let mut mac = new_mac(key)?;
    mac.update(MAC_LABEL);
    mac.update(nonce);
    Ok(mac.finalize().into_bytes().into())
}

enum BlockCipher {
    Aes128(Aes128),
    Aes192(Aes192),
    Aes256(Aes256),
}

impl BlockCipher {
    fn new(algorithm: Algorithm, key: &[u8]) -> Result<Self> {
        let invalid = |_| Error::Crypto("Invalid key length for block cipher".to_string());
        Ok(match algorithm {
            Algorithm::Aes128 => BlockCipher::Aes128(Aes128::new_from_slice(key).map_err(invalid)?),
            Algorithm::Aes192 => BlockCipher::Aes192(Aes192::new_from_slice(key).map_err(invalid)?),
            Algorithm::Aes256 => BlockCipher::Aes256(Aes256::new_from_slice(key).map_err(invalid)?),
        })
    }

    fn encrypt_block(&self, block: &mut [u8]) {
        let block = GenericArray::from_mut_slice(block);
        match self {
            BlockCipher::Aes128(c) => c.encrypt_block(block),
            BlockCipher::Aes192(c) => c.encrypt_block(block),
            BlockCipher::Aes256(c) => c.encrypt_block(block),
        }
    }

    fn decrypt_block(&self, block: &mut [u8]) {
        let block = GenericArray::from_mut_slice(block);
        match self {
            BlockCipher::Aes128(c) => c.decrypt_block(block),
            BlockCipher::Aes192(c) => c.decrypt_block(block),
            BlockCipher::Aes256(c) => c.decrypt_block(block),
        }
    }
}

enum ChainCipher {
    Encrypt128(cbc::Encryptor<Aes128>),
    Encrypt192(cbc::Encryptor<Aes192>),
    Encrypt256(cbc::Encryptor<Aes256>),
    Decrypt128(cbc::Decryptor<Aes128>),
    Decrypt192(cbc::Decryptor<Aes192>),
    Decrypt256(cbc::Decryptor<Aes256>),
}

impl ChainCipher {
    fn new(
        algorithm: Algorithm,
        direction: Direction,
        key: &[u8],
        iv: &[u8; BLOCK_SIZE],
    ) -> Result<Self> {
        let invalid = |_| Error::Crypto("Invalid key or IV length for CBC".to_string());
        Ok(match (direction, algorithm) {
            (Direction::Encrypt, Algorithm::Aes128) => {
                ChainCipher::Encrypt128(cbc::Encryptor::new_from_slices(key, iv).map_err(invalid)?)
            }
            (Direction::Encrypt, Algorithm::Aes192) => {
                ChainCipher::Encrypt192(cbc::Encryptor::new_from_slices(key, iv).map_err(invalid)?)
            }
            (Direction::Encrypt, Algorithm::Aes256) => {
                ChainCipher::Encrypt256(cbc::Encryptor::new_from_slices(key, iv).map_err(invalid)?)
            }
            (Direction::Decrypt, Algorithm::Aes128) => {
                ChainCipher::Decrypt128(cbc::Decryptor::new_from_slices(key, iv).map_err(invalid)?)
            }
            (Direction::Decrypt, Algorithm::Aes192) => {
                ChainCipher::Decrypt192(cbc::Decryptor::new_from_slices(key, iv).map_err(invalid)?)
            }
            (Direction::Decrypt, Algorithm::Aes256) => {
                ChainCipher::Decrypt256(cbc::Decryptor::new_from_slices(key, iv).map_err(invalid)?)
            }
        })
    }

    /// Chains across calls; `data` must be block aligned.
    fn apply(&mut self, data: &mut [u8]) {
        for block in data.chunks_exact_mut(BLOCK_SIZE) {
            let block = GenericArray::from_mut_slice(block);
            match self {
                ChainCipher::Encrypt128(c) => c.encrypt_block_mut(block),
                ChainCipher::Encrypt192(c) => c.encrypt_block_mut(block),
                ChainCipher::Encrypt256(c) => c.encrypt_block_mut(block),
                ChainCipher::Decrypt128(c) => c.decrypt_block_mut(block),
                ChainCipher::Decrypt192(c) => c.decrypt_block_mut(block),
                ChainCipher::Decrypt256(c) => c.decrypt_block_mut(block),
            }
        }
    }
}

enum CounterCipher {
    Aes128(Ctr128BE<Aes128>),
    Aes192(Ctr128BE<Aes192>),
    Aes256(Ctr128BE<Aes256>),
}

impl CounterCipher {
    fn new(algorithm: Algorithm, key: &[u8], iv: &[u8; BLOCK_SIZE]) -> Result<Self> {
        let invalid = |_| Error::Crypto("Invalid key or IV length for CTR".to_string());
        Ok(match algorithm {
            Algorithm::Aes128 => {
                CounterCipher::Aes128(Ctr128BE::new_from_slices(key, iv).map_err(invalid)?)
            }
            Algorithm::Aes192 => {
                CounterCipher::Aes192(Ctr128BE::new_from_slices(key, iv).map_err(invalid)?)
            }
            Algorithm::Aes256 => {
                CounterCipher::Aes256(Ctr128BE::new_from_slices(key, iv).map_err(invalid)?)
            }
        })
    }

    fn apply(&mut self, data: &mut [u8]) {
        match self {
            CounterCipher::Aes128(c) => c.apply_keystream(data),
            CounterCipher::Aes192(c) => c.apply_keystream(data),
            CounterCipher::Aes256(c) => c.apply_keystream(data),
        }
    }
}

enum Engine {
    Ecb(BlockCipher),
    Cbc(ChainCipher),
    Ctr(CounterCipher),
}

struct SoftSession {
    engine: Engine,
    direction: Direction,
    mac: Option<HmacSha256>,
}

impl SoftSession {
    fn start(key: &KeyMaterial, params: &CipherParams) -> Result<Self> {
        if key.len() != params.algorithm.key_len() {
            return Err(Error::Crypto(format!(
                "Key {} does not match algorithm {:?}",
                params.key_id, params.algorithm
            )));
        }

        let engine = match params.mode {
            CipherMode::Ecb => Engine::Ecb(BlockCipher::new(params.algorithm, key.as_bytes())?),
            CipherMode::Cbc => Engine::Cbc(ChainCipher::new(
                params.algorithm,
                params.direction,
                key.as_bytes(),
                &params.iv,
            )?),
            CipherMode::Ctr => Engine::Ctr(CounterCipher::new(
                params.algorithm,
                key.as_bytes(),
                &params.iv,
            )?),
        };

        let mac = match &params.derivation_nonce {
            Some(nonce) => {
                let mac_key = derive_mac_key(key.as_bytes(), nonce)?;
                let mut mac = new_mac(&mac_key)?;
                mac.update(&params.iv);
                Some(mac)
            }
            None => None,
        };

        Ok(Self {
            engine,
            direction: params.direction,
            mac,
        })
    }

    fn transform(&mut self, data: &mut [u8]) -> Result<()> {
        let direction = self.direction;
        match &mut self.engine {
            Engine::Ecb(cipher) => {
                check_aligned(data)?;
                for block in data.chunks_exact_mut(BLOCK_SIZE) {
                    match direction {
                        Direction::Encrypt => cipher.encrypt_block(block),
                        Direction::Decrypt => cipher.decrypt_block(block),
                    }
                }
            }
            Engine::Cbc(cipher) => {
                check_aligned(data)?;
                cipher.apply(data);
            }
            Engine::Ctr(cipher) => cipher.apply(data),
        }
        Ok(())
    }
}

impl CipherSession for SoftSession {
    fn update(&mut self, data: &mut [u8]) -> Result<()> {
        if self.direction == Direction::Decrypt {
            if let Some(mac) = self.mac.as_mut() {
                mac.update(data);
            }
        }
        self.transform(data)?;
        if self.direction == Direction::Encrypt {
            if let Some(mac) = self.mac.as_mut() {
                mac.update(data);
            }
        }
        Ok(())
    }

    fn finalize(self: Box<Self>) -> Result<Option<Signature>> {
        Ok(self.mac.map(|mac| mac.finalize().into_bytes().into()))
    }
}

fn check_aligned(data: &[u8]) -> Result<()> {
    if data.len() % BLOCK_SIZE != 0 {
        return Err(Error::Parameter(format!(
            "Block mode input of {} bytes is not a multiple of {}",
            data.len(),
            BLOCK_SIZE
        )));
    }
    Ok(())
}

struct SoftState {
    keys: BTreeMap<u32, KeyMaterial>,
    login: Option<LoginRole>,
}

/// In-memory token.
pub struct SoftToken {
    serial: String,
    user_pin: String,
    admin_pin: String,
    state: Mutex<SoftState>,
}

impl SoftToken {
    /// Create an empty token with the given serial number and PINs.
    pub fn new(
        serial: impl Into<String>,
        user_pin: impl Into<String>,
        admin_pin: impl Into<String>,
    ) -> Self {
        Self {
            serial: serial.into(),
            user_pin: user_pin.into(),
            admin_pin: admin_pin.into(),
            state: Mutex::new(SoftState {
                keys: BTreeMap::new(),
                login: None,
            }),
        }
    }

    fn state(&self) -> Result<MutexGuard<'_, SoftState>> {
        self.state
            .lock()
            .map_err(|_| Error::Crypto("Token state poisoned".to_string()))
    }

    fn logged_in_state(&self) -> Result<MutexGuard<'_, SoftState>> {
        let state = self.state()?;
        if state.login.is_none() {
            return Err(Error::Authorization("Token is not logged in".to_string()));
        }
        Ok(state)
    }

    fn key(state: &SoftState, key_id: u32) -> Result<&KeyMaterial> {
        state
            .keys
            .get(&key_id)
            .ok_or_else(|| Error::NotFound(format!("Token key {} not found", key_id)))
    }
}

impl CryptoToken for SoftToken {
    fn serial_number(&self) -> &str {
        &self.serial
    }

    fn login(&self, pin: &str, role: LoginRole) -> Result<()> {
        let expected = match role {
            LoginRole::User => &self.user_pin,
            LoginRole::Admin => &self.admin_pin,
        };
        if !bool::from(pin.as_bytes().ct_eq(expected.as_bytes())) {
            return Err(Error::Authorization("Invalid PIN".to_string()));
        }
        self.state()?.login = Some(role);
        debug!(serial = %self.serial, ?role, "Token login");
        Ok(())
    }

    fn logout(&self) -> Result<()> {
        self.state()?.login = None;
        Ok(())
    }

    fn logged_in_as(&self) -> Option<LoginRole> {
        self.state().ok().and_then(|s| s.login)
    }

    fn random_bytes(&self, buf: &mut [u8]) -> Result<()> {
        use rand::RngCore;
        rand::rngs::OsRng
            .try_fill_bytes(buf)
            .map_err(|e| Error::Crypto(format!("Random generation failed: {}", e)))
    }

    fn begin_cipher(&self, params: &CipherParams) -> Result<Box<dyn CipherSession>> {
        let state = self.logged_in_state()?;
        let key = Self::key(&state, params.key_id)?;
        Ok(Box::new(SoftSession::start(key, params)?))
    }

    fn generate_key(&self, key_id: u32, length: usize) -> Result<()> {
        let material = KeyMaterial::generate(length)?;
        self.logged_in_state()?.keys.insert(key_id, material);
        Ok(())
    }

    fn insert_key(&self, key_id: u32, material: &[u8]) -> Result<()> {
        let material = KeyMaterial::from_bytes(material)?;
        self.logged_in_state()?.keys.insert(key_id, material);
        Ok(())
    }

    fn delete_key(&self, key_id: u32) -> Result<()> {
        self.logged_in_state()?.keys.remove(&key_id);
        Ok(())
    }

    fn list_keys(&self) -> Result<Vec<TokenKeyInfo>> {
        let state = self.logged_in_state()?;
        Ok(state
            .keys
            .iter()
            .map(|(id, key)| TokenKeyInfo {
                id: *id,
                length: key.len(),
            })
            .collect())
    }

    fn export_wrapped_key(&self, key_id: u32, wrapping_key_id: u32) -> Result<Vec<u8>> {
        let state = self.logged_in_state()?;
        let key = Self::key(&state, key_id)?;
        let wrapping = Self::key(&state, wrapping_key_id)?;

        let mut iv = [0u8; BLOCK_SIZE];
        self.random_bytes(&mut iv)?;
        let params = CipherParams::new(
            wrapping_key_id,
            wrapping.algorithm()?,
            CipherMode::Ctr,
            Direction::Encrypt,
        )
        .with_iv(iv)
        .authenticated(WRAP_NONCE);

        let mut body = key.as_bytes().to_vec();
        let mut session = Box::new(SoftSession::start(wrapping, &params)?);
        session.update(&mut body)?;
        let tag = session
            .finalize()?
            .ok_or_else(|| Error::Crypto("Wrap produced no signature".to_string()))?;

        let mut wrapped = Vec::with_capacity(BLOCK_SIZE + body.len() + SIGNATURE_SIZE);
        wrapped.extend_from_slice(&iv);
        wrapped.extend_from_slice(&body);
        wrapped.extend_from_slice(&tag);
        Ok(wrapped)
    }

    fn insert_wrapped_key(&self, key_id: u32, unwrapping_key_id: u32, wrapped: &[u8]) -> Result<()> {
        if wrapped.len() <= BLOCK_SIZE + SIGNATURE_SIZE {
            return Err(Error::Crypto("Wrapped key too short".to_string()));
        }
        let mut state = self.logged_in_state()?;
        let unwrapping = Self::key(&state, unwrapping_key_id)?;

        let (iv, rest) = wrapped.split_at(BLOCK_SIZE);
        let (body, tag) = rest.split_at(rest.len() - SIGNATURE_SIZE);
        let mut iv_block = [0u8; BLOCK_SIZE];
        iv_block.copy_from_slice(iv);

        let params = CipherParams::new(
            unwrapping_key_id,
            unwrapping.algorithm()?,
            CipherMode::Ctr,
            Direction::Decrypt,
        )
        .with_iv(iv_block)
        .authenticated(WRAP_NONCE);

        let mut material = body.to_vec();
        let mut session = Box::new(SoftSession::start(unwrapping, &params)?);
        session.update(&mut material)?;
        let expected = session
            .finalize()?
            .ok_or_else(|| Error::Crypto("Unwrap produced no signature".to_string()))?;
        if !bool::from(expected[..].ct_eq(tag)) {
            return Err(Error::Integrity("Wrapped key signature mismatch".to_string()));
        }

        let material = KeyMaterial::from_bytes(&material)?;
        state.keys.insert(key_id, material);
        Ok(())
    }
}

/// Device manager over a fixed set of software tokens.
#[derive(Default)]
pub struct SoftDeviceManager {
    tokens: Vec<Arc<SoftToken>>,
}

impl SoftDeviceManager {
    /// Create an empty manager.
    pub fn new() -> Self {
        Self::default()
    }

    /// Attach a token.
    pub fn attach(&mut self, token: Arc<SoftToken>) {
        self.tokens.push(token);
    }
}

impl DeviceManager for SoftDeviceManager {
    fn enumerate(&self) -> Vec<DeviceInfo> {
        self.tokens
            .iter()
            .map(|t| DeviceInfo {
                serial_number: t.serial_number().to_string(),
            })
            .collect()
    }

    fn select(&self, serial_number: &str) -> Result<Arc<dyn CryptoToken>> {
        self.tokens
            .iter()
            .find(|t| t.serial_number() == serial_number)
            .map(|t| t.clone() as Arc<dyn CryptoToken>)
            .ok_or_else(|| Error::NotFound(format!("No device with serial {}", serial_number)))
    }
}

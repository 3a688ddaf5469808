// SPDX-FileCopyrightText: 2024 Foundation Devices, Inc. <hello@foundationdevices.com>
// SPDX-License-Identifier: GPL-3.0-or-later

//! AES-CMAC signing and AES-CBC encryption of BCTs and partition data.

use aes::Aes128;
use cbc::cipher::{BlockDecryptMut, BlockEncryptMut, KeyIvInit};
use cmac::{Cmac, Mac};
use consts::AES_BLOCK_LEN;
use nvbct::HASH_DATA_OFFSET;

pub type Key = [u8; AES_BLOCK_LEN];
pub type Hash = [u8; AES_BLOCK_LEN];

/// Key used when nothing is encrypted and signatures only guard integrity.
pub const ZERO_KEY: Key = [0; AES_BLOCK_LEN];

const ZERO_IV: [u8; AES_BLOCK_LEN] = [0; AES_BLOCK_LEN];

/// Streaming AES-CMAC.
pub struct Signer {
    mac: Cmac<Aes128>,
}

impl Signer {
    pub fn new(key: &Key) -> Self {
        Self {
            mac: <Cmac<Aes128> as Mac>::new(key.into()),
        }
    }

    pub fn update(&mut self, data: &[u8]) {
        self.mac.update(data);
    }

    pub fn finalize(self) -> Hash {
        let mut hash = [0; AES_BLOCK_LEN];
        hash.copy_from_slice(&self.mac.finalize().into_bytes());
        hash
    }

    /// Constant-time check against an expected hash.
    pub fn verify(self, expected: &Hash) -> bool {
        self.mac.verify_slice(expected).is_ok()
    }
}

pub fn sign(key: &Key, data: &[u8]) -> Hash {
    let mut signer = Signer::new(key);
    signer.update(data);
    signer.finalize()
}

/// AES-CBC decryption with a zero IV, chained across calls.
pub struct Decryptor(cbc::Decryptor<Aes128>);

impl Decryptor {
    pub fn new(key: &Key) -> Self {
        Self(cbc::Decryptor::<Aes128>::new(key.into(), &ZERO_IV.into()))
    }

    pub fn decrypt(&mut self, data: &mut [u8]) -> Result<(), CryptoError> {
        check_aligned(data.len())?;
        for block in data.chunks_exact_mut(AES_BLOCK_LEN) {
            self.0.decrypt_block_mut(aes::Block::from_mut_slice(block));
        }
        Ok(())
    }
}

/// AES-CBC encryption with a zero IV, chained across calls.
pub struct Encryptor(cbc::Encryptor<Aes128>);

impl Encryptor {
    pub fn new(key: &Key) -> Self {
        Self(cbc::Encryptor::<Aes128>::new(key.into(), &ZERO_IV.into()))
    }

    pub fn encrypt(&mut self, data: &mut [u8]) -> Result<(), CryptoError> {
        check_aligned(data.len())?;
        for block in data.chunks_exact_mut(AES_BLOCK_LEN) {
            self.0.encrypt_block_mut(aes::Block::from_mut_slice(block));
        }
        Ok(())
    }
}

fn check_aligned(len: usize) -> Result<(), CryptoError> {
    if len % AES_BLOCK_LEN != 0 {
        return Err(CryptoError::Unaligned(len));
    }
    Ok(())
}

/// Encrypt (optionally) and sign a BCT image in place.
///
/// The signed region starts at [`HASH_DATA_OFFSET`]; the signature is
/// written in front of it.
pub fn seal_bct(image: &mut [u8], key: &Key, encrypt: bool) -> Result<(), CryptoError> {
    if image.len() < HASH_DATA_OFFSET {
        return Err(CryptoError::Length {
            expected: HASH_DATA_OFFSET,
            actual: image.len(),
        });
    }
    let (signature, region) = image.split_at_mut(HASH_DATA_OFFSET);
    if encrypt {
        Encryptor::new(key).encrypt(region)?;
    }
    signature.copy_from_slice(&sign(key, region));
    Ok(())
}

/// How an incoming BCT image is checked before it may be used.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BctPolicy {
    /// Accept as received (non-secure devices)
    Trust,
    /// Check the leading signature, decrypting the signed region if asked
    Authenticate { decrypt: bool },
}

/// A BCT image that passed its [`BctPolicy`]. Only [`BctReceiver::finish`]
/// makes one.
#[derive(Debug)]
pub struct VerifiedBct(Vec<u8>);

impl VerifiedBct {
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }
}

/// Collects a BCT image chunk by chunk, signing and decrypting as the data
/// streams in.
pub struct BctReceiver {
    policy: BctPolicy,
    expected: usize,
    image: Vec<u8>,
    signer: Option<Signer>,
    decryptor: Option<Decryptor>,
    decrypted: usize,
}

impl BctReceiver {
    pub fn new(expected: usize, key: &Key, policy: BctPolicy) -> Self {
        let (signer, decryptor) = match policy {
            BctPolicy::Trust => (None, None),
            BctPolicy::Authenticate { decrypt } => {
                (Some(Signer::new(key)), decrypt.then(|| Decryptor::new(key)))
            }
        };
        Self {
            policy,
            expected,
            image: Vec::with_capacity(expected),
            signer,
            decryptor,
            decrypted: HASH_DATA_OFFSET,
        }
    }

    pub fn feed(&mut self, chunk: &[u8]) -> Result<(), CryptoError> {
        let start = self.image.len();
        if start + chunk.len() > self.expected {
            return Err(CryptoError::Length {
                expected: self.expected,
                actual: start + chunk.len(),
            });
        }
        self.image.extend_from_slice(chunk);

        // Signatures cover the data as sent, so sign before decrypting.
        let signed_from = start.max(HASH_DATA_OFFSET);
        if let Some(signer) = self.signer.as_mut() {
            if self.image.len() > signed_from {
                signer.update(&self.image[signed_from..]);
            }
        }
        if let Some(decryptor) = self.decryptor.as_mut() {
            if self.image.len() > self.decrypted {
                let whole = (self.image.len() - self.decrypted) / AES_BLOCK_LEN * AES_BLOCK_LEN;
                let end = self.decrypted + whole;
                decryptor.decrypt(&mut self.image[self.decrypted..end])?;
                self.decrypted = end;
            }
        }
        Ok(())
    }

    pub fn finish(self) -> Result<VerifiedBct, CryptoError> {
        if self.image.len() != self.expected {
            return Err(CryptoError::Length {
                expected: self.expected,
                actual: self.image.len(),
            });
        }
        if let BctPolicy::Authenticate { decrypt } = self.policy {
            if decrypt && self.decrypted != self.image.len() {
                return Err(CryptoError::Unaligned(self.image.len() - HASH_DATA_OFFSET));
            }
            let mut expected = [0; AES_BLOCK_LEN];
            expected.copy_from_slice(&self.image[..HASH_DATA_OFFSET]);
            let valid = self.signer.map(|signer| signer.verify(&expected)).unwrap_or(false);
            if !valid {
                return Err(CryptoError::Mismatch);
            }
        }
        Ok(VerifiedBct(self.image))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CryptoError {
    Unaligned(usize),
    Length { expected: usize, actual: usize },
    Mismatch,
}

impl std::fmt::Display for CryptoError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Unaligned(len) => write!(f, "{len} bytes is not a whole number of AES blocks"),
            Self::Length { expected, actual } => {
                write!(f, "expected {expected} bytes, got {actual}")
            }
            Self::Mismatch => write!(f, "signature mismatch"),
        }
    }
}

impl std::error::Error for CryptoError {}

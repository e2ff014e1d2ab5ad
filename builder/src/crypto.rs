// Licensed under the Apache-2.0 license

//! Hashes, ciphers and signatures used by the image builders.

use std::fmt;
use std::str::FromStr;

use aes::cipher::generic_array::GenericArray;
use aes::cipher::{BlockEncrypt, KeyInit};
use aes::Aes128;
use aic_image::{
    ENC_ALGO_AES128_CBC, ENC_ALGO_SM4_ECB, MD5_TRAILER_LEN, RSA2048_SIGNATURE_LEN,
    SIGN_ALGO_MD5, SIGN_ALGO_RSA2048, SIGN_ALGO_SM2, SM2_SIGNATURE_LEN, SSK_KEY_MATERIAL,
};
use rsa::pkcs1::DecodeRsaPrivateKey;
use rsa::pkcs8::DecodePrivateKey;
use rsa::traits::PublicKeyParts;
use rsa::{Pkcs1v15Sign, RsaPrivateKey};
use sha2::{Digest, Sha256};
use signature::hazmat::PrehashSigner;
use sm3::Sm3;
use sm4::Sm4;

use crate::error::{ImageError, Result};

pub const AES_BLOCK_SIZE: usize = 16;
pub const SYMMETRIC_KEY_LEN: usize = 16;
const SM2_DEFAULT_DISTID: &str = "1234567812345678";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignatureAlgorithm {
    Rsa2048,
    Sm2,
}

impl SignatureAlgorithm {
    pub fn header_id(&self) -> u32 {
        match self {
            SignatureAlgorithm::Rsa2048 => SIGN_ALGO_RSA2048,
            SignatureAlgorithm::Sm2 => SIGN_ALGO_SM2,
        }
    }

    pub fn signature_len(&self) -> usize {
        match self {
            SignatureAlgorithm::Rsa2048 => RSA2048_SIGNATURE_LEN,
            SignatureAlgorithm::Sm2 => SM2_SIGNATURE_LEN,
        }
    }
}

impl FromStr for SignatureAlgorithm {
    type Err = ImageError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "rsa,2048" => Ok(SignatureAlgorithm::Rsa2048),
            "sm2" => Ok(SignatureAlgorithm::Sm2),
            _ => Err(ImageError::UnsupportedAlgorithm(format!(
                "{} (only rsa,2048 or sm2 signature)",
                s
            ))),
        }
    }
}

impl fmt::Display for SignatureAlgorithm {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            SignatureAlgorithm::Rsa2048 => write!(f, "rsa,2048"),
            SignatureAlgorithm::Sm2 => write!(f, "sm2"),
        }
    }
}

/// Trailer written after header, loader and resources.
pub fn trailer_len(signature: Option<SignatureAlgorithm>) -> usize {
    signature.map_or(MD5_TRAILER_LEN, |algo| algo.signature_len())
}

pub fn trailer_algo_id(signature: Option<SignatureAlgorithm>) -> u32 {
    signature.map_or(SIGN_ALGO_MD5, |algo| algo.header_id())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CipherAlgorithm {
    Aes128Cbc,
    Sm4Ecb,
}

impl CipherAlgorithm {
    pub fn header_id(&self) -> u32 {
        match self {
            CipherAlgorithm::Aes128Cbc => ENC_ALGO_AES128_CBC,
            CipherAlgorithm::Sm4Ecb => ENC_ALGO_SM4_ECB,
        }
    }
}

impl FromStr for CipherAlgorithm {
    type Err = ImageError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "aes-128-cbc" => Ok(CipherAlgorithm::Aes128Cbc),
            "sm4-ecb" => Ok(CipherAlgorithm::Sm4Ecb),
            _ => Err(ImageError::UnsupportedAlgorithm(format!(
                "{} (only aes-128-cbc or sm4-ecb encryption)",
                s
            ))),
        }
    }
}

pub fn crc32(data: &[u8]) -> u32 {
    let mut hasher = crc32fast::Hasher::new();
    hasher.update(data);
    hasher.finalize()
}

pub fn md5(data: &[u8]) -> [u8; 16] {
    md5::compute(data).0
}

pub fn sha256(data: &[u8]) -> [u8; 32] {
    Sha256::digest(data).into()
}

pub fn sm3(data: &[u8]) -> [u8; 32] {
    Sm3::digest(data).into()
}

/// First 16 bytes of a key file as a symmetric key.
pub fn symmetric_key(data: &[u8], name: &str) -> Result<[u8; SYMMETRIC_KEY_LEN]> {
    data.get(..SYMMETRIC_KEY_LEN)
        .and_then(|key| key.try_into().ok())
        .ok_or_else(|| ImageError::Crypto(format!("Key file {} is shorter than 16 bytes", name)))
}

/// Emulates the boot ROM key ladder: HSK = AES-128-ECB(SSK, key material).
pub fn derive_ssk_key(ssk: &[u8; SYMMETRIC_KEY_LEN]) -> [u8; SYMMETRIC_KEY_LEN] {
    let cipher = Aes128::new(GenericArray::from_slice(ssk));
    let mut block = GenericArray::clone_from_slice(SSK_KEY_MATERIAL);
    cipher.encrypt_block(&mut block);
    block.into()
}

fn check_block_aligned(data: &[u8]) -> Result<()> {
    if data.len() % AES_BLOCK_SIZE != 0 {
        return Err(ImageError::Crypto(format!(
            "Payload length {} is not a multiple of the cipher block size",
            data.len()
        )));
    }
    Ok(())
}

/// AES-128-CBC without padding; the input must already be block aligned.
pub fn aes128_cbc_encrypt(
    key: &[u8; SYMMETRIC_KEY_LEN],
    iv: &[u8; AES_BLOCK_SIZE],
    data: &[u8],
) -> Result<Vec<u8>> {
    check_block_aligned(data)?;
    let cipher = Aes128::new(GenericArray::from_slice(key));
    let mut encrypted = Vec::with_capacity(data.len());
    let mut prev = GenericArray::clone_from_slice(iv);
    for chunk in data.chunks(AES_BLOCK_SIZE) {
        let mut block = GenericArray::clone_from_slice(chunk);
        for (b, p) in block.iter_mut().zip(prev.iter()) {
            *b ^= p;
        }
        cipher.encrypt_block(&mut block);
        encrypted.extend_from_slice(&block);
        prev = block;
    }
    Ok(encrypted)
}

pub fn sm4_ecb_encrypt(key: &[u8; SYMMETRIC_KEY_LEN], data: &[u8]) -> Result<Vec<u8>> {
    check_block_aligned(data)?;
    let cipher = Sm4::new(GenericArray::from_slice(key));
    let mut encrypted = Vec::with_capacity(data.len());
    for chunk in data.chunks(AES_BLOCK_SIZE) {
        let mut block = GenericArray::clone_from_slice(chunk);
        cipher.encrypt_block(&mut block);
        encrypted.extend_from_slice(&block);
    }
    Ok(encrypted)
}

/// Loads an RSA private key from PEM or DER, PKCS#1 or PKCS#8.
pub fn load_rsa_private_key(data: &[u8]) -> Result<RsaPrivateKey> {
    let key = match std::str::from_utf8(data) {
        Ok(pem) if pem.contains("-----BEGIN") => RsaPrivateKey::from_pkcs1_pem(pem)
            .or_else(|_| RsaPrivateKey::from_pkcs8_pem(pem))
            .ok(),
        _ => RsaPrivateKey::from_pkcs1_der(data)
            .or_else(|_| RsaPrivateKey::from_pkcs8_der(data))
            .ok(),
    };
    let key = key.ok_or_else(|| {
        ImageError::Crypto("Should use an RSA private key to sign".to_string())
    })?;
    if key.size() != RSA2048_SIGNATURE_LEN {
        return Err(ImageError::Crypto(format!(
            "Only RSA 2048 is supported, key is {} bits",
            key.size() * 8
        )));
    }
    Ok(key)
}

/// RSASSA-PKCS1-v1.5 over SHA-256(data).
pub fn rsa_sign_sha256(key: &RsaPrivateKey, data: &[u8]) -> Result<Vec<u8>> {
    let digest = sha256(data);
    key.sign(Pkcs1v15Sign::new::<Sha256>(), &digest)
        .map_err(|e| ImageError::Crypto(format!("RSA signing failed: {}", e)))
}

/// Loads an SM2 private key from SEC1 or PKCS#8, DER or PEM.
pub fn load_sm2_private_key(data: &[u8]) -> Result<sm2::SecretKey> {
    let key = match std::str::from_utf8(data) {
        Ok(pem) if pem.contains("-----BEGIN") => sm2::SecretKey::from_sec1_pem(pem)
            .ok()
            .or_else(|| sm2::SecretKey::from_pkcs8_pem(pem).ok()),
        _ => sm2::SecretKey::from_sec1_der(data)
            .ok()
            .or_else(|| sm2::SecretKey::from_pkcs8_der(data).ok()),
    };
    key.ok_or_else(|| ImageError::Crypto("Invalid SM2 private key".to_string()))
}

/// SM2 signature (r || s) over the SM3 digest of `data`.
pub fn sm2_sign_sm3(key: &sm2::SecretKey, data: &[u8]) -> Result<Vec<u8>> {
    let signing_key = sm2::dsa::SigningKey::new(SM2_DEFAULT_DISTID, key)
        .map_err(|e| ImageError::Crypto(format!("SM2 key error: {}", e)))?;
    let digest = sm3(data);
    let signature: sm2::dsa::Signature = signing_key
        .sign_prehash(&digest)
        .map_err(|e| ImageError::Crypto(format!("SM2 signing failed: {}", e)))?;
    Ok(signature.to_bytes().to_vec())
}

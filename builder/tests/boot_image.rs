// Licensed under the Apache-2.0 license

use std::fs;
use std::path::Path;

use aic_builder::config::BootImageConfig;
use aic_builder::{build_aicimage, verify_boot_image, FileResolver, ImageError};
use rsa::pkcs8::DecodePublicKey;
use rsa::traits::PublicKeyParts;
use rsa::{Pkcs1v15Sign, RsaPublicKey};
use sha2::{Digest, Sha256};
use tempfile::TempDir;

const RSA_KEY_PEM: &[u8] = include_bytes!("data/rsa2048_private.pem");
const RSA_PUB_DER: &[u8] = include_bytes!("data/rsa2048_public.der");
const SM2_KEY_DER: &[u8] = include_bytes!("data/sm2_private.der");

fn word_sum(data: &[u8]) -> u32 {
    data.chunks(4).fold(0u32, |sum, chunk| {
        let mut word = [0u8; 4];
        word[..chunk.len()].copy_from_slice(chunk);
        sum.wrapping_add(u32::from_le_bytes(word))
    })
}

fn boot_config(json: &str) -> BootImageConfig {
    serde_json::from_str(json).unwrap()
}

fn data_dir(loader_len: usize) -> TempDir {
    let dir = TempDir::new().unwrap();
    fs::write(dir.path().join("u-boot-spl.bin"), vec![0x3C; loader_len]).unwrap();
    dir
}

fn write(dir: &Path, name: &str, data: &[u8]) {
    fs::write(dir.join(name), data).unwrap();
}

#[test]
fn test_minimal_signed_boot_image() {
    let dir = data_dir(100);
    let public = RsaPublicKey::from_public_key_der(RSA_PUB_DER).unwrap();
    write(dir.path(), "rsa_private.pem", RSA_KEY_PEM);
    write(dir.path(), "rsa_public.bin", &public.n().to_bytes_be());

    let cfg = boot_config(
        r#"{
            "loader": { "file": "u-boot-spl.bin", "load address": "0x0", "entry point": "0x100" },
            "resource": { "pubkey": "rsa_public.bin" },
            "signature": { "algo": "rsa,2048", "privkey": "rsa_private.pem" }
        }"#,
    );
    let image = build_aicimage(&cfg, &FileResolver::new([dir.path()])).unwrap();

    assert_eq!(image.len(), 256 + 256 + 256 + 256);
    assert_eq!(&image[..4], b"AIC ");
    let header = verify_boot_image(&image).unwrap();
    assert_eq!(header.sign_offset.get(), 768);
    assert_eq!(header.sign_length.get(), 256);
    assert_eq!(header.sign_key_offset.get(), 512);
    assert_eq!(header.sign_key_length.get(), 256);
    assert_eq!(header.entry_point.get(), 0x100);

    let digest = Sha256::digest(&image[..768]);
    public
        .verify(Pkcs1v15Sign::new::<Sha256>(), &digest, &image[768..])
        .unwrap();
}

#[test]
fn test_unsigned_boot_image() {
    let dir = data_dir(100);
    let cfg = boot_config(
        r#"{ "loader": { "file": "u-boot-spl.bin", "load address": "0x0", "entry point": "0x100" } }"#,
    );
    let image = build_aicimage(&cfg, &FileResolver::new([dir.path()])).unwrap();

    assert_eq!(image.len(), 256 + 256 + 16);
    let digest = md5::compute(&image[8..512]);
    assert_eq!(&image[512..], &digest.0[..]);
    assert_eq!(word_sum(&image), 0);
    verify_boot_image(&image).unwrap();

    let mut corrupted = image.clone();
    corrupted[300] ^= 1;
    assert!(verify_boot_image(&corrupted).is_err());
}

#[test]
fn test_sm2_signed_boot_image() {
    let dir = data_dir(600);
    write(dir.path(), "sm2_private.der", SM2_KEY_DER);
    let cfg = boot_config(
        r#"{
            "loader": { "file": "u-boot-spl.bin", "load address": "0x100000" },
            "signature": { "algo": "sm2", "privkey": "sm2_private.der" }
        }"#,
    );
    let image = build_aicimage(&cfg, &FileResolver::new([dir.path()])).unwrap();

    // Loader rounds to 768, no resources, 64-byte r||s trailer.
    assert_eq!(image.len(), 256 + 768 + 64);
    let header = verify_boot_image(&image).unwrap();
    assert_eq!(header.sign_algo.get(), 2);
    assert_eq!(header.entry_point.get(), 0x100100);
}

#[test]
fn test_encryption_keeps_loader_length() {
    let dir = data_dir(1000);
    write(dir.path(), "aes.key", &[0x11; 16]);
    write(dir.path(), "aes.iv", &[0x22; 16]);
    let plain = boot_config(
        r#"{ "loader": { "file": "u-boot-spl.bin", "load address": "0x0", "entry point": "0x100" } }"#,
    );
    let encrypted = boot_config(
        r#"{
            "loader": { "file": "u-boot-spl.bin", "load address": "0x0", "entry point": "0x100" },
            "encryption": { "algo": "aes-128-cbc", "key": "aes.key", "iv": "aes.iv" },
            "ssk_derived_key": "FALSE"
        }"#,
    );
    let files = FileResolver::new([dir.path()]);
    let plain = build_aicimage(&plain, &files).unwrap();
    let encrypted = build_aicimage(&encrypted, &files).unwrap();

    // Same 1024-byte loader region; the iv adds one 256-byte resource region.
    assert_eq!(encrypted.len(), plain.len() + 256);
    assert_ne!(&encrypted[256..1280], &plain[256..1280]);
    let header = verify_boot_image(&encrypted).unwrap();
    assert_eq!(header.loader_length.get(), 1000);
    assert_eq!(header.enc_algo.get(), 1);
    assert_eq!(header.iv_offset.get(), 1280);
    assert_eq!(header.iv_length.get(), 16);
}

#[test]
fn test_unknown_signature_algorithm() {
    let dir = data_dir(100);
    let cfg = boot_config(
        r#"{
            "loader": { "file": "u-boot-spl.bin", "load address": "0x0" },
            "signature": { "algo": "ecdsa", "privkey": "key.pem" }
        }"#,
    );
    let err = build_aicimage(&cfg, &FileResolver::new([dir.path()])).unwrap_err();
    assert!(matches!(err, ImageError::UnsupportedAlgorithm(_)), "{}", err);
}

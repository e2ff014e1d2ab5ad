// Licensed under the Apache-2.0 license

//! Boot ROM image ("AIC " header, loader, resources, trailer).
//!
//! Layout of one image:
//!
//! ```text
//! +--------------------+ 0
//! | BootHeader (256)   |
//! +--------------------+ 256
//! | loader             |  rounded to 256, possibly encrypted
//! +--------------------+ resource_start
//! | pbp | private |    |  each blob rounded to 32,
//! | pubkey | iv        |  the region rounded to 256
//! +--------------------+ sign_offset
//! | signature or MD5   |
//! +--------------------+ img_len
//! ```
//!
//! Three header generations share this shape and differ in a handful of
//! fields, captured by [`BootImageGeneration`] and its [`Capabilities`].

use aic_image::{
    word_checksum, word_sum, BootHeader, BOOT_CHECKSUM_OFFSET, BOOT_HEADER_SIZE,
    BOOT_HEADER_VERSION, BOOT_LOADER_ALIGN, BOOT_MAX_LOADER_SIZE, BOOT_RESOURCE_ALIGN,
    ENC_ALGO_NONE, EXT_LOADER_ALIGN, IV_LEN, MD5_TRAILER_LEN, SIGN_ALGO_MD5,
    SIGN_ALGO_RSA2048, SIGN_ALGO_SM2, SM2_SIGNATURE_LEN, RSA2048_SIGNATURE_LEN,
};
use log::{debug, info};
use zerocopy::{FromBytes, IntoBytes};

use crate::component::FileResolver;
use crate::config::{flag_value, BootImageConfig};
use crate::crypto::{
    self, CipherAlgorithm, SignatureAlgorithm, AES_BLOCK_SIZE, SYMMETRIC_KEY_LEN,
};
use crate::error::{ImageError, Result};
use crate::size::{parse_hex_u32, round_up};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BootImageGeneration {
    /// Legacy image. With `run_in_dram` the loader lives in a second image.
    LegacyV1 { run_in_dram: bool },
    /// Second image of a legacy pair, carrying the DRAM loader.
    LegacyV1Ext,
    V2 { with_ext: bool },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Capabilities {
    pub supports_pbp: bool,
    pub supports_alternate_signature: bool,
    pub supports_alternate_cipher: bool,
    /// Loader is not part of this image; the header points past it instead.
    pub defers_loader: bool,
    pub supports_anti_rollback: bool,
}

impl BootImageGeneration {
    pub fn capabilities(&self) -> Capabilities {
        let legacy_ext = *self == BootImageGeneration::LegacyV1Ext;
        Capabilities {
            supports_pbp: !legacy_ext,
            supports_alternate_signature: !legacy_ext,
            supports_alternate_cipher: !legacy_ext,
            defers_loader: matches!(
                self,
                BootImageGeneration::LegacyV1 { run_in_dram: true }
                    | BootImageGeneration::V2 { with_ext: true }
            ),
            supports_anti_rollback: !legacy_ext,
        }
    }

    /// Legacy run-in-dram images leave the loader bytes out entirely.
    fn embeds_loader(&self) -> bool {
        *self != BootImageGeneration::LegacyV1 { run_in_dram: true }
    }

    /// Trailing zero padding so an external loader can follow directly.
    fn pads_unsigned_to_ext(&self) -> bool {
        *self == BootImageGeneration::V2 { with_ext: true }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoaderSpec {
    pub file: String,
    pub load_address: u32,
    pub entry_point: u32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SignatureSpec {
    pub algo: SignatureAlgorithm,
    pub privkey: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EncryptionSpec {
    pub algo: CipherAlgorithm,
    pub key: String,
    pub iv: Option<String>,
    /// Encrypt with AES-ECB(key, key material) instead of the key itself.
    pub derive_key: bool,
}

/// Validated description of one boot image.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BootImageSpec {
    pub generation: BootImageGeneration,
    pub header_ver: u32,
    pub fw_ver: u32,
    pub loader: Option<LoaderSpec>,
    pub pbp: Option<String>,
    pub private: Option<String>,
    pub pubkey: Option<String>,
    pub encryption: Option<EncryptionSpec>,
    pub signature: Option<SignatureSpec>,
}

impl BootImageSpec {
    pub fn from_config(cfg: &BootImageConfig, generation: BootImageGeneration) -> Result<Self> {
        let caps = generation.capabilities();

        let header_ver = match &cfg.head_ver {
            Some(ver) => parse_hex_u32(ver)?,
            None => BOOT_HEADER_VERSION,
        };
        let fw_ver = match &cfg.anti_rollback {
            Some(counter) if caps.supports_anti_rollback => counter.as_u32()?,
            _ => 0,
        };

        let loader = match &cfg.loader {
            Some(loader) => {
                let file = loader.file.clone().ok_or_else(|| {
                    ImageError::config("Boot image loader has no file")
                })?;
                let (load_address, entry_point) = loader_addresses(loader, generation)?;
                Some(LoaderSpec {
                    file,
                    load_address,
                    entry_point,
                })
            }
            None => None,
        };

        let resource = cfg.resource.clone().unwrap_or_default();
        let pbp = resource.pbp.filter(|_| caps.supports_pbp);

        let signature = match &cfg.signature {
            Some(sig) => {
                let algo: SignatureAlgorithm = sig.algo.parse()?;
                if algo != SignatureAlgorithm::Rsa2048 && !caps.supports_alternate_signature {
                    return Err(ImageError::UnsupportedAlgorithm(format!(
                        "{} for external loader image",
                        algo
                    )));
                }
                let privkey = sig.privkey.clone().ok_or_else(|| {
                    ImageError::config(format!("{} private key is not set", algo))
                })?;
                Some(SignatureSpec { algo, privkey })
            }
            None => None,
        };

        let encryption = match &cfg.encryption {
            Some(enc) => {
                let algo: CipherAlgorithm = enc.algo.parse()?;
                if algo == CipherAlgorithm::Sm4Ecb && !caps.supports_alternate_cipher {
                    return Err(ImageError::UnsupportedAlgorithm(
                        "sm4-ecb for external loader image".to_string(),
                    ));
                }
                let key = enc.key.clone().ok_or_else(|| {
                    ImageError::config(format!("{} key is not set", enc.algo))
                })?;
                if algo == CipherAlgorithm::Aes128Cbc && enc.iv.is_none() {
                    return Err(ImageError::config("aes-128-cbc requires an iv file"));
                }
                let derive_key = match (algo, generation) {
                    (CipherAlgorithm::Sm4Ecb, _) => false,
                    (_, BootImageGeneration::V2 { .. }) => {
                        flag_value(cfg.ssk_derived_key.as_deref()).ok_or_else(|| {
                            ImageError::config(
                                "ssk_derived_key must be TRUE or FALSE for aes-128-cbc",
                            )
                        })?
                    }
                    _ => true,
                };
                Some(EncryptionSpec {
                    algo,
                    key,
                    iv: enc.iv.clone(),
                    derive_key,
                })
            }
            None => None,
        };

        Ok(Self {
            generation,
            header_ver,
            fw_ver,
            loader,
            pbp,
            private: resource.private,
            pubkey: resource.pubkey,
            encryption,
            signature,
        })
    }

    fn trailer_len(&self) -> usize {
        crypto::trailer_len(self.signature.as_ref().map(|s| s.algo))
    }
}

fn loader_addresses(
    loader: &crate::config::LoaderConfig,
    generation: BootImageGeneration,
) -> Result<(u32, u32)> {
    let hex = |value: &Option<String>| value.as_deref().map(parse_hex_u32).transpose();
    let load = hex(&loader.load_address)?;
    let entry = hex(&loader.entry_point)?;

    match generation {
        BootImageGeneration::V2 { .. } => Ok(match (load, entry) {
            (Some(load), Some(entry)) => (load, entry),
            (Some(load), None) => (load, load.wrapping_add(BOOT_HEADER_SIZE as u32)),
            (None, Some(entry)) => (entry.wrapping_sub(BOOT_HEADER_SIZE as u32), entry),
            (None, None) => (0, 0),
        }),
        BootImageGeneration::LegacyV1 { .. } | BootImageGeneration::LegacyV1Ext => {
            let (load, entry) = if generation == BootImageGeneration::LegacyV1Ext {
                (
                    hex(&loader.load_address_ext)?.or(load),
                    hex(&loader.entry_point_ext)?.or(entry),
                )
            } else {
                (load, entry)
            };
            let load = load.ok_or_else(|| ImageError::config("Loader load address is not set"))?;
            let entry = entry.ok_or_else(|| ImageError::config("Loader entry point is not set"))?;
            Ok((load, entry))
        }
    }
}

/// A resource blob and its unpadded size.
struct Blob {
    data: Vec<u8>,
    raw_len: usize,
}

impl Blob {
    fn read(files: &FileResolver, name: &str, align: usize) -> Result<Self> {
        let mut data = files.read(name)?;
        let raw_len = data.len();
        data.resize(round_up(raw_len, align), 0);
        Ok(Self { data, raw_len })
    }
}

/// Reads, pads and optionally encrypts the loader.
///
/// Returns the bytes placed in the image and the raw loader size.
fn loader_bytes(spec: &BootImageSpec, files: &FileResolver) -> Result<(Vec<u8>, usize)> {
    let Some(loader) = &spec.loader else {
        return Ok((Vec::new(), 0));
    };
    let path = files.require(&loader.file)?;
    let raw_len = std::fs::metadata(&path).map_err(ImageError::file(&path))?.len() as usize;
    if raw_len > BOOT_MAX_LOADER_SIZE {
        return Err(ImageError::LoaderTooLarge(loader.file.clone(), raw_len));
    }
    if !spec.generation.embeds_loader() {
        return Ok((Vec::new(), raw_len));
    }

    let blob = Blob::read(files, &loader.file, BOOT_LOADER_ALIGN)?;
    let data = match &spec.encryption {
        Some(enc) if !blob.data.is_empty() => encrypt_loader(enc, files, &blob.data)?,
        _ => blob.data,
    };
    Ok((data, raw_len))
}

fn encrypt_loader(enc: &EncryptionSpec, files: &FileResolver, plain: &[u8]) -> Result<Vec<u8>> {
    let key = crypto::symmetric_key(&files.read(&enc.key)?, &enc.key)?;
    match enc.algo {
        CipherAlgorithm::Sm4Ecb => crypto::sm4_ecb_encrypt(&key, plain),
        CipherAlgorithm::Aes128Cbc => {
            let iv_name = enc
                .iv
                .as_deref()
                .ok_or_else(|| ImageError::config("aes-128-cbc requires an iv file"))?;
            let iv: [u8; AES_BLOCK_SIZE] = crypto::symmetric_key(&files.read(iv_name)?, iv_name)?;
            let key: [u8; SYMMETRIC_KEY_LEN] = if enc.derive_key {
                crypto::derive_ssk_key(&key)
            } else {
                key
            };
            crypto::aes128_cbc_encrypt(&key, &iv, plain)
        }
    }
}

fn to_u32(value: usize) -> Result<u32> {
    u32::try_from(value)
        .map_err(|_| ImageError::config(format!("Boot image field {:#x} exceeds 32 bits", value)))
}

/// Builds one boot image as described by `spec`.
pub fn build_boot_image(spec: &BootImageSpec, files: &FileResolver) -> Result<Vec<u8>> {
    let caps = spec.generation.capabilities();
    let (loader, loader_raw_len) = loader_bytes(spec, files)?;
    let resource_start = BOOT_HEADER_SIZE + loader.len();

    let mut header = BootHeader::default();
    header.header_ver = spec.header_ver.into();
    header.fw_ver = spec.fw_ver.into();
    if let Some(l) = &spec.loader {
        header.load_address = l.load_address.into();
        header.entry_point = l.entry_point.into();
    }
    let loader_length = if caps.defers_loader { 0 } else { loader_raw_len };
    header.loader_length = to_u32(loader_length)?.into();

    // Resources, in the order the boot ROM expects them.
    let mut resources = Vec::new();
    let mut place = |name: &str| -> Result<(u32, u32)> {
        let blob = Blob::read(files, name, BOOT_RESOURCE_ALIGN)?;
        let offset = to_u32(resource_start + resources.len())?;
        resources.extend_from_slice(&blob.data);
        Ok((offset, to_u32(blob.raw_len)?))
    };
    if let Some(pbp) = &spec.pbp {
        let (offset, len) = place(pbp)?;
        header.pbp_offset = offset.into();
        header.pbp_length = len.into();
    }
    if let Some(private) = &spec.private {
        let (offset, len) = place(private)?;
        header.priv_offset = offset.into();
        header.priv_length = len.into();
    }
    if let Some(pubkey) = &spec.pubkey {
        let (offset, len) = place(pubkey)?;
        header.sign_key_offset = offset.into();
        header.sign_key_length = len.into();
    }
    header.enc_algo = ENC_ALGO_NONE.into();
    if let Some(enc) = &spec.encryption {
        let iv_offset = match &enc.iv {
            Some(iv) => Some(place(iv)?.0),
            None => None,
        };
        match enc.algo {
            CipherAlgorithm::Aes128Cbc if loader_length != 0 => {
                header.enc_algo = enc.algo.header_id().into();
                header.iv_offset = iv_offset.unwrap_or(0).into();
                header.iv_length = to_u32(IV_LEN)?.into();
            }
            CipherAlgorithm::Aes128Cbc => {}
            CipherAlgorithm::Sm4Ecb => header.enc_algo = enc.algo.header_id().into(),
        }
    }
    resources.resize(round_up(resources.len(), BOOT_LOADER_ALIGN), 0);

    let trailer_len = spec.trailer_len();
    let img_len = resource_start + resources.len() + trailer_len;
    header.img_len = to_u32(img_len)?.into();
    header.sign_algo = crypto::trailer_algo_id(spec.signature.as_ref().map(|s| s.algo)).into();
    header.sign_offset = to_u32(img_len - trailer_len)?.into();
    header.sign_length = to_u32(trailer_len)?.into();
    if caps.defers_loader {
        header.loader_ext_offset = to_u32(round_up(img_len, EXT_LOADER_ALIGN))?.into();
    }

    let mut image = Vec::with_capacity(img_len);
    image.extend_from_slice(header.as_bytes());
    image.extend_from_slice(&loader);
    image.extend_from_slice(&resources);

    match &spec.signature {
        Some(sig) => {
            let key = files.read(&sig.privkey)?;
            let signature = match sig.algo {
                SignatureAlgorithm::Rsa2048 => {
                    crypto::rsa_sign_sha256(&crypto::load_rsa_private_key(&key)?, &image)?
                }
                SignatureAlgorithm::Sm2 => {
                    crypto::sm2_sign_sm3(&crypto::load_sm2_private_key(&key)?, &image)?
                }
            };
            image.extend_from_slice(&signature);
        }
        None => {
            let digest = crypto::md5(&image[8..]);
            image.extend_from_slice(&digest);
            if spec.generation.pads_unsigned_to_ext() {
                image.resize(round_up(image.len(), EXT_LOADER_ALIGN), 0);
            }
            let checksum = word_checksum(&image);
            image[BOOT_CHECKSUM_OFFSET..BOOT_CHECKSUM_OFFSET + 4]
                .copy_from_slice(&checksum.to_le_bytes());
            let sum = word_sum(&image);
            if sum != 0 {
                return Err(ImageError::ChecksumMismatch(sum));
            }
        }
    }

    debug!(
        "Boot image {:?}: loader {} bytes, resources {} bytes, img_len {:#x}",
        spec.generation,
        loader_length,
        resources.len(),
        img_len
    );
    Ok(image)
}

/// Legacy `aicboot` output: the v1 image, followed by the external loader
/// image at the next 512-byte boundary when the loader runs in DRAM.
pub fn build_aicboot_image(cfg: &BootImageConfig, files: &FileResolver) -> Result<Vec<u8>> {
    let run_in_dram = cfg.loader.is_some()
        && flag_value(cfg.loader.as_ref().and_then(|l| l.run_in_dram.as_deref())) != Some(false);
    let spec = BootImageSpec::from_config(cfg, BootImageGeneration::LegacyV1 { run_in_dram })?;
    let mut image = build_boot_image(&spec, files)?;

    if run_in_dram {
        let ext_spec = BootImageSpec::from_config(cfg, BootImageGeneration::LegacyV1Ext)?;
        let ext_image = build_boot_image(&ext_spec, files)?;
        image.resize(round_up(image.len(), EXT_LOADER_ALIGN), 0);
        image.extend_from_slice(&ext_image);
        info!("External loader image appended at {:#x}", image.len() - ext_image.len());
    }
    Ok(image)
}

/// `aicimage` output: a single v2 image.
pub fn build_aicimage(cfg: &BootImageConfig, files: &FileResolver) -> Result<Vec<u8>> {
    let with_ext = flag_value(cfg.with_ext.as_deref()) == Some(true);
    let spec = BootImageSpec::from_config(cfg, BootImageGeneration::V2 { with_ext })?;
    build_boot_image(&spec, files)
}

/// Checks the header, length and trailer of a boot image.
///
/// Unsigned images must carry a matching MD5 and a zero word sum; signed
/// images must carry a trailer of the size their algorithm produces.
pub fn verify_boot_image(image: &[u8]) -> Result<BootHeader> {
    if image.len() < BOOT_HEADER_SIZE {
        return Err(ImageError::config(format!(
            "Boot image is only {} bytes long",
            image.len()
        )));
    }
    let header = BootHeader::read_from_bytes(&image[..BOOT_HEADER_SIZE])
        .map_err(|_| ImageError::config("Failed to parse boot image header"))?;
    if !header.verify(image.len()) {
        return Err(ImageError::config(
            "Invalid boot image header: bad magic or length",
        ));
    }

    let img_len = header.img_len.get() as usize;
    let sign_offset = header.sign_offset.get() as usize;
    let sign_length = header.sign_length.get() as usize;
    let expected_len = match header.sign_algo.get() {
        SIGN_ALGO_MD5 => MD5_TRAILER_LEN,
        SIGN_ALGO_RSA2048 => RSA2048_SIGNATURE_LEN,
        SIGN_ALGO_SM2 => SM2_SIGNATURE_LEN,
        other => {
            return Err(ImageError::UnsupportedAlgorithm(format!(
                "signature id {}",
                other
            )))
        }
    };
    if sign_length != expected_len || sign_offset < BOOT_HEADER_SIZE {
        return Err(ImageError::config(format!(
            "Trailer length {} does not match signature id {}",
            sign_length,
            header.sign_algo.get()
        )));
    }

    if header.sign_algo.get() == SIGN_ALGO_MD5 {
        let digest = crypto::md5(&image[8..sign_offset]);
        if digest[..] != image[sign_offset..img_len] {
            return Err(ImageError::Crypto("MD5 digest of boot image mismatch".to_string()));
        }
        let sum = word_sum(&image[..img_len]);
        if sum != 0 {
            return Err(ImageError::ChecksumMismatch(sum));
        }
    }
    Ok(header)
}

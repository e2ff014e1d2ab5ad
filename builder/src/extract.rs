// Licensed under the Apache-2.0 license

//! Unpacks a firmware container back into its component files.

use std::fs::File;
use std::path::{Path, PathBuf};

use aic_image::{field_str, FwHeader, MetaRecord, META_RECORD_SIZE};
use log::{debug, info};
use zerocopy::FromBytes;

use crate::error::{ImageError, Result};
use crate::write_output;

fn read_record(image: &[u8], offset: usize) -> Result<MetaRecord> {
    image
        .get(offset..offset + META_RECORD_SIZE)
        .and_then(|bytes| MetaRecord::read_from_bytes(bytes).ok())
        .filter(MetaRecord::verify)
        .ok_or_else(|| ImageError::config(format!("Invalid meta record at {:#x}", offset)))
}

/// Writes every component of `img` to `<img dir>/<img stem>/` and unpacks
/// tar archives in place. Returns the output directory.
pub fn extract_image(img: &Path) -> Result<PathBuf> {
    let image = std::fs::read(img).map_err(ImageError::file(img))?;
    let header = image
        .get(..std::mem::size_of::<FwHeader>())
        .and_then(|bytes| FwHeader::read_from_bytes(bytes).ok())
        .filter(FwHeader::verify)
        .ok_or_else(|| {
            ImageError::config(format!("{} is not an AIC firmware image", img.display()))
        })?;

    let stem = img
        .file_stem()
        .ok_or_else(|| ImageError::config(format!("Bad image path {}", img.display())))?;
    let outdir = img.with_file_name(stem);
    std::fs::create_dir_all(&outdir).map_err(ImageError::file(&outdir))?;

    let meta_offset = header.meta_offset.get() as usize;
    for i in 0..header.meta_size.get() as usize / META_RECORD_SIZE {
        let record = read_record(&image, meta_offset + i * META_RECORD_SIZE)?;
        let name = field_str(&record.name);
        let offset = record.offset.get() as usize;
        let data = image
            .get(offset..offset + record.size.get() as usize)
            .ok_or_else(|| ImageError::config(format!("{} lies outside the image", name)))?;
        // Only the final path component, the record must not escape `outdir`.
        let filename = Path::new(field_str(&record.filename))
            .file_name()
            .ok_or_else(|| ImageError::config(format!("{} has no file name", name)))?;

        let path = outdir.join(filename);
        write_output(&path, data)?;
        debug!("{}: {} bytes -> {}", name, data.len(), path.display());

        if path.extension().is_some_and(|ext| ext == "tar") {
            let file = File::open(&path).map_err(ImageError::file(&path))?;
            tar::Archive::new(file)
                .unpack(&outdir)
                .map_err(ImageError::file(&path))?;
            info!("Extract {} file data to {}", path.display(), outdir.display());
        }
    }
    Ok(outdir)
}

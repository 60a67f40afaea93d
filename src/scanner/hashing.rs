use anyhow::{anyhow, Context, Result};
use std::fmt::Write;
use std::path::Path;

/// Length of the hex string [`perceptual_hash`] returns for `detail_level`.
///
/// The `detail_level^2` hash bits are padded to whole bytes, two hex
/// characters each.
pub fn hash_len(detail_level: u32) -> usize {
    let bits = (detail_level as usize) * (detail_level as usize);
    2 * bits.div_ceil(8)
}

/// Compute the perceptual hash of an image as a lowercase hex string.
///
/// The hash covers a `detail_level x detail_level` grid and is always
/// [`hash_len`] characters long for a given level.
pub fn perceptual_hash(path: &Path, detail_level: u32) -> Result<String> {
    use img_hash::HasherConfig;

    let img = image::open(path).with_context(|| format!("Failed to decode {}", path.display()))?;

    // The hasher downsamples anyway; a thumbnail keeps large files cheap.
    let side = (detail_level * 4).max(64);
    let thumbnail = img.thumbnail(side, side);

    let hasher = HasherConfig::new()
        .hash_size(detail_level, detail_level)
        .to_hasher();

    // img_hash links its own `image` version; hand the pixels over raw.
    let rgba = thumbnail.to_rgba8();
    let (width, height) = rgba.dimensions();

    let img_hash_image = img_hash::image::RgbaImage::from_raw(width, height, rgba.into_raw())
        .ok_or_else(|| anyhow!("Failed to create image for hashing"))?;

    let hash = hasher.hash_image(&img_hash::image::DynamicImage::ImageRgba8(img_hash_image));

    Ok(to_hex(hash.as_bytes()))
}

fn to_hex(bytes: &[u8]) -> String {
    let mut out = String::with_capacity(bytes.len() * 2);
    for b in bytes {
        let _ = write!(out, "{:02x}", b);
    }
    out
}

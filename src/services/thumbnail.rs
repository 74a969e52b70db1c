use image::codecs::jpeg::JpegEncoder;
use image::imageops::FilterType;
use image::DynamicImage;

/// JPEG quality for reference thumbnails.
const THUMBNAIL_QUALITY: u8 = 85;

pub const THUMBNAIL_CONTENT_TYPE: &str = "image/jpeg";

/// Square thumbnail: center crop to the shorter side, resize to `size`
/// with Lanczos3, encode as JPEG. Same input always yields the same bytes.
pub fn make_thumbnail(bytes: &[u8], size: u32) -> Result<Vec<u8>, ThumbnailError> {
    if size == 0 {
        return Err(ThumbnailError::InvalidSize);
    }

    let img = image::load_from_memory(bytes)?;
    let side = img.width().min(img.height());
    if side == 0 {
        return Err(ThumbnailError::Empty);
    }

    let x = (img.width() - side) / 2;
    let y = (img.height() - side) / 2;
    let square = img.crop_imm(x, y, side, side);
    let resized = square.resize_exact(size, size, FilterType::Lanczos3);
    let rgb = DynamicImage::ImageRgb8(resized.to_rgb8());

    let mut out = Vec::new();
    let encoder = JpegEncoder::new_with_quality(&mut out, THUMBNAIL_QUALITY);
    rgb.write_with_encoder(encoder)?;
    Ok(out)
}

#[derive(Debug, thiserror::Error)]
pub enum ThumbnailError {
    #[error("Image could not be decoded or encoded: {0}")]
    Image(#[from] image::ImageError),

    #[error("Image has no pixels")]
    Empty,

    #[error("Thumbnail size must be positive")]
    InvalidSize,
}

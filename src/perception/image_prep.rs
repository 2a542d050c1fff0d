//! Resizes snapshots to the pixel budget vision models are trained on.

use base64::Engine as _;

use crate::perception::types::Snapshot;

/// Output sides are multiples of this many pixels.
pub const IMAGE_FACTOR: u32 = 28;

/// Scales `(width, height)` into `[min_pixels, max_pixels]` total pixels, keeping the
/// aspect ratio, then rounds each side down to a multiple of [`IMAGE_FACTOR`].
pub fn smart_resize(width: u32, height: u32, min_pixels: u32, max_pixels: u32) -> (u32, u32) {
    if width == 0 || height == 0 {
        return (width, height);
    }
    let pixels = f64::from(width) * f64::from(height);
    let (mut w, mut h) = (f64::from(width), f64::from(height));
    if pixels < f64::from(min_pixels) {
        let scale = (f64::from(min_pixels) / pixels).sqrt();
        w *= scale;
        h *= scale;
    } else if pixels > f64::from(max_pixels) {
        let scale = (f64::from(max_pixels) / pixels).sqrt();
        w *= scale;
        h *= scale;
    }
    let round = |v: f64| ((v as u32) / IMAGE_FACTOR * IMAGE_FACTOR).max(IMAGE_FACTOR);
    (round(w), round(h))
}

/// JPEG data URL of the resized snapshot. Undecodable snapshots are sent as-is.
pub fn model_image_url(snapshot: &Snapshot, min_pixels: u32, max_pixels: u32) -> String {
    match resize_to_jpeg(&snapshot.bytes, min_pixels, max_pixels) {
        Ok(jpeg) => data_url("image/jpeg", &jpeg),
        Err(e) => {
            tracing::warn!(error = %e, "snapshot resize failed, sending original bytes");
            data_url(&snapshot.mime, &snapshot.bytes)
        }
    }
}

pub fn data_url(mime: &str, bytes: &[u8]) -> String {
    format!(
        "data:{mime};base64,{}",
        base64::engine::general_purpose::STANDARD.encode(bytes)
    )
}

fn resize_to_jpeg(bytes: &[u8], min_pixels: u32, max_pixels: u32) -> Result<Vec<u8>, image::ImageError> {
    let img = image::load_from_memory(bytes)?;
    let (w, h) = smart_resize(img.width(), img.height(), min_pixels, max_pixels);
    let img = if (w, h) == (img.width(), img.height()) {
        img
    } else {
        img.resize_exact(w, h, image::imageops::FilterType::Triangle)
    };

    let mut out = Vec::new();
    let encoder = image::codecs::jpeg::JpegEncoder::new_with_quality(&mut out, 80);
    image::DynamicImage::ImageRgb8(img.to_rgb8()).write_with_encoder(encoder)?;
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    const MIN: u32 = 100 * 28 * 28;
    const MAX: u32 = 16384 * 28 * 28;

    fn png(w: u32, h: u32) -> Vec<u8> {
        let mut out = Vec::new();
        image::DynamicImage::new_rgb8(w, h)
            .write_to(&mut std::io::Cursor::new(&mut out), image::ImageFormat::Png)
            .unwrap();
        out
    }

    #[test]
    fn in_budget_sizes_are_only_rounded() {
        assert_eq!(smart_resize(1000, 2000, MIN, MAX), (980, 1988));
    }

    #[test]
    fn tiny_images_are_scaled_up_to_the_minimum() {
        assert_eq!(smart_resize(10, 10, MIN, MAX), (280, 280));
    }

    #[test]
    fn huge_images_are_scaled_down() {
        let (w, h) = smart_resize(10_000, 10_000, MIN, MAX);
        assert!(w * h <= MAX);
        assert_eq!(w % IMAGE_FACTOR, 0);
        assert_eq!(w, h);
    }

    #[test]
    fn decodable_snapshot_becomes_jpeg() {
        let snapshot = Snapshot {
            bytes: png(300, 600),
            mime: "image/png".into(),
            width: 300,
            height: 600,
            captured_at: chrono::Utc::now(),
        };
        assert!(model_image_url(&snapshot, MIN, MAX).starts_with("data:image/jpeg;base64,"));
    }

    #[test]
    fn undecodable_snapshot_is_passed_through() {
        let snapshot = Snapshot {
            bytes: b"not an image".to_vec(),
            mime: "image/png".into(),
            width: 1,
            height: 1,
            captured_at: chrono::Utc::now(),
        };
        assert_eq!(
            model_image_url(&snapshot, MIN, MAX),
            data_url("image/png", b"not an image")
        );
    }
}

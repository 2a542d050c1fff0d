//! 64-bit difference hash of a snapshot, used to recognise screens seen earlier in a run.

use image::imageops::FilterType;

/// dHash over the snapshot with the top `status_bar_frac` of the image masked out,
/// so clock and battery changes do not alter the fingerprint.
///
/// Returns `None` when the snapshot cannot be decoded.
pub fn dhash(bytes: &[u8], status_bar_frac: f64) -> Option<u64> {
    let img = match image::load_from_memory(bytes) {
        Ok(img) => img,
        Err(e) => {
            tracing::debug!(error = %e, "snapshot not decodable, no fingerprint");
            return None;
        }
    };
    let (w, h) = (img.width(), img.height());
    if w == 0 || h == 0 {
        return None;
    }
    let skip = (f64::from(h) * status_bar_frac.clamp(0.0, 1.0)) as u32;
    let img = if skip > 0 && skip < h {
        img.crop_imm(0, skip, w, h - skip)
    } else {
        img
    };

    // 9x8 grey thumbnail: comparing horizontal neighbours yields 8x8 bits.
    let thumb = img.resize_exact(9, 8, FilterType::Triangle).to_luma8();
    let mut hash = 0u64;
    for row in 0..8u32 {
        for col in 0..8u32 {
            if thumb.get_pixel(col, row)[0] < thumb.get_pixel(col + 1, row)[0] {
                hash |= 1 << (row * 8 + col);
            }
        }
    }
    Some(hash)
}

pub fn hamming_distance(a: u64, b: u64) -> u32 {
    (a ^ b).count_ones()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn encode(img: image::GrayImage) -> Vec<u8> {
        let mut out = Vec::new();
        image::DynamicImage::ImageLuma8(img)
            .write_to(&mut std::io::Cursor::new(&mut out), image::ImageFormat::Png)
            .unwrap();
        out
    }

    fn gradient(w: u32, h: u32, rising: bool) -> image::GrayImage {
        image::GrayImage::from_fn(w, h, |x, _| {
            let v = (x * 255 / (w - 1)) as u8;
            image::Luma([if rising { v } else { 255 - v }])
        })
    }

    #[test]
    fn flat_screen_hashes_to_zero() {
        let flat = encode(image::GrayImage::from_pixel(64, 64, image::Luma([128])));
        assert_eq!(dhash(&flat, 0.0), Some(0));
    }

    #[test]
    fn brightening_gradient_sets_every_bit() {
        assert_eq!(dhash(&encode(gradient(200, 400, true)), 0.08), Some(u64::MAX));
        assert_eq!(dhash(&encode(gradient(200, 400, false)), 0.08), Some(0));
    }

    #[test]
    fn status_bar_is_ignored() {
        let plain = gradient(200, 400, true);
        let mut with_clock = plain.clone();
        for y in 0..20 {
            for x in 0..200 {
                with_clock.put_pixel(x, y, image::Luma([(x % 2 * 255) as u8]));
            }
        }
        assert_eq!(dhash(&encode(plain), 0.08), dhash(&encode(with_clock), 0.08));
    }

    #[test]
    fn garbage_has_no_fingerprint() {
        assert_eq!(dhash(b"not an image", 0.08), None);
    }

    #[test]
    fn hamming_counts_differing_bits() {
        assert_eq!(hamming_distance(1000, 1000), 0);
        assert_eq!(hamming_distance(1000, 1001), 1);
        assert_eq!(hamming_distance(0, u64::MAX), 64);
    }
}

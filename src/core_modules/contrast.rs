// THEORY:
// Lighting drift (flicker, a passing shadow) changes every pixel of a frame at
// once and looks like motion to a dense flow algorithm. Equalizing the
// luminance histogram of each ROI frame before flow is computed removes most of
// that global brightness change.
//
// Only luma is equalized. Chroma is held fixed, which in the YUV model means
// every color channel moves by the same amount the luma moved.

use image::{GrayImage, Luma, Rgb, RgbImage};

const LUMA_WEIGHTS: [f64; 3] = [0.299, 0.587, 0.114];

/// BT.601 luma of a single RGB pixel, rounded to the nearest level.
pub fn luma_of(pixel: &Rgb<u8>) -> u8 {
    let [r, g, b] = pixel.0;
    let y = LUMA_WEIGHTS[0] * r as f64 + LUMA_WEIGHTS[1] * g as f64 + LUMA_WEIGHTS[2] * b as f64;
    y.round().clamp(0.0, 255.0) as u8
}

/// The single-channel frame handed to the flow computation.
pub fn to_luminance(frame: &RgbImage) -> GrayImage {
    GrayImage::from_fn(frame.width(), frame.height(), |x, y| Luma([luma_of(frame.get_pixel(x, y))]))
}

/// Builds the CDF remap table for a luma histogram. `None` when the image has
/// fewer than two distinct levels and there is nothing to stretch.
fn equalization_lut(histogram: &[u64; 256], total: u64) -> Option<[u8; 256]> {
    let cdf_min = histogram.iter().copied().find(|&count| count > 0)?;
    if cdf_min == total {
        return None;
    }

    let mut lut = [0u8; 256];
    let mut cdf = 0u64;
    let span = (total - cdf_min) as f64;
    for (level, &count) in histogram.iter().enumerate() {
        cdf += count;
        let scaled = (cdf.saturating_sub(cdf_min)) as f64 * 255.0 / span;
        lut[level] = scaled.round().clamp(0.0, 255.0) as u8;
    }
    Some(lut)
}

/// Histogram-equalizes the luminance of a color frame, keeping its chroma.
pub fn equalize_luminance(frame: &RgbImage) -> RgbImage {
    let luma = to_luminance(frame);

    let mut histogram = [0u64; 256];
    for pixel in luma.pixels() {
        histogram[pixel.0[0] as usize] += 1;
    }

    let total = luma.len() as u64;
    let Some(lut) = equalization_lut(&histogram, total) else {
        return frame.clone();
    };

    RgbImage::from_fn(frame.width(), frame.height(), |x, y| {
        let old_y = luma.get_pixel(x, y).0[0];
        let shift = lut[old_y as usize] as i16 - old_y as i16;
        let Rgb(channels) = *frame.get_pixel(x, y);
        Rgb(channels.map(|c| (c as i16 + shift).clamp(0, 255) as u8))
    })
}

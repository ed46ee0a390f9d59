//! Pixel conversion utilities
//!
//! The capture side negotiates BGR24, the PNG codec wants RGB8 or L8, and
//! the motion detector works on half-resolution grayscale. These are plain
//! per-pixel loops over tightly packed buffers.

use image::{GrayImage, RgbImage};

use super::format::Resolution;

// Integer BT.601 luma weights, scaled by 256.
const LUMA_R: u32 = 77;
const LUMA_G: u32 = 150;
const LUMA_B: u32 = 29;

#[inline]
fn luma(b: u8, g: u8, r: u8) -> u8 {
    ((LUMA_R * r as u32 + LUMA_G * g as u32 + LUMA_B * b as u32 + 128) >> 8) as u8
}

/// BGR24 -> RGB8 channel swap.
pub fn bgr_to_rgb(src: &[u8], resolution: Resolution) -> RgbImage {
    let mut out = Vec::with_capacity(src.len());
    for px in src.chunks_exact(3) {
        out.push(px[2]);
        out.push(px[1]);
        out.push(px[0]);
    }
    RgbImage::from_raw(resolution.width, resolution.height, out)
        .expect("buffer length matches geometry")
}

/// BGR24 -> full-resolution grayscale.
pub fn bgr_to_gray(src: &[u8], resolution: Resolution) -> GrayImage {
    let mut out = Vec::with_capacity(resolution.pixels());
    for px in src.chunks_exact(3) {
        out.push(luma(px[0], px[1], px[2]));
    }
    GrayImage::from_raw(resolution.width, resolution.height, out)
        .expect("buffer length matches geometry")
}

/// BGR24 -> grayscale downscaled by 0.5 in each axis (2x2 box average),
/// fused into one pass for the motion detector.
pub fn bgr_to_half_gray(src: &[u8], resolution: Resolution) -> GrayImage {
    let width = resolution.width as usize;
    let half_w = (resolution.width / 2) as usize;
    let half_h = (resolution.height / 2) as usize;
    let stride = width * 3;

    let mut out = Vec::with_capacity(half_w * half_h);
    for y in 0..half_h {
        let row0 = 2 * y * stride;
        let row1 = row0 + stride;
        for x in 0..half_w {
            let c0 = row0 + 2 * x * 3;
            let c1 = row1 + 2 * x * 3;
            let sum = luma(src[c0], src[c0 + 1], src[c0 + 2]) as u16
                + luma(src[c0 + 3], src[c0 + 4], src[c0 + 5]) as u16
                + luma(src[c1], src[c1 + 1], src[c1 + 2]) as u16
                + luma(src[c1 + 3], src[c1 + 4], src[c1 + 5]) as u16;
            out.push((sum / 4) as u8);
        }
    }
    GrayImage::from_raw(half_w as u32, half_h as u32, out)
        .expect("buffer length matches geometry")
}

/// Pixelwise |a - b| binarized at `threshold`: strictly greater becomes 255,
/// everything else 0. Returns the binary image and its nonzero count.
pub fn absdiff_binarize(a: &GrayImage, b: &GrayImage, threshold: u8) -> (GrayImage, usize) {
    debug_assert_eq!(a.dimensions(), b.dimensions());
    let mut nonzero = 0usize;
    let out: Vec<u8> = a
        .as_raw()
        .iter()
        .zip(b.as_raw().iter())
        .map(|(&pa, &pb)| {
            if pa.abs_diff(pb) > threshold {
                nonzero += 1;
                255
            } else {
                0
            }
        })
        .collect();
    let (w, h) = a.dimensions();
    (
        GrayImage::from_raw(w, h, out).expect("buffer length matches geometry"),
        nonzero,
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bgr_frame(resolution: Resolution, bgr: [u8; 3]) -> Vec<u8> {
        bgr.iter()
            .copied()
            .cycle()
            .take(resolution.pixels() * 3)
            .collect()
    }

    #[test]
    fn rgb_swap_reverses_channel_order() {
        let res = Resolution::new(2, 2);
        let rgb = bgr_to_rgb(&bgr_frame(res, [10, 20, 30]), res);
        assert_eq!(rgb.get_pixel(0, 0).0, [30, 20, 10]);
        assert_eq!(rgb.get_pixel(1, 1).0, [30, 20, 10]);
    }

    #[test]
    fn gray_of_uniform_white_is_white() {
        let res = Resolution::new(4, 4);
        let gray = bgr_to_gray(&bgr_frame(res, [255, 255, 255]), res);
        assert!(gray.as_raw().iter().all(|&p| p == 255));
    }

    #[test]
    fn half_gray_halves_both_axes() {
        let res = Resolution::new(8, 6);
        let gray = bgr_to_half_gray(&bgr_frame(res, [100, 100, 100]), res);
        assert_eq!(gray.dimensions(), (4, 3));
        assert!(gray.as_raw().iter().all(|&p| p == 100));
    }

    #[test]
    fn binarize_is_strictly_above_threshold() {
        let a = GrayImage::from_raw(2, 1, vec![50, 50]).unwrap();
        let b = GrayImage::from_raw(2, 1, vec![60, 61]).unwrap();

        // Differences are 10 and 11; threshold 10 keeps only the second.
        let (diff, count) = absdiff_binarize(&a, &b, 10);
        assert_eq!(diff.as_raw(), &vec![0, 255]);
        assert_eq!(count, 1);
    }

    #[test]
    fn identical_frames_have_zero_count() {
        let a = GrayImage::from_raw(3, 3, vec![7; 9]).unwrap();
        let (_, count) = absdiff_binarize(&a, &a, 1);
        assert_eq!(count, 0);
    }
}

//! Wire encoding of display frames
//!
//! A display frame is split into `TX_SEGMENTS` horizontal strips, each strip
//! is PNG-encoded independently (in parallel), and the result is framed as
//! `u32_le size || bytes` per strip, top to bottom. Splitting trades a
//! little compression ratio for parallel encode latency and lets the client
//! decode incrementally.

use bytes::{BufMut, Bytes, BytesMut};
use image::codecs::png::{CompressionType, FilterType as PngFilterType, PngEncoder};
use image::{ExtendedColorType, GrayImage, ImageEncoder, RgbImage};
use rayon::prelude::*;

use crate::error::{AppError, Result};

/// Number of independently encoded horizontal strips per frame
pub const TX_SEGMENTS: usize = 4;

/// A frame ready for encoding, in the channel layout PNG understands.
#[derive(Debug, Clone)]
pub enum DisplayFrame {
    Color(RgbImage),
    Gray(GrayImage),
}

impl DisplayFrame {
    pub fn dimensions(&self) -> (u32, u32) {
        match self {
            DisplayFrame::Color(img) => img.dimensions(),
            DisplayFrame::Gray(img) => img.dimensions(),
        }
    }

    fn raw(&self) -> &[u8] {
        match self {
            DisplayFrame::Color(img) => img.as_raw(),
            DisplayFrame::Gray(img) => img.as_raw(),
        }
    }

    fn color_type(&self) -> ExtendedColorType {
        match self {
            DisplayFrame::Color(_) => ExtendedColorType::Rgb8,
            DisplayFrame::Gray(_) => ExtendedColorType::L8,
        }
    }

    fn bytes_per_pixel(&self) -> usize {
        match self {
            DisplayFrame::Color(_) => 3,
            DisplayFrame::Gray(_) => 1,
        }
    }
}

/// Gaussian sigma derived from the kernel size (the usual OpenCV rule).
pub fn gaussian_sigma(kernel_size: u8) -> f32 {
    0.3 * ((kernel_size as f32 - 1.0) * 0.5 - 1.0) + 0.8
}

/// Gaussian blur with a `(kernel_size, kernel_size)` aperture.
pub fn blur_gray(src: &GrayImage, kernel_size: u8) -> GrayImage {
    if kernel_size <= 1 {
        return src.clone();
    }
    image::imageops::blur(src, gaussian_sigma(kernel_size))
}

/// Encode a frame as `TX_SEGMENTS` length-prefixed PNG strips.
///
/// Strips are encoded in parallel; the output order is top-to-bottom
/// regardless of completion order, and the call joins before returning.
pub fn encode_segmented(frame: &DisplayFrame) -> Result<Bytes> {
    let (width, height) = frame.dimensions();
    let raw = frame.raw();
    let row_len = width as usize * frame.bytes_per_pixel();
    let color_type = frame.color_type();

    let bands: Vec<(usize, usize)> = (0..TX_SEGMENTS)
        .map(|i| {
            let start = i * height as usize / TX_SEGMENTS;
            let end = (i + 1) * height as usize / TX_SEGMENTS;
            (start, end)
        })
        .collect();

    let strips: Vec<Vec<u8>> = bands
        .into_par_iter()
        .map(|(start, end)| {
            let rows = &raw[start * row_len..end * row_len];
            encode_png(rows, width, (end - start) as u32, color_type)
        })
        .collect::<Result<Vec<_>>>()?;

    let framed_len: usize = strips.iter().map(|s| 4 + s.len()).sum();
    let mut out = BytesMut::with_capacity(framed_len);
    for strip in &strips {
        out.put_u32_le(strip.len() as u32);
        out.put_slice(strip);
    }
    Ok(out.freeze())
}

fn encode_png(rows: &[u8], width: u32, height: u32, color_type: ExtendedColorType) -> Result<Vec<u8>> {
    let mut buf = Vec::new();
    let encoder = PngEncoder::new_with_quality(&mut buf, CompressionType::Fast, PngFilterType::Adaptive);
    encoder
        .write_image(rows, width, height, color_type)
        .map_err(|e| AppError::Encode(e.to_string()))?;
    Ok(buf)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn gradient_rgb(width: u32, height: u32) -> RgbImage {
        RgbImage::from_fn(width, height, |x, y| {
            image::Rgb([(x % 256) as u8, (y % 256) as u8, ((x + y) % 256) as u8])
        })
    }

    /// Split a framed payload back into its strips.
    fn split_segments(payload: &[u8]) -> Vec<Vec<u8>> {
        let mut segments = Vec::new();
        let mut cursor = 0usize;
        while cursor < payload.len() {
            let size =
                u32::from_le_bytes(payload[cursor..cursor + 4].try_into().unwrap()) as usize;
            cursor += 4;
            segments.push(payload[cursor..cursor + size].to_vec());
            cursor += size;
        }
        segments
    }

    #[test]
    fn framing_lengths_are_consistent() {
        let frame = DisplayFrame::Color(gradient_rgb(64, 48));
        let payload = encode_segmented(&frame).unwrap();

        let segments = split_segments(&payload);
        assert_eq!(segments.len(), TX_SEGMENTS);

        let total: usize = segments.iter().map(Vec::len).sum();
        assert_eq!(payload.len(), TX_SEGMENTS * 4 + total);

        for segment in &segments {
            // PNG signature
            assert_eq!(&segment[..8], &[0x89, b'P', b'N', b'G', 0x0d, 0x0a, 0x1a, 0x0a]);
        }
    }

    #[test]
    fn color_round_trip_reconstructs_source() {
        let source = gradient_rgb(32, 32);
        let payload = encode_segmented(&DisplayFrame::Color(source.clone())).unwrap();

        let mut rows: Vec<u8> = Vec::new();
        for segment in split_segments(&payload) {
            let strip = image::load_from_memory(&segment).unwrap().to_rgb8();
            assert_eq!(strip.width(), 32);
            rows.extend_from_slice(strip.as_raw());
        }
        assert_eq!(&rows, source.as_raw());
    }

    #[test]
    fn gray_round_trip_reconstructs_source() {
        let source = GrayImage::from_fn(16, 16, |x, y| image::Luma([(x * 16 + y) as u8]));
        let payload = encode_segmented(&DisplayFrame::Gray(source.clone())).unwrap();

        let mut rows: Vec<u8> = Vec::new();
        for segment in split_segments(&payload) {
            let strip = image::load_from_memory(&segment).unwrap().to_luma8();
            rows.extend_from_slice(strip.as_raw());
        }
        assert_eq!(&rows, source.as_raw());
    }

    #[test]
    fn uneven_heights_go_to_later_strips() {
        // 10 rows over 4 strips: 2,3,2,3.
        let frame = DisplayFrame::Gray(GrayImage::new(8, 10));
        let payload = encode_segmented(&frame).unwrap();

        let heights: Vec<u32> = split_segments(&payload)
            .iter()
            .map(|seg| image::load_from_memory(seg).unwrap().height())
            .collect();
        assert_eq!(heights, vec![2, 3, 2, 3]);
        assert_eq!(heights.iter().sum::<u32>(), 10);
    }

    #[test]
    fn sigma_grows_with_kernel() {
        assert!(gaussian_sigma(3) < gaussian_sigma(5));
        assert!(gaussian_sigma(5) < gaussian_sigma(15));
    }

    #[test]
    fn blur_preserves_geometry_and_mean() {
        let src = GrayImage::from_fn(16, 16, |x, _| if x < 8 { 0 } else { 200 });
        let blurred = blur_gray(&src, 5);
        assert_eq!(blurred.dimensions(), (16, 16));
        // Blur smears the edge: some pixel is strictly between the extremes.
        assert!(blurred.as_raw().iter().any(|&p| p > 10 && p < 190));
    }

    #[test]
    fn kernel_one_is_identity() {
        let src = GrayImage::from_fn(8, 8, |x, y| image::Luma([(x * 8 + y) as u8]));
        assert_eq!(blur_gray(&src, 1).as_raw(), src.as_raw());
    }
}

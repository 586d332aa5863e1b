use image::imageops::{self, FilterType};
use image::{DynamicImage, GrayImage};

/// Convert a decoded frame to a small grayscale thumbnail.
///
/// Comparisons between frames run on thumbnails only, so their cost is fixed
/// regardless of the camera resolution.
pub fn gray_thumbnail(frame: &DynamicImage, width: u32, height: u32) -> GrayImage {
    let gray = frame.to_luma8();
    if gray.dimensions() == (width, height) {
        return gray;
    }
    imageops::resize(&gray, width, height, FilterType::Triangle)
}

/// Mean absolute pixel difference between two thumbnails, on a 0..1 scale.
///
/// Thumbnails of different dimensions are maximally different.
pub fn mean_abs_diff(a: &GrayImage, b: &GrayImage) -> f64 {
    if a.dimensions() != b.dimensions() || a.as_raw().is_empty() {
        return 1.0;
    }
    let total: u64 = a
        .as_raw()
        .iter()
        .zip(b.as_raw())
        .map(|(&x, &y)| u64::from(x.abs_diff(y)))
        .sum();
    total as f64 / a.as_raw().len() as f64 / 255.0
}

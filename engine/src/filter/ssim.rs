//! Mean structural similarity between two grayscale thumbnails.
//!
//! Local statistics use an 11x11 Gaussian window (sigma 1.5) applied as two
//! separable passes, with mirrored borders that do not repeat the edge pixel.

use image::GrayImage;

const WINDOW: usize = 11;
const SIGMA: f64 = 1.5;
const C1: f64 = (0.01 * 255.0) * (0.01 * 255.0);
const C2: f64 = (0.03 * 255.0) * (0.03 * 255.0);

fn gaussian_kernel() -> [f64; WINDOW] {
    let center = (WINDOW / 2) as f64;
    let mut kernel = [0.0; WINDOW];
    for (i, k) in kernel.iter_mut().enumerate() {
        let x = i as f64 - center;
        *k = (-(x * x) / (2.0 * SIGMA * SIGMA)).exp();
    }
    let sum: f64 = kernel.iter().sum();
    kernel.iter_mut().for_each(|k| *k /= sum);
    kernel
}

/// Map an out-of-range index back into `0..len` by reflection about the
/// edge pixel (`dcb|abcd|cba`).
fn reflect(mut i: isize, len: usize) -> usize {
    if len == 1 {
        return 0;
    }
    let last = len as isize - 1;
    loop {
        if i < 0 {
            i = -i;
        } else if i > last {
            i = 2 * last - i;
        } else {
            return i as usize;
        }
    }
}

/// Separable Gaussian blur of a row-major `width x height` plane.
fn blur(src: &[f64], width: usize, height: usize, kernel: &[f64; WINDOW]) -> Vec<f64> {
    let radius = (WINDOW / 2) as isize;
    let mut horizontal = vec![0.0; src.len()];
    for y in 0..height {
        let row = &src[y * width..(y + 1) * width];
        for x in 0..width {
            let mut acc = 0.0;
            for (k, weight) in kernel.iter().enumerate() {
                let sx = reflect(x as isize + k as isize - radius, width);
                acc += weight * row[sx];
            }
            horizontal[y * width + x] = acc;
        }
    }

    let mut out = vec![0.0; src.len()];
    for y in 0..height {
        for x in 0..width {
            let mut acc = 0.0;
            for (k, weight) in kernel.iter().enumerate() {
                let sy = reflect(y as isize + k as isize - radius, height);
                acc += weight * horizontal[sy * width + x];
            }
            out[y * width + x] = acc;
        }
    }
    out
}

/// Mean SSIM over the whole image. 1.0 means identical structure.
///
/// Images of different dimensions score 0.0.
pub fn mean_ssim(a: &GrayImage, b: &GrayImage) -> f64 {
    if a.dimensions() != b.dimensions() || a.as_raw().is_empty() {
        return 0.0;
    }
    let (w, h) = a.dimensions();
    let (width, height) = (w as usize, h as usize);
    let kernel = gaussian_kernel();

    let fa: Vec<f64> = a.as_raw().iter().map(|&p| f64::from(p)).collect();
    let fb: Vec<f64> = b.as_raw().iter().map(|&p| f64::from(p)).collect();
    let aa: Vec<f64> = fa.iter().map(|v| v * v).collect();
    let bb: Vec<f64> = fb.iter().map(|v| v * v).collect();
    let ab: Vec<f64> = fa.iter().zip(&fb).map(|(x, y)| x * y).collect();

    let mu_a = blur(&fa, width, height, &kernel);
    let mu_b = blur(&fb, width, height, &kernel);
    let e_aa = blur(&aa, width, height, &kernel);
    let e_bb = blur(&bb, width, height, &kernel);
    let e_ab = blur(&ab, width, height, &kernel);

    let mut total = 0.0;
    for i in 0..fa.len() {
        let mu_a_sq = mu_a[i] * mu_a[i];
        let mu_b_sq = mu_b[i] * mu_b[i];
        let mu_ab = mu_a[i] * mu_b[i];
        let sigma_a_sq = e_aa[i] - mu_a_sq;
        let sigma_b_sq = e_bb[i] - mu_b_sq;
        let sigma_ab = e_ab[i] - mu_ab;

        let num = (2.0 * mu_ab + C1) * (2.0 * sigma_ab + C2);
        let den = (mu_a_sq + mu_b_sq + C1) * (sigma_a_sq + sigma_b_sq + C2);
        total += num / den;
    }
    total / fa.len() as f64
}

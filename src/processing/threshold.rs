use ndarray::Array3;

use crate::volume::Volume;

const BINS: usize = 256;

pub(super) fn band(data: &Array3<f32>, lower: f32, upper: f32) -> Array3<f32> {
    let mut out = data.clone();
    out.par_mapv_inplace(|v| if v >= lower && v <= upper { 1.0 } else { 0.0 });
    out
}

pub(super) fn above(data: &Array3<f32>, level: f32) -> Array3<f32> {
    let mut out = data.clone();
    out.par_mapv_inplace(|v| if v > level { 1.0 } else { 0.0 });
    out
}

/// Otsu's threshold of the volume's intensities, or `None` for an empty
/// volume.
pub fn otsu_threshold(volume: &Volume) -> Option<f32> {
    (!volume.is_empty()).then(|| otsu_level(volume.data()))
}

/// Maximises the between-class variance over a 256-bin histogram. The
/// threshold is the upper edge of the last background bin.
pub(super) fn otsu_level(data: &Array3<f32>) -> f32 {
    let Some((min, max)) = data
        .iter()
        .filter(|v| v.is_finite())
        .fold(None, |range: Option<(f32, f32)>, &v| match range {
            Some((lo, hi)) => Some((lo.min(v), hi.max(v))),
            None => Some((v, v)),
        })
    else {
        return 0.0;
    };
    if max <= min {
        return min;
    }

    let bin_width = (max - min) / BINS as f32;
    let mut histogram = [0u64; BINS];
    for &v in data.iter().filter(|v| v.is_finite()) {
        let bin = (((v - min) / bin_width) as usize).min(BINS - 1);
        histogram[bin] += 1;
    }

    let total: u64 = histogram.iter().sum();
    let weighted_total: f64 = histogram
        .iter()
        .enumerate()
        .map(|(i, &n)| i as f64 * n as f64)
        .sum();

    let mut background = 0u64;
    let mut weighted_background = 0.0;
    let mut best = (f64::NEG_INFINITY, 0usize);
    for (i, &n) in histogram.iter().enumerate().take(BINS - 1) {
        background += n;
        weighted_background += i as f64 * n as f64;
        let foreground = total - background;
        if background == 0 || foreground == 0 {
            continue;
        }
        let mean_bg = weighted_background / background as f64;
        let mean_fg = (weighted_total - weighted_background) / foreground as f64;
        let between = background as f64 * foreground as f64 * (mean_bg - mean_fg).powi(2);
        if between > best.0 {
            best = (between, i);
        }
    }
    min + (best.1 + 1) as f32 * bin_width
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn band_is_inclusive() {
        let data = Array3::from_shape_vec((1, 1, 4), vec![0.0, 1.0, 2.0, 3.0]).unwrap();
        let out = band(&data, 1.0, 2.0);
        assert_eq!(out.as_slice().unwrap(), &[0.0, 1.0, 1.0, 0.0]);
    }

    #[test]
    fn otsu_separates_two_populations() {
        let data = Array3::from_shape_fn((2, 10, 10), |(_, y, x)| {
            if x < 5 { 10.0 + (y % 3) as f32 } else { 200.0 + (y % 3) as f32 }
        });
        let level = otsu_level(&data);
        assert!(level > 12.0 && level < 200.0, "level {level}");

        let mask = above(&data, level);
        assert_eq!(mask.sum(), 100.0);
        assert_eq!(mask[[0, 0, 9]], 1.0);
    }

    #[test]
    fn constant_volume_has_no_foreground() {
        let data = Array3::from_elem((2, 2, 2), 7.0);
        let level = otsu_level(&data);
        assert_eq!(level, 7.0);
        assert_eq!(above(&data, level).sum(), 0.0);
        assert_eq!(otsu_threshold(&Volume::default()), None);
    }
}

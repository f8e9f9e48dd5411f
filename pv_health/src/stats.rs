//! Small robust-statistics helpers shared by the modeling and QC stages.

/// Median of the finite values, `None` when there are none.
pub fn median(values: &[f64]) -> Option<f64> {
    let mut v: Vec<f64> = values.iter().copied().filter(|x| x.is_finite()).collect();
    if v.is_empty() {
        return None;
    }
    v.sort_by(f64::total_cmp);
    Some(median_of_sorted(&v))
}

fn median_of_sorted(sorted: &[f64]) -> f64 {
    let n = sorted.len();
    if n % 2 == 1 {
        sorted[n / 2]
    } else {
        (sorted[n / 2 - 1] + sorted[n / 2]) / 2.0
    }
}

/// Median absolute deviation around the median (unscaled).
pub fn mad(values: &[f64]) -> Option<f64> {
    let med = median(values)?;
    let deviations: Vec<f64> = values
        .iter()
        .filter(|x| x.is_finite())
        .map(|x| (x - med).abs())
        .collect();
    median(&deviations)
}

pub fn mean(values: &[f64]) -> Option<f64> {
    if values.is_empty() {
        None
    } else {
        Some(values.iter().sum::<f64>() / values.len() as f64)
    }
}

/// Sample standard deviation (n - 1 denominator).
pub fn sample_std(values: &[f64]) -> Option<f64> {
    if values.len() < 2 {
        return None;
    }
    let m = mean(values)?;
    let ss: f64 = values.iter().map(|x| (x - m) * (x - m)).sum();
    Some((ss / (values.len() - 1) as f64).sqrt())
}

/// Trailing rolling median over `window` positions; emits a value once at
/// least `min_periods` non-null observations are inside the window.
pub fn rolling_median(values: &[Option<f64>], window: usize, min_periods: usize) -> Vec<Option<f64>> {
    let window = window.max(1);
    let mut sorted: Vec<f64> = Vec::with_capacity(window);
    let mut out = Vec::with_capacity(values.len());

    for i in 0..values.len() {
        if let Some(x) = values[i].filter(|x| x.is_finite()) {
            let pos = sorted.partition_point(|v| *v < x);
            sorted.insert(pos, x);
        }
        if i >= window {
            if let Some(old) = values[i - window].filter(|x| x.is_finite()) {
                let pos = sorted.partition_point(|v| *v < old);
                sorted.remove(pos);
            }
        }
        if !sorted.is_empty() && sorted.len() >= min_periods {
            out.push(Some(median_of_sorted(&sorted)));
        } else {
            out.push(None);
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn test_median_and_mad() {
        assert_eq!(median(&[3.0, 1.0, 2.0]), Some(2.0));
        assert_eq!(median(&[4.0, 1.0, 2.0, 3.0]), Some(2.5));
        assert_eq!(median(&[]), None);
        assert_eq!(median(&[f64::NAN]), None);
        // deviations from 3: [2, 1, 0, 1, 97] -> median 1
        assert_eq!(mad(&[1.0, 2.0, 3.0, 4.0, 100.0]), Some(1.0));
    }

    #[test]
    fn test_sample_std() {
        assert_relative_eq!(sample_std(&[2.0, 4.0, 4.0, 4.0, 5.0, 5.0, 7.0, 9.0]).unwrap(), 2.138089935, epsilon = 1e-8);
        assert_eq!(sample_std(&[1.0]), None);
    }

    #[test]
    fn test_rolling_median_trailing_with_min_periods() {
        let values = vec![Some(1.0), Some(5.0), None, Some(3.0), Some(10.0), Some(2.0)];
        let out = rolling_median(&values, 3, 2);
        assert_eq!(out[0], None);
        assert_eq!(out[1], Some(3.0));
        // window [5, None, 3]
        assert_eq!(out[3], Some(4.0));
        // window [None, 3, 10]
        assert_eq!(out[4], Some(6.5));
        // window [3, 10, 2]
        assert_eq!(out[5], Some(3.0));
    }
}

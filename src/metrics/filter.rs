//! Statistical outlier rejection for cycle-time sample sets.

/// Retention band half-width around the mean, in standard deviations.
const SIGMA_THRESHOLD: f64 = 2.0;

/// Result of filtering one sample set.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct FilterOutcome {
    /// Mean of the retained samples. None only for empty input.
    pub average: Option<f64>,
    /// Number of samples behind `average`.
    pub valid_count: usize,
    /// Samples rejected by the band check.
    pub outliers_removed: usize,
    /// Population standard deviation of the full input set. Left at zero
    /// when fewer than three samples were supplied.
    pub std_dev: f64,
}

/// Two-pass mean/sigma filter.
///
/// First pass computes population mean and standard deviation over the full
/// set; second pass retains samples inside `mean +/- 2 sigma` (inclusive) and
/// averages them. Fewer than three samples skip filtering entirely and report
/// the plain mean. If the band rejects every sample, the unfiltered mean is
/// reported with the original sample count so a non-empty input never yields
/// zero valid samples.
pub fn filter_outliers(values: &[f64]) -> FilterOutcome {
    if values.is_empty() {
        return FilterOutcome::default();
    }

    let mean = values.iter().sum::<f64>() / values.len() as f64;

    if values.len() < 3 {
        return FilterOutcome {
            average: Some(mean),
            valid_count: values.len(),
            outliers_removed: 0,
            std_dev: 0.0,
        };
    }

    let variance = values.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / values.len() as f64;
    let std_dev = variance.sqrt();

    let lower = mean - SIGMA_THRESHOLD * std_dev;
    let upper = mean + SIGMA_THRESHOLD * std_dev;

    let mut retained_sum = 0.0;
    let mut retained_count = 0usize;
    for v in values {
        if *v >= lower && *v <= upper {
            retained_sum += v;
            retained_count += 1;
        }
    }

    let outliers_removed = values.len() - retained_count;

    if retained_count == 0 {
        // Degenerate all-outlier set: report the raw mean anyway.
        return FilterOutcome {
            average: Some(mean),
            valid_count: values.len(),
            outliers_removed,
            std_dev,
        };
    }

    FilterOutcome {
        average: Some(retained_sum / retained_count as f64),
        valid_count: retained_count,
        outliers_removed,
        std_dev,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_input() {
        let out = filter_outliers(&[]);
        assert_eq!(out.average, None);
        assert_eq!(out.valid_count, 0);
        assert_eq!(out.outliers_removed, 0);
        assert_eq!(out.std_dev, 0.0);
    }

    #[test]
    fn test_fewer_than_three_is_plain_mean() {
        let out = filter_outliers(&[4.0]);
        assert_eq!(out.average, Some(4.0));
        assert_eq!(out.valid_count, 1);
        assert_eq!(out.std_dev, 0.0);

        let out = filter_outliers(&[4.0, 8.0]);
        assert_eq!(out.average, Some(6.0));
        assert_eq!(out.valid_count, 2);
        assert_eq!(out.outliers_removed, 0);
    }

    #[test]
    fn test_single_extreme_outlier_removed() {
        let out = filter_outliers(&[10.0, 10.0, 10.0, 10.0, 10.0, 500.0]);
        assert_eq!(out.outliers_removed, 1);
        assert_eq!(out.valid_count, 5);
        let avg = out.average.unwrap();
        assert!((avg - 10.0).abs() < 1e-9, "outlier leaked into average: {avg}");
        assert!(out.std_dev > 0.0);
    }

    #[test]
    fn test_uniform_samples_all_retained() {
        let out = filter_outliers(&[12.0, 12.0, 12.0, 12.0]);
        assert_eq!(out.average, Some(12.0));
        assert_eq!(out.valid_count, 4);
        assert_eq!(out.outliers_removed, 0);
        assert_eq!(out.std_dev, 0.0);
    }

    #[test]
    fn test_band_is_inclusive() {
        // With four samples at 10 and one at 30, the extreme sits exactly at
        // mean + 2 sigma (mean 14, sigma 8) and must be retained.
        let values = [10.0, 10.0, 10.0, 10.0, 30.0];
        let out = filter_outliers(&values);
        assert_eq!(out.valid_count, 5);
        assert_eq!(out.outliers_removed, 0);
        assert_eq!(out.average, Some(14.0));
    }

    #[test]
    fn test_nonempty_input_never_reports_zero_valid_samples() {
        let nasty: &[&[f64]] = &[
            &[0.0, 0.0, 0.0, 1e9],
            &[1.0, 2.0, 4.0, 8.0, 16.0, 32.0],
            &[299.0; 7],
            &[0.1, 299.9],
        ];
        for values in nasty {
            let out = filter_outliers(values);
            assert!(out.valid_count > 0, "zero valid for {values:?}");
            assert!(out.average.is_some(), "no average for {values:?}");
        }
    }
}

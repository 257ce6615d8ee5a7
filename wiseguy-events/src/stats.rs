/// Statistical summary of a flattened sample list.
#[derive(Clone, Debug, PartialEq)]
pub struct Summary {
    pub min: f64,
    pub max: f64,
    pub average: f64,
    pub median: f64,
    pub std_dev: f64,
    pub samples: usize,
    /// (percentile, value) pairs in the order requested.
    pub percentile_map: Vec<(u32, f64)>,
}

/// Summarize a sample list. Returns `None` on an empty list.
///
/// The percentile index is `floor(samples * p / 100)`, clamped to the
/// last sample so p=100 reads the maximum rather than one past the end.
pub fn compute_statistics(mut samples: Vec<i64>, percentile_list: &[u32]) -> Option<Summary> {
    let sample_count = samples.len();
    if sample_count == 0 {
        return None;
    }
    samples.sort_unstable();

    let total: i64 = samples.iter().sum();
    let average = total as f64 / sample_count as f64;
    let sdsq: f64 = samples
        .iter()
        .map(|&x| {
            let d = x as f64 - average;
            d * d
        })
        .sum();
    let divisor = if sample_count > 1 { sample_count - 1 } else { 1 };
    let std_dev = (sdsq / divisor as f64).sqrt();
    let median = samples[sample_count / 2] as f64;

    let percentile_map = percentile_list
        .iter()
        .map(|&percentile| {
            let index = (sample_count * percentile as usize / 100).min(sample_count - 1);
            (percentile, samples[index] as f64)
        })
        .collect();

    Some(Summary {
        min: samples[0] as f64,
        max: samples[sample_count - 1] as f64,
        average,
        median,
        std_dev,
        samples: sample_count,
        percentile_map,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_samples() {
        assert!(compute_statistics(Vec::new(), &[]).is_none());
    }

    #[test]
    fn test_basic_summary() {
        let summary = compute_statistics(vec![30, 10, 20, 40], &[]).unwrap();
        assert_eq!(summary.min, 10.0);
        assert_eq!(summary.max, 40.0);
        assert_eq!(summary.average, 25.0);
        assert_eq!(summary.median, 30.0);
        assert_eq!(summary.samples, 4);
        // sample variance: ((15^2 + 5^2 + 5^2 + 15^2) / 3).sqrt()
        assert!((summary.std_dev - (500.0f64 / 3.0).sqrt()).abs() < 1e-9);
    }

    #[test]
    fn test_percentiles_clamp_at_p100() {
        let summary = compute_statistics(vec![10, 20, 30, 40, 50], &[0, 50, 75, 100]).unwrap();
        assert_eq!(
            summary.percentile_map,
            vec![(0, 10.0), (50, 30.0), (75, 40.0), (100, 50.0)]
        );
    }

    #[test]
    fn test_single_sample() {
        let summary = compute_statistics(vec![7], &[100]).unwrap();
        assert_eq!(summary.median, 7.0);
        assert_eq!(summary.std_dev, 0.0);
        assert_eq!(summary.percentile_map, vec![(100, 7.0)]);
    }
}

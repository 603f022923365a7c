//! Reliability scoring helpers shared by the route and operator
//! aggregations.

/// Composite reliability score in [0, 100].
///
/// Weights: PPM-5 40%, PPM-10 30%, cancellation rate 20%, severe-delay
/// rate 10%. Inputs are percentages.
pub fn reliability_score(
    ppm5_pct: f64,
    ppm10_pct: f64,
    cancelled_pct: f64,
    severe_delay_pct: f64,
) -> f64 {
    let score = ppm5_pct * 0.4
        + ppm10_pct * 0.3
        + (100.0 - cancelled_pct) * 0.2
        + (100.0 - severe_delay_pct) * 0.1;
    score.clamp(0.0, 100.0)
}

/// Converts a reliability score into a letter grade.
///
/// | Range   | Grade |
/// |---------|-------|
/// | >= 90   | A     |
/// | >= 80   | B     |
/// | >= 70   | C     |
/// | >= 60   | D     |
/// | < 60    | F     |
pub fn grade(score: f64) -> &'static str {
    match score {
        s if s >= 90.0 => "A",
        s if s >= 80.0 => "B",
        s if s >= 70.0 => "C",
        s if s >= 60.0 => "D",
        _ => "F",
    }
}

pub fn mean(values: &[f64]) -> f64 {
    if values.is_empty() {
        return 0.0;
    }
    values.iter().sum::<f64>() / values.len() as f64
}

/// Population standard deviation.
pub fn stddev(values: &[f64]) -> f64 {
    if values.is_empty() {
        return 0.0;
    }
    let m = mean(values);
    let variance = values.iter().map(|v| (v - m).powi(2)).sum::<f64>() / values.len() as f64;
    variance.sqrt()
}

/// Median over a stable ascending sort; ties keep their input order and the
/// upper-middle element is taken for even lengths, so repeated runs over the
/// same data always agree.
pub fn median(values: &[i64]) -> f64 {
    if values.is_empty() {
        return 0.0;
    }
    let mut sorted = values.to_vec();
    sorted.sort();
    sorted[sorted.len() / 2] as f64
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn perfect_route_scores_100() {
        assert_eq!(reliability_score(100.0, 100.0, 0.0, 0.0), 100.0);
    }

    #[test]
    fn score_is_weighted_sum() {
        // 80*0.4 + 90*0.3 + 98*0.2 + 95*0.1 = 88.1
        let score = reliability_score(80.0, 90.0, 2.0, 5.0);
        assert!((score - 88.1).abs() < 1e-9);
    }

    #[test]
    fn grade_bands() {
        assert_eq!(grade(95.0), "A");
        assert_eq!(grade(90.0), "A");
        assert_eq!(grade(89.99), "B");
        assert_eq!(grade(75.0), "C");
        assert_eq!(grade(60.0), "D");
        assert_eq!(grade(59.9), "F");
    }

    #[test]
    fn median_is_deterministic_on_ties() {
        assert_eq!(median(&[3, 1, 3, 2, 3]), 3.0);
        assert_eq!(median(&[1, 2, 3, 4]), 3.0);
        assert_eq!(median(&[]), 0.0);
    }

    #[test]
    fn stddev_of_constant_is_zero() {
        assert_eq!(stddev(&[4.0, 4.0, 4.0]), 0.0);
        assert!((stddev(&[2.0, 4.0, 4.0, 4.0, 5.0, 5.0, 7.0, 9.0]) - 2.0).abs() < 1e-9);
    }
}

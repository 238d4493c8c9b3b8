//! Small descriptive-statistics helpers shared by every stage.
//!
//! Missing values are carried as `NaN` throughout the numeric code, so every
//! helper here skips non-finite entries unless stated otherwise.

use statrs::distribution::{ChiSquared, ContinuousCDF, Normal};

/// Quantile with linear interpolation between order statistics, matching the
/// default behaviour of the dataframe tooling the survey files were prepared with.
/// Returns `None` when no finite value is present.
pub fn quantile(values: &[f64], q: f64) -> Option<f64> {
    let mut finite: Vec<f64> = values.iter().copied().filter(|v| v.is_finite()).collect();
    if finite.is_empty() {
        return None;
    }
    finite.sort_by(f64::total_cmp);
    let q = q.clamp(0.0, 1.0);
    let position = q * (finite.len() - 1) as f64;
    let lower = position.floor() as usize;
    let upper = position.ceil() as usize;
    let fraction = position - lower as f64;
    Some(finite[lower] + (finite[upper] - finite[lower]) * fraction)
}

/// Mean over the finite entries; `NaN` when there are none.
pub fn finite_mean(values: &[f64]) -> f64 {
    let (sum, count) = values
        .iter()
        .filter(|v| v.is_finite())
        .fold((0.0, 0usize), |(s, c), &v| (s + v, c + 1));
    if count == 0 { f64::NAN } else { sum / count as f64 }
}

/// Variance over the finite entries with `ddof` delta degrees of freedom.
pub fn finite_variance(values: &[f64], ddof: usize) -> f64 {
    let mean = finite_mean(values);
    let (ss, count) = values
        .iter()
        .filter(|v| v.is_finite())
        .fold((0.0, 0usize), |(s, c), &v| (s + (v - mean).powi(2), c + 1));
    if count <= ddof {
        return f64::NAN;
    }
    ss / (count - ddof) as f64
}

pub fn missing_count(values: &[f64]) -> usize {
    values.iter().filter(|v| !v.is_finite()).count()
}

/// Two-sided p-value of a z statistic under the standard normal.
pub fn two_sided_normal_p(z: f64) -> f64 {
    if !z.is_finite() {
        return f64::NAN;
    }
    match Normal::new(0.0, 1.0) {
        Ok(normal) => 2.0 * (1.0 - normal.cdf(z.abs())),
        Err(_) => f64::NAN,
    }
}

/// Upper-tail probability of a chi-square statistic.
pub fn chi_square_survival(statistic: f64, df: usize) -> f64 {
    if df == 0 || !statistic.is_finite() {
        return f64::NAN;
    }
    match ChiSquared::new(df as f64) {
        Ok(dist) => 1.0 - dist.cdf(statistic.max(0.0)),
        Err(_) => f64::NAN,
    }
}

/// Canonical text form of a numeric identifier or category code.
///
/// Integral values lose their fractional part so that `1001`, `1001.0` and
/// `1001.00` all map to the same key regardless of how a CSV writer rendered them.
pub fn canonical_key(value: f64) -> String {
    if value.fract() == 0.0 && value.abs() < 1e15 {
        format!("{}", value as i64)
    } else {
        let mut buffer = ryu::Buffer::new();
        buffer.format(value).to_string()
    }
}

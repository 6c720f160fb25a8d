use serde::Serialize;

/// Welford accumulator.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct RunningStats {
    count: u64,
    mean: f64,
    m2: f64,
}

impl RunningStats {
    pub fn push(&mut self, x: f64) {
        self.count += 1;
        let delta = x - self.mean;
        self.mean += delta / self.count as f64;
        self.m2 += delta * (x - self.mean);
    }

    pub fn mean(&self) -> f64 {
        self.mean
    }

    /// Sample variance; 0 with fewer than two observations.
    pub fn variance(&self) -> f64 {
        if self.count < 2 {
            0.0
        } else {
            self.m2 / (self.count - 1) as f64
        }
    }

    pub fn std_dev(&self) -> f64 {
        self.variance().sqrt()
    }
}

impl FromIterator<f64> for RunningStats {
    fn from_iter<I: IntoIterator<Item = f64>>(iter: I) -> Self {
        let mut stats = Self::default();
        for x in iter {
            stats.push(x);
        }
        stats
    }
}

/// Linear interpolation between closest ranks; `sorted` must be ascending.
pub fn percentile(sorted: &[f64], q: f64) -> Option<f64> {
    if sorted.is_empty() {
        return None;
    }
    let rank = q.clamp(0.0, 1.0) * (sorted.len() - 1) as f64;
    let lo = rank.floor() as usize;
    let hi = rank.ceil() as usize;
    let weight = rank - lo as f64;
    Some(sorted[lo] + (sorted[hi] - sorted[lo]) * weight)
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct PaceDistribution {
    pub p05: f64,
    pub p50: f64,
    pub p95: f64,
    /// `(p95 - p05) / p50`, 0 when the median is 0.
    pub robustness: f64,
    pub samples: usize,
}

impl PaceDistribution {
    /// Sorts `times` in place. `None` when every trial was a DNF.
    pub fn from_times(times: &mut [f64]) -> Option<Self> {
        times.sort_by(f64::total_cmp);
        let p05 = percentile(times, 0.05)?;
        let p50 = percentile(times, 0.50)?;
        let p95 = percentile(times, 0.95)?;
        Some(Self {
            p05,
            p50,
            p95,
            robustness: robustness_score(p05, p50, p95),
            samples: times.len(),
        })
    }
}

pub fn robustness_score(p05: f64, p50: f64, p95: f64) -> f64 {
    if p50 == 0.0 || !p50.is_finite() {
        return 0.0;
    }
    let score = (p95 - p05) / p50;
    if score.is_finite() {
        score
    } else {
        0.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn running_stats_match_two_pass() {
        let xs: Vec<f64> = (0..1000).map(|i| 5400.0 + (i as f64 * 0.37).sin() * 12.0).collect();
        let stats: RunningStats = xs.iter().copied().collect();
        let mean = xs.iter().sum::<f64>() / xs.len() as f64;
        let variance =
            xs.iter().map(|x| (x - mean) * (x - mean)).sum::<f64>() / (xs.len() - 1) as f64;
        assert!((stats.mean() - mean).abs() < 1e-9);
        assert!((stats.variance() - variance).abs() < 1e-6);

        let single: RunningStats = std::iter::once(5400.0).collect();
        assert_eq!((single.mean(), single.variance()), (5400.0, 0.0));
    }

    #[test]
    fn percentile_interpolates() {
        let xs = [1.0, 2.0, 3.0, 4.0, 5.0];
        assert_eq!(percentile(&xs, 0.0), Some(1.0));
        assert_eq!(percentile(&xs, 0.5), Some(3.0));
        assert_eq!(percentile(&xs, 0.625), Some(3.5));
        assert_eq!(percentile(&[], 0.5), None);
    }

    #[test]
    fn robustness_guards_zero_median() {
        assert_eq!(robustness_score(-1.0, 0.0, 1.0), 0.0);
        assert!((robustness_score(90.0, 100.0, 110.0) - 0.2).abs() < 1e-12);
        let mut none: Vec<f64> = vec![];
        assert!(PaceDistribution::from_times(&mut none).is_none());
    }
}

// Energy Statistics
// E-divisive distance between two samples and per-split statistics of a segment

/// Energy distance between two samples (absolute difference, exponent 1).
///
/// `2·mean|a−b| − mean_{pairs}|a−a'| − mean_{pairs}|b−b'|`; within-sample terms
/// are omitted for samples with a single element.
pub fn energy(a: &[f64], b: &[f64]) -> f64 {
    let m = a.len();
    let k = b.len();
    if m == 0 || k == 0 {
        return 0.0;
    }

    let mut between = 0.0;
    for x in a {
        for y in b {
            between += (x - y).abs();
        }
    }

    combine(between, within(a), within(b), m, k)
}

/// Sum of |x−y| over unordered pairs of a sample
fn within(sample: &[f64]) -> f64 {
    let mut sum = 0.0;
    for (i, x) in sample.iter().enumerate() {
        for y in &sample[i + 1..] {
            sum += (x - y).abs();
        }
    }
    sum
}

fn pairs(n: usize) -> f64 {
    (n * (n - 1)) as f64 / 2.0
}

fn combine(between: f64, within_a: f64, within_b: f64, m: usize, k: usize) -> f64 {
    let mut e = 2.0 * between / (m * k) as f64;
    if m > 1 {
        e -= within_a / pairs(m);
    }
    if k > 1 {
        e -= within_b / pairs(k);
    }
    e
}

/// Energy statistics for every split point of a segment.
///
/// Split `t` puts `segment[..t]` on the left and `segment[t..]` on the right.
/// `e(t)` is the energy distance and `q(t) = e(t)·m·k/(m+k)` the scaled statistic
/// used to locate the split. Both are zero for `t == 0` and `t == len`.
#[derive(Debug, Clone)]
pub struct SplitStatistics {
    e: Vec<f64>,
    q: Vec<f64>,
}

impl SplitStatistics {
    /// Compute all split statistics in O(n²) by moving one element at a time
    /// from the right sample into the left one.
    pub fn compute(segment: &[f64]) -> Self {
        let n = segment.len();
        let distance = |i: usize, j: usize| (segment[i] - segment[j]).abs();

        let mut within_a = 0.0;
        let mut within_b = within(segment);
        let mut between = 0.0;

        let mut e = vec![0.0; n + 1];
        let mut q = vec![0.0; n + 1];

        for t in 0..n {
            let to_left: f64 = (0..t).map(|i| distance(i, t)).sum();
            let to_right: f64 = (t + 1..n).map(|j| distance(t, j)).sum();

            within_a += to_left;
            within_b -= to_right;
            between = between - to_left + to_right;

            let m = t + 1;
            let k = n - m;
            if k == 0 {
                continue;
            }
            let value = combine(between, within_a, within_b, m, k);
            e[m] = value;
            q[m] = value * (m * k) as f64 / (m + k) as f64;
        }

        Self { e, q }
    }

    /// Length of the underlying segment
    pub fn len(&self) -> usize {
        self.e.len() - 1
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn e(&self, t: usize) -> f64 {
        self.e[t]
    }

    pub fn q(&self, t: usize) -> f64 {
        self.q[t]
    }

    /// Split index with the largest `q`; the first one wins on ties
    pub fn estimate(&self) -> Option<usize> {
        let n = self.len();
        let mut best: Option<usize> = None;
        for t in 1..n {
            match best {
                Some(b) if self.q[t] <= self.q[b] => {}
                _ => best = Some(t),
            }
        }
        best
    }

    /// Contiguous range of split indices around `t` whose energy stays within
    /// `ratio` of the energy at `t`. Bounded to `1..=len-1`.
    pub fn tie_range(&self, t: usize, ratio: f64) -> (usize, usize) {
        let n = self.len();
        let threshold = ratio * self.e[t];
        let mut low = t;
        let mut high = t;
        while low > 1 && self.e[low - 1] >= threshold {
            low -= 1;
        }
        while high + 1 < n && self.e[high + 1] >= threshold {
            high += 1;
        }
        (low, high)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn assert_close(a: f64, b: f64) {
        assert!((a - b).abs() < 1e-9, "{} != {}", a, b);
    }

    #[test]
    fn test_energy_identical_samples() {
        assert_close(energy(&[3.0, 3.0], &[3.0, 3.0, 3.0]), 0.0);
    }

    #[test]
    fn test_energy_separated_samples() {
        // between mean 4, no spread within
        assert_close(energy(&[1.0, 1.0, 1.0, 1.0], &[5.0, 5.0, 5.0, 5.0]), 8.0);
        // single-element samples skip the within term
        assert_close(energy(&[1.0], &[3.0]), 4.0);
        assert_close(energy(&[], &[1.0]), 0.0);
    }

    #[test]
    fn test_split_statistics_match_direct_energy() {
        let segment = [1.0, 4.0, 2.0, 8.0, 8.5, 9.0, 3.0];
        let stats = SplitStatistics::compute(&segment);
        assert_eq!(stats.len(), segment.len());
        for t in 1..segment.len() {
            let (a, b) = segment.split_at(t);
            assert_close(stats.e(t), energy(a, b));
            let (m, k) = (t as f64, (segment.len() - t) as f64);
            assert_close(stats.q(t), energy(a, b) * m * k / (m + k));
        }
        assert_close(stats.e(0), 0.0);
        assert_close(stats.q(segment.len()), 0.0);
    }

    #[test]
    fn test_estimate_step() {
        let mut segment = vec![1.0; 10];
        segment.extend(vec![2.0; 10]);
        let stats = SplitStatistics::compute(&segment);
        assert_eq!(stats.estimate(), Some(10));
        assert_eq!(stats.tie_range(10, 0.9), (10, 10));
    }

    #[test]
    fn test_estimate_too_short() {
        assert_eq!(SplitStatistics::compute(&[1.0]).estimate(), None);
        assert_eq!(SplitStatistics::compute(&[]).estimate(), None);
        assert_eq!(SplitStatistics::compute(&[1.0, 2.0]).estimate(), Some(1));
    }
}

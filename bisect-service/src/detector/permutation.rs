// Permutation Test
// Significance of the energy distance between the two sides of a split

use super::energy::energy;

use rand::seq::SliceRandom;
use rand::Rng;

/// Random permutations drawn when exact enumeration is too expensive
pub const PERMUTATIONS: usize = 199;

/// Largest number of splits enumerated exactly
pub const EXACT_LIMIT: u64 = 5000;

/// p-value of the energy distance between `sequence[..index]` and `sequence[index..]`.
///
/// When the number of ways to choose `index` elements is at most [`EXACT_LIMIT`]
/// every assignment is enumerated and the p-value is exact. Otherwise
/// [`PERMUTATIONS`] shuffles are drawn from `rng` and `(hits + 1) / (R + 1)` is
/// returned.
pub fn p_value<R: Rng + ?Sized>(sequence: &[f64], index: usize, rng: &mut R) -> f64 {
    let n = sequence.len();
    if index == 0 || index >= n {
        return 1.0;
    }

    let (a, b) = sequence.split_at(index);
    let observed = energy(a, b);
    let threshold = observed - 1e-9 * observed.abs().max(1.0);

    if binomial_within(n, index, EXACT_LIMIT) {
        exact_p_value(sequence, index, threshold)
    } else {
        sampled_p_value(sequence, index, threshold, rng)
    }
}

fn exact_p_value(sequence: &[f64], index: usize, threshold: f64) -> f64 {
    let n = sequence.len();
    let mut total = 0u64;
    let mut hits = 0u64;

    let mut left = Vec::with_capacity(index);
    let mut right = Vec::with_capacity(n - index);
    let mut selected = vec![false; n];

    for_each_combination(n, index, |combination| {
        selected.iter_mut().for_each(|s| *s = false);
        for &i in combination {
            selected[i] = true;
        }
        left.clear();
        right.clear();
        for (i, value) in sequence.iter().enumerate() {
            if selected[i] {
                left.push(*value);
            } else {
                right.push(*value);
            }
        }

        total += 1;
        if energy(&left, &right) >= threshold {
            hits += 1;
        }
    });

    hits as f64 / total as f64
}

fn sampled_p_value<R: Rng + ?Sized>(
    sequence: &[f64],
    index: usize,
    threshold: f64,
    rng: &mut R,
) -> f64 {
    let mut pool = sequence.to_vec();
    let mut hits = 0usize;
    for _ in 0..PERMUTATIONS {
        pool.shuffle(rng);
        let (a, b) = pool.split_at(index);
        if energy(a, b) >= threshold {
            hits += 1;
        }
    }
    (hits + 1) as f64 / (PERMUTATIONS + 1) as f64
}

/// Whether C(n, k) is at most `limit`, without overflowing
fn binomial_within(n: usize, k: usize, limit: u64) -> bool {
    let k = k.min(n - k) as u64;
    let n = n as u64;
    let mut value: u64 = 1;
    for i in 0..k {
        // Exact at every step: value * (n - i) is divisible by (i + 1).
        value = value * (n - i) / (i + 1);
        if value > limit {
            return false;
        }
    }
    true
}

/// Visit every k-subset of 0..n in lexicographic order
fn for_each_combination<F: FnMut(&[usize])>(n: usize, k: usize, mut visit: F) {
    if k > n {
        return;
    }
    let mut indices: Vec<usize> = (0..k).collect();
    loop {
        visit(&indices);

        // Find the rightmost index that can still move right.
        let mut i = k;
        loop {
            if i == 0 {
                return;
            }
            i -= 1;
            if indices[i] != i + n - k {
                break;
            }
            if i == 0 {
                return;
            }
        }
        indices[i] += 1;
        for j in i + 1..k {
            indices[j] = indices[j - 1] + 1;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    #[test]
    fn test_binomial_within() {
        assert!(binomial_within(8, 4, 5000)); // 70
        assert!(binomial_within(14, 7, 5000)); // 3432
        assert!(!binomial_within(16, 8, 5000)); // 12870
        assert!(binomial_within(300, 1, 5000));
        assert!(!binomial_within(300, 2, 5000)); // 44850
    }

    #[test]
    fn test_combinations_count() {
        let mut count = 0;
        for_each_combination(6, 3, |c| {
            assert_eq!(c.len(), 3);
            assert!(c.windows(2).all(|w| w[0] < w[1]));
            count += 1;
        });
        assert_eq!(count, 20);

        let mut count = 0;
        for_each_combination(4, 4, |_| count += 1);
        assert_eq!(count, 1);
    }

    #[test]
    fn test_exact_p_value() {
        let mut rng = StdRng::seed_from_u64(1);
        let p = p_value(&[1.0, 1.0, 1.0, 1.0, 5.0, 5.0, 5.0, 5.0], 4, &mut rng);
        // Only the observed split and its mirror reach the observed distance.
        assert!((p - 2.0 / 70.0).abs() < 1e-12);
    }

    #[test]
    fn test_constant_sequence_is_not_significant() {
        let mut rng = StdRng::seed_from_u64(1);
        let values = vec![7.0; 40];
        assert_eq!(p_value(&values, 20, &mut rng), 1.0);
    }

    #[test]
    fn test_sampled_p_value_for_large_shift() {
        let mut rng = StdRng::seed_from_u64(3);
        let mut values = vec![10.0; 30];
        values.extend(vec![20.0; 30]);
        let p = p_value(&values, 30, &mut rng);
        assert!((p - 1.0 / 200.0).abs() < 1e-12);
    }
}

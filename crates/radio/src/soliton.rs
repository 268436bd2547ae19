//! Robust Soliton degree distribution for the LT fountain code.
//!
//! Both ends of the link build the same CDF for a given K and draw degrees
//! through the shared [`JavaRandom`](crate::lcg::JavaRandom) stream, so the
//! construction here must stay aligned with the Android peer.

use crate::lcg::JavaRandom;

const C: f64 = 0.1;
const DELTA: f64 = 0.5;

/// Cumulative distribution over block degrees `1..=k`.
///
/// `cdf[d - 1]` is the probability of drawing a degree `<= d`. For `k <= 0`
/// the distribution degenerates to always-degree-1.
pub fn robust_soliton_cdf(k: i32) -> Vec<f64> {
    if k <= 0 {
        return vec![1.0];
    }
    let k = k as usize;
    let kf = k as f64;

    // Ideal Soliton rho.
    let mut rho = vec![0.0; k];
    rho[0] = 1.0 / kf;
    for d in 2..=k {
        rho[d - 1] = 1.0 / (d as f64 * (d as f64 - 1.0));
    }

    // Spike term tau at floor(K / R).
    let r = C * (kf / DELTA).ln() * kf.sqrt();
    let spike = if r > 0.0 { (kf / r).floor() as usize } else { 0 };
    let mut tau = vec![0.0; k];
    for d in 1..=k {
        if spike > 0 && d < spike {
            tau[d - 1] = r / (d as f64 * kf);
        } else if spike > 0 && d == spike {
            tau[d - 1] = r * (r / DELTA).ln() / kf;
        }
    }

    let mu: Vec<f64> = rho.iter().zip(tau.iter()).map(|(a, b)| a + b).collect();
    let z: f64 = mu.iter().sum();

    let mut cdf = Vec::with_capacity(k);
    let mut acc = 0.0;
    for m in &mu {
        acc += m / z;
        cdf.push(acc);
    }
    cdf
}

/// Draw one degree: smallest `d` with `u <= cdf[d]`.
pub fn sample_degree(cdf: &[f64], rng: &mut JavaRandom) -> usize {
    let u = rng.next_double();
    for (i, threshold) in cdf.iter().enumerate() {
        if u <= *threshold {
            return i + 1;
        }
    }
    cdf.len()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cdf_is_monotone_and_ends_near_one() {
        for k in [1, 2, 10, 64, 255] {
            let cdf = robust_soliton_cdf(k);
            assert_eq!(cdf.len(), k as usize);
            let mut prev = 0.0;
            for v in &cdf {
                assert!(*v >= prev);
                prev = *v;
            }
            assert!((cdf.last().unwrap() - 1.0).abs() < 1e-9, "k={k}");
        }
    }

    #[test]
    fn degenerate_for_non_positive_k() {
        assert_eq!(robust_soliton_cdf(0), vec![1.0]);
        assert_eq!(robust_soliton_cdf(-3), vec![1.0]);
    }

    #[test]
    fn degrees_stay_in_range() {
        let cdf = robust_soliton_cdf(40);
        let mut rng = JavaRandom::new(99);
        for _ in 0..10_000 {
            let d = sample_degree(&cdf, &mut rng);
            assert!((1..=40).contains(&d));
        }
    }

    #[test]
    fn sampling_is_deterministic_per_seed() {
        let cdf = robust_soliton_cdf(32);
        let mut a = JavaRandom::new(1234);
        let mut b = JavaRandom::new(1234);
        for _ in 0..100 {
            assert_eq!(sample_degree(&cdf, &mut a), sample_degree(&cdf, &mut b));
        }
    }

    #[test]
    fn low_degrees_dominate() {
        // The Robust Soliton mass concentrates at small degrees; a large
        // sample should mostly land at d <= 4.
        let cdf = robust_soliton_cdf(100);
        let mut rng = JavaRandom::new(5);
        let mut small = 0usize;
        let total = 10_000;
        for _ in 0..total {
            if sample_degree(&cdf, &mut rng) <= 4 {
                small += 1;
            }
        }
        assert!(small > total / 2, "small-degree share {small}/{total}");
    }
}

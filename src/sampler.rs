// Probabilistic input gate: forwards `a` out of every `b` frames.
//
// Deterministic rather than random — frame `i` passes iff `i mod b < a`,
// which gives an exact long-run rate and needs no RNG state.

use crate::config::SampleRatio;

pub struct Sampler {
    a: u64,
    b: u64,
    counter: u64,
}

impl Sampler {
    pub fn new(ratio: SampleRatio) -> Self {
        Self {
            a: u64::from(ratio.a),
            b: u64::from(ratio.b),
            counter: 0,
        }
    }

    /// Decide whether the next frame is forwarded. The counter resets once
    /// it reaches `a*b` to bound its magnitude; the decision pattern is
    /// unchanged because `a*b` is a multiple of `b`.
    pub fn accept(&mut self) -> bool {
        let pass = self.counter % self.b < self.a;
        self.counter += 1;
        if self.counter >= self.a.saturating_mul(self.b).max(self.b) {
            self.counter = 0;
        }
        pass
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn accepted(a: u32, b: u32, n: usize) -> usize {
        let mut s = Sampler::new(SampleRatio { a, b });
        (0..n).filter(|_| s.accept()).count()
    }

    #[test]
    fn one_to_one_forwards_everything() {
        assert_eq!(accepted(1, 1, 1000), 1000);
    }

    #[test]
    fn zero_numerator_forwards_nothing() {
        assert_eq!(accepted(0, 7, 1000), 0);
    }

    #[test]
    fn equal_ratio_forwards_everything() {
        assert_eq!(accepted(5, 5, 1000), 1000);
    }

    #[test]
    fn long_run_rate_is_exact_over_whole_periods() {
        // 10_000 frames = 100 whole periods of b=100.
        assert_eq!(accepted(1, 100, 10_000), 100);
        assert_eq!(accepted(3, 10, 10_000), 3000);
    }

    #[test]
    fn counter_reset_does_not_change_the_pattern() {
        // Collect the accept pattern across several reset boundaries and
        // check it stays periodic in b.
        let mut s = Sampler::new(SampleRatio { a: 2, b: 5 });
        let pattern: Vec<bool> = (0..50).map(|_| s.accept()).collect();
        for (i, &p) in pattern.iter().enumerate() {
            assert_eq!(p, i % 5 < 2, "frame {i}");
        }
    }
}

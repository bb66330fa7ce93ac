//! Samplers turn an output distribution (raw logits over the vocabulary) into
//! a single token id.

use std::fmt;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};

use crate::engine::TokenId;

pub trait Sampler: Send + fmt::Debug {
    /// Picks the next token. `None` when `logits` holds no usable value.
    fn sample(&mut self, logits: &[f32]) -> Option<TokenId>;
}

/// Arg-max. Exact ties go to the lowest token id; NaN logits are skipped.
#[derive(Debug, Default, Clone, Copy)]
pub struct GreedySampler;

impl Sampler for GreedySampler {
    fn sample(&mut self, logits: &[f32]) -> Option<TokenId> {
        let mut best: Option<(usize, f32)> = None;
        for (id, &logit) in logits.iter().enumerate() {
            if logit.is_nan() {
                continue;
            }
            match best {
                Some((_, top)) if logit <= top => {}
                _ => best = Some((id, logit)),
            }
        }
        best.map(|(id, _)| id as TokenId)
    }
}

/// Top-k truncation followed by a temperature softmax draw.
pub struct TemperatureSampler {
    temperature: f32,
    top_k: usize,
    rng: StdRng,
}

impl TemperatureSampler {
    /// `top_k == 0` keeps the whole vocabulary. Without a seed the generator
    /// is seeded from the thread RNG. A temperature that is not a positive
    /// finite number degenerates to arg-max.
    pub fn new(temperature: f32, top_k: usize, seed: Option<u64>) -> Self {
        let seed = seed.unwrap_or_else(rand::random::<u64>);
        Self {
            temperature,
            top_k,
            rng: StdRng::seed_from_u64(seed),
        }
    }
}

impl fmt::Debug for TemperatureSampler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TemperatureSampler")
            .field("temperature", &self.temperature)
            .field("top_k", &self.top_k)
            .finish()
    }
}

impl Sampler for TemperatureSampler {
    fn sample(&mut self, logits: &[f32]) -> Option<TokenId> {
        let mut candidates: Vec<(usize, f32)> = logits
            .iter()
            .copied()
            .enumerate()
            .filter(|(_, logit)| logit.is_finite())
            .collect();
        if candidates.is_empty() {
            return None;
        }

        // Highest first, lowest id first among equals
        candidates.sort_by(|a, b| b.1.total_cmp(&a.1).then(a.0.cmp(&b.0)));
        if self.top_k > 0 {
            candidates.truncate(self.top_k);
        }

        if !(self.temperature > 0.0 && self.temperature.is_finite()) {
            return Some(candidates[0].0 as TokenId);
        }

        let max = candidates[0].1;
        let weights: Vec<f32> = candidates
            .iter()
            .map(|(_, logit)| ((logit - max) / self.temperature).exp())
            .collect();
        let total: f32 = weights.iter().sum();

        let mut target = self.rng.random::<f32>() * total;
        for ((id, _), weight) in candidates.iter().zip(&weights) {
            if target < *weight {
                return Some(*id as TokenId);
            }
            target -= weight;
        }
        // Rounding can leave a sliver past the last bucket
        candidates.last().map(|(id, _)| *id as TokenId)
    }
}

/// Which sampler a session builds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SamplingStrategy {
    #[default]
    Greedy,
    Temperature,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SamplerConfig {
    pub strategy: SamplingStrategy,
    pub temperature: f32,
    /// Candidates kept before the draw; 0 keeps all
    pub top_k: usize,
    pub seed: Option<u64>,
}

impl Default for SamplerConfig {
    fn default() -> Self {
        Self {
            strategy: SamplingStrategy::Greedy,
            temperature: 0.8,
            top_k: 40,
            seed: None,
        }
    }
}

impl SamplerConfig {
    pub fn greedy() -> Self {
        Self::default()
    }

    /// Builds the sampler. A temperature strategy with a non-positive or
    /// non-finite temperature builds the greedy sampler.
    pub fn build(&self) -> Box<dyn Sampler> {
        match self.strategy {
            SamplingStrategy::Greedy => Box::new(GreedySampler),
            SamplingStrategy::Temperature if !(self.temperature > 0.0 && self.temperature.is_finite()) => {
                Box::new(GreedySampler)
            }
            SamplingStrategy::Temperature => {
                Box::new(TemperatureSampler::new(self.temperature, self.top_k, self.seed))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_greedy_picks_max() {
        assert_eq!(GreedySampler.sample(&[0.1, 2.5, -1.0, 0.3]), Some(1));
    }

    #[test]
    fn test_greedy_ties_go_to_lowest_id() {
        assert_eq!(GreedySampler.sample(&[0.0, 3.0, 1.0, 3.0]), Some(1));
        assert_eq!(GreedySampler.sample(&[0.0; 5]), Some(0));
    }

    #[test]
    fn test_greedy_skips_nan() {
        assert_eq!(GreedySampler.sample(&[f32::NAN, -2.0, -1.0]), Some(2));
        assert_eq!(GreedySampler.sample(&[f32::NAN]), None);
        assert_eq!(GreedySampler.sample(&[]), None);
    }

    #[test]
    fn test_temperature_top_one_is_greedy() {
        let mut sampler = TemperatureSampler::new(0.7, 1, Some(7));
        for _ in 0..10 {
            assert_eq!(sampler.sample(&[0.5, 4.0, 3.9]), Some(1));
        }
    }

    #[test]
    fn test_temperature_seeded_is_reproducible() {
        let logits = [1.0, 1.1, 0.9, 1.05];
        let mut a = TemperatureSampler::new(1.0, 0, Some(42));
        let mut b = TemperatureSampler::new(1.0, 0, Some(42));
        let draws_a: Vec<_> = (0..20).map(|_| a.sample(&logits)).collect();
        let draws_b: Vec<_> = (0..20).map(|_| b.sample(&logits)).collect();
        assert_eq!(draws_a, draws_b);
        assert!(draws_a.iter().all(|d| d.is_some()));
    }

    #[test]
    fn test_temperature_respects_top_k() {
        let mut sampler = TemperatureSampler::new(2.0, 2, Some(3));
        for _ in 0..50 {
            let id = sampler.sample(&[5.0, 0.0, 4.0, 1.0]).unwrap();
            assert!(id == 0 || id == 2);
        }
    }

    #[test]
    fn test_zero_temperature_is_arg_max() {
        let mut sampler = TemperatureSampler::new(0.0, 3, Some(1));
        assert_eq!(sampler.sample(&[5.0, 1.0, 0.0]), Some(0));
        let mut sampler = TemperatureSampler::new(-1.0, 0, Some(1));
        assert_eq!(sampler.sample(&[0.0, 2.0, 2.0]), Some(1));
        let mut sampler = TemperatureSampler::new(f32::NAN, 0, Some(1));
        assert_eq!(sampler.sample(&[0.0, 1.0, 3.0]), Some(2));
    }

    #[test]
    fn test_config_with_zero_temperature_builds_greedy() {
        let config = SamplerConfig {
            strategy: SamplingStrategy::Temperature,
            temperature: 0.0,
            ..SamplerConfig::default()
        };
        assert!(format!("{:?}", config.build()).starts_with("GreedySampler"));
        assert_eq!(config.build().sample(&[5.0, 1.0, 0.0]), Some(0));
    }

    #[test]
    fn test_config_builds_strategy() {
        let config = SamplerConfig {
            strategy: SamplingStrategy::Temperature,
            ..SamplerConfig::default()
        };
        assert!(format!("{:?}", config.build()).starts_with("TemperatureSampler"));
        assert!(format!("{:?}", SamplerConfig::greedy().build()).starts_with("GreedySampler"));
    }
}

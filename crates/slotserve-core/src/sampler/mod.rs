use serde::{Deserialize, Serialize};

use self::{
    mirostat::{MirostatParams, MirostatSampler},
    nucleus::{NucleusParams, NucleusSampler},
};

pub mod mirostat;
pub mod nucleus;

pub trait Sampler {
    /// Update the raw model output.
    fn transform(&self, output: &mut [f32]);
    /// Select one token from the distribution, and also update the state.
    fn sample(&mut self, probs: &[f32]) -> u32;
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum SamplerParams {
    Mirostat(MirostatParams),
    Nucleus(NucleusParams),
}

impl Default for SamplerParams {
    fn default() -> Self {
        Self::Nucleus(Default::default())
    }
}

impl SamplerParams {
    /// Greedy decoding: always pick the most probable token.
    pub fn greedy() -> Self {
        Self::Nucleus(NucleusParams {
            temperature: 0.0,
            ..Default::default()
        })
    }

    pub fn build(&self, seed: Option<u64>) -> Box<dyn Sampler + Send> {
        let rng = match seed {
            Some(seed) => fastrand::Rng::with_seed(seed),
            None => fastrand::Rng::new(),
        };
        match self.clone() {
            SamplerParams::Mirostat(params) => Box::new(MirostatSampler::new(params, rng)),
            SamplerParams::Nucleus(params) => Box::new(NucleusSampler::new(params, rng)),
        }
    }
}

/// Run the sampler over one row of logits.
pub fn sample_logits(sampler: &mut (dyn Sampler + Send), logits: &[f32]) -> u32 {
    let mut logits = logits.to_vec();
    sampler.transform(&mut logits);
    let probs = softmax(&logits);
    sampler.sample(&probs)
}

pub fn softmax(logits: &[f32]) -> Vec<f32> {
    let max = logits.iter().copied().fold(f32::NEG_INFINITY, f32::max);
    if !max.is_finite() {
        let uniform = 1.0 / logits.len().max(1) as f32;
        return vec![uniform; logits.len()];
    }
    let exp: Vec<f32> = logits.iter().map(|x| (x - max).exp()).collect();
    let sum: f32 = exp.iter().sum();
    exp.into_iter().map(|x| x / sum).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn softmax_sums_to_one() {
        let probs = softmax(&[1.0, 2.0, 3.0]);
        let sum: f32 = probs.iter().sum();
        assert!((sum - 1.0).abs() < 1e-5);
        assert!(probs[2] > probs[1] && probs[1] > probs[0]);
    }

    #[test]
    fn softmax_of_masked_row_is_uniform() {
        let probs = softmax(&[f32::NEG_INFINITY; 4]);
        assert_eq!(probs, vec![0.25; 4]);
    }

    #[test]
    fn greedy_picks_argmax() {
        let mut sampler = SamplerParams::greedy().build(None);
        let token = sample_logits(sampler.as_mut(), &[0.1, 5.0, 0.3, 4.9]);
        assert_eq!(token, 1);
    }

    #[test]
    fn seeded_samplers_are_reproducible() {
        let logits = [1.0, 1.1, 0.9, 1.05, 0.95];
        let params = SamplerParams::default();
        let run = |seed| {
            let mut sampler = params.build(Some(seed));
            (0..16)
                .map(|_| sample_logits(sampler.as_mut(), &logits))
                .collect::<Vec<_>>()
        };
        assert_eq!(run(7), run(7));
    }
}

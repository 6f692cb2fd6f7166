use std::collections::HashMap;

use derivative::Derivative;
use itertools::Itertools;
use serde::{Deserialize, Serialize};

use super::Sampler;

#[derive(Debug, Clone, Derivative, Serialize, Deserialize)]
#[derivative(Default)]
#[serde(default)]
pub struct NucleusParams {
    /// Keep at most this many candidates; 0 keeps all.
    #[derivative(Default(value = "0"))]
    pub top_k: usize,
    #[derivative(Default(value = "1.0"))]
    pub top_p: f32,
    /// A temperature of zero samples greedily.
    #[derivative(Default(value = "1.0"))]
    pub temperature: f32,
    #[derivative(Default(value = "0.0"))]
    pub presence_penalty: f32,
    #[derivative(Default(value = "0.0"))]
    pub frequency_penalty: f32,
    #[derivative(Default(value = "0.99654026"))]
    pub penalty_decay: f32,
}

#[derive(Debug, Default, Clone)]
pub struct NucleusState {
    pub penalties: HashMap<u32, f32>,
}

#[derive(Debug, Clone)]
pub struct NucleusSampler {
    pub params: NucleusParams,
    pub state: NucleusState,
    rng: fastrand::Rng,
}

impl NucleusSampler {
    pub fn new(params: NucleusParams, rng: fastrand::Rng) -> Self {
        Self {
            params,
            state: Default::default(),
            rng,
        }
    }

    fn penalize(&mut self, token: u32) {
        let NucleusSampler { params, state, .. } = self;
        if params.presence_penalty == 0.0 && params.frequency_penalty == 0.0 {
            return;
        }

        state
            .penalties
            .iter_mut()
            .for_each(|(_, penalty)| *penalty *= params.penalty_decay);

        let penalty = match state.penalties.get(&token) {
            Some(penalty) => penalty + params.frequency_penalty,
            None => params.presence_penalty,
        };
        state.penalties.insert(token, penalty);
    }
}

impl Sampler for NucleusSampler {
    fn transform(&self, output: &mut [f32]) {
        for (token, penalty) in &self.state.penalties {
            if let Some(x) = output.get_mut(*token as usize) {
                *x -= penalty;
            }
        }
    }

    fn sample(&mut self, probs: &[f32]) -> u32 {
        if self.params.temperature <= 0.0 {
            let token = probs
                .iter()
                .position_max_by(|x, y| x.total_cmp(y))
                .unwrap_or_default() as u32;
            self.penalize(token);
            return token;
        }

        let NucleusSampler { params, rng, .. } = self;
        let top_k = match params.top_k {
            0 => probs.len(),
            k => k,
        };

        let sorted = probs
            .iter()
            .enumerate()
            .sorted_unstable_by(|(_, x), (_, y)| x.total_cmp(y).reverse())
            .take(top_k)
            .scan((0, 0.0, 0.0), |(_, cum, _), (id, x)| {
                if *cum > params.top_p {
                    None
                } else {
                    *cum += x;
                    Some((id, *cum, *x))
                }
            })
            .map(|(id, _, x)| (id, x.powf(1.0 / params.temperature)))
            .collect_vec();

        let sum: f32 = sorted.iter().map(|(_, x)| x).sum();
        let sorted = sorted
            .into_iter()
            .map(|(id, x)| (id, x / sum))
            .scan((0, 0.0), |(_, cum), (id, x)| {
                *cum += x;
                Some((id, *cum))
            })
            .collect_vec();

        let rand = rng.f32();
        let token = sorted
            .into_iter()
            .find_or_first(|&(_, cum)| rand <= cum)
            .map(|(id, _)| id)
            .unwrap_or_default();
        let token = token as u32;

        self.penalize(token);
        token
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sampler::softmax;

    #[test]
    fn top_k_one_is_greedy() {
        let params = NucleusParams {
            top_k: 1,
            ..Default::default()
        };
        let mut sampler = NucleusSampler::new(params, fastrand::Rng::with_seed(1));
        let probs = softmax(&[0.0, 0.5, 3.0, 0.2]);
        for _ in 0..8 {
            assert_eq!(sampler.sample(&probs), 2);
        }
    }

    #[test]
    fn presence_penalty_discourages_repeats() {
        let params = NucleusParams {
            temperature: 0.0,
            presence_penalty: 10.0,
            ..Default::default()
        };
        let mut sampler = NucleusSampler::new(params, fastrand::Rng::with_seed(1));
        let logits = [1.0, 1.5, 0.0];

        let mut first = logits;
        sampler.transform(&mut first);
        assert_eq!(sampler.sample(&softmax(&first)), 1);

        let mut second = logits;
        sampler.transform(&mut second);
        assert_eq!(sampler.sample(&softmax(&second)), 0);
    }

    #[test]
    fn penalties_outside_the_row_are_ignored() {
        let mut sampler = NucleusSampler::new(Default::default(), fastrand::Rng::with_seed(1));
        sampler.state.penalties.insert(1, 0.5);
        sampler.state.penalties.insert(7, 9.0);

        let mut output = [1.0, 1.0, 1.0];
        sampler.transform(&mut output);
        assert_eq!(output, [1.0, 0.5, 1.0]);
    }
}

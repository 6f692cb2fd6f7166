use derivative::Derivative;
use itertools::Itertools;
use serde::{Deserialize, Serialize};

use super::Sampler;

#[derive(Debug, Clone, Derivative, Serialize, Deserialize)]
#[derivative(Default)]
#[serde(default)]
pub struct MirostatParams {
    #[derivative(Default(value = "3.0"))]
    pub tau: f32,
    #[derivative(Default(value = "0.1"))]
    #[serde(alias = "learning_rate")]
    pub rate: f32,
}

#[derive(Debug, Clone, Default)]
pub struct MirostatState {
    pub max_surprise: f32,
}

#[derive(Debug, Clone)]
pub struct MirostatSampler {
    pub params: MirostatParams,
    pub state: MirostatState,
    rng: fastrand::Rng,
}

impl MirostatSampler {
    pub fn new(params: MirostatParams, rng: fastrand::Rng) -> Self {
        let state = MirostatState {
            max_surprise: params.tau * 2.0,
        };
        Self { params, state, rng }
    }
}

impl Sampler for MirostatSampler {
    fn transform(&self, _output: &mut [f32]) {}

    fn sample(&mut self, probs: &[f32]) -> u32 {
        let MirostatSampler { params, state, rng } = self;

        // sort the surprise values and truncate
        let sorted = probs
            .iter()
            .copied()
            .enumerate()
            .sorted_unstable_by(|(_, x), (_, y)| x.total_cmp(y).reverse())
            .scan((0, 0.0, 0.0), |(_, cum, _), (id, x)| {
                *cum += x;
                Some((id, *cum, x))
            })
            .collect_vec();
        let k = sorted
            .iter()
            .find_position(|&(_, _, x)| -x.log2() > state.max_surprise)
            .map(|(k, _)| k + 1)
            .unwrap_or(sorted.len());
        let sorted = sorted.into_iter().take(k).collect_vec();

        // normalize the probs
        let Some(sum) = sorted.last().map(|(_, x, _)| *x) else {
            return 0;
        };
        let rand = rng.f32() * sum;
        let Some((token, _, prob)) = sorted
            .into_iter()
            .find_or_first(|&(_, cum, _)| rand <= cum)
        else {
            return 0;
        };

        let token_surprise = sum.log2() - prob.log2();
        let error_surprise = token_surprise - params.tau;
        state.max_surprise -= params.rate * error_surprise;
        state.max_surprise = state.max_surprise.min(4.0 * params.tau);

        token as u32
    }
}

//! The [`StandardSampler`], an ordered chain of token selection stages.

use std::cmp::Ordering;
use std::collections::HashMap;

use derive_more::{Deref, DerefMut};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crate::{ClientParams, Sampler, Token};

/// A candidate token with its logit and, once normalised, its probability.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct TokenData {
    /// The token.
    pub id: Token,
    /// The raw (possibly adjusted) logit.
    pub logit: f32,
    /// The probability, valid after a softmax.
    pub p: f32,
}

/// The candidate list a [`Sampler`] chooses from.
#[derive(Clone, Debug, Default, Deref, DerefMut)]
pub struct Candidates {
    #[deref]
    #[deref_mut]
    data: Vec<TokenData>,
    sorted: bool,
}

impl Candidates {
    /// Builds the candidate list from raw logits, indexed by token id.
    pub fn from_logits(logits: &[f32]) -> Self {
        Self {
            data: logits
                .iter()
                .enumerate()
                .map(|(id, &logit)| TokenData {
                    id: Token(id as i32),
                    logit,
                    p: 0.0,
                })
                .collect(),
            sorted: false,
        }
    }

    fn sort_by_logit(&mut self) {
        if !self.sorted {
            self.data
                .sort_by(|a, b| b.logit.partial_cmp(&a.logit).unwrap_or(Ordering::Equal));
            self.sorted = true;
        }
    }

    /// Sorts by descending logit and computes probabilities.
    pub fn softmax(&mut self) {
        self.sort_by_logit();

        let Some(max) = self.data.first().map(|d| d.logit) else {
            return;
        };

        let mut sum = 0.0;
        for d in self.data.iter_mut() {
            d.p = (d.logit - max).exp();
            sum += d.p;
        }
        for d in self.data.iter_mut() {
            d.p /= sum;
        }
    }

    fn truncate(&mut self, len: usize) {
        self.data.truncate(len.max(1));
    }

    /// The candidate with the highest logit.
    pub fn greedy(&self) -> Option<Token> {
        self.data
            .iter()
            .max_by(|a, b| a.logit.partial_cmp(&b.logit).unwrap_or(Ordering::Equal))
            .map(|d| d.id)
    }
}

/// One stage of a [`StandardSampler`] chain.
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum SamplerStage {
    /// Penalises tokens that appeared in the last `last_n` committed tokens.
    Penalties {
        /// last n tokens to penalize (0 = disabled)
        last_n: usize,
        /// 1.0 = disabled
        repeat: f32,
        /// 0.0 = disabled
        frequency: f32,
        /// 0.0 = disabled
        presence: f32,
    },

    /// Keeps the `k` most likely tokens (0 = disabled).
    TopK(usize),

    /// Locally typical sampling (1.0 = disabled).
    TypicalP(f32),

    /// Nucleus sampling (1.0 = disabled).
    TopP(f32),

    /// Drops tokens less likely than `p` times the most likely one (0.0 = disabled).
    MinP(f32),

    /// Divides logits by the temperature (1.0 = disabled).
    Temperature(f32),
}

impl SamplerStage {
    fn apply(&self, history: &[Token], candidates: &mut Candidates, min_keep: usize) {
        match *self {
            SamplerStage::Penalties {
                last_n,
                repeat,
                frequency,
                presence,
            } => penalties(history, candidates, last_n, repeat, frequency, presence),
            SamplerStage::TopK(k) => top_k(candidates, k, min_keep),
            SamplerStage::TypicalP(p) => typical(candidates, p, min_keep),
            SamplerStage::TopP(p) => top_p(candidates, p, min_keep),
            SamplerStage::MinP(p) => min_p(candidates, p, min_keep),
            SamplerStage::Temperature(t) => {
                if t > 0.0 && t != 1.0 {
                    for d in candidates.iter_mut() {
                        d.logit /= t;
                    }
                }
            }
        }
    }
}

/// The default [`Sampler`]: runs every [`SamplerStage`] in order, then draws a token from the
/// remaining distribution with a seeded random number generator.
///
/// With a temperature of zero (or below) the final draw is replaced by picking the most likely
/// token.
#[derive(Clone, Debug)]
pub struct StandardSampler {
    stages: Vec<SamplerStage>,
    greedy: bool,
    min_keep: usize,
    rng: StdRng,
}

impl StandardSampler {
    /// Creates a sampler running `stages` in order before a random draw.
    pub fn new(stages: Vec<SamplerStage>, seed: Option<u64>) -> Self {
        let rng = match seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };

        Self {
            stages,
            greedy: false,
            min_keep: 1,
            rng,
        }
    }

    /// Creates a sampler which always picks the most likely token.
    pub fn new_greedy() -> Self {
        let mut sampler = Self::new(Vec::new(), Some(0));
        sampler.greedy = true;
        sampler
    }

    /// Builds the chain configured by `params`: penalties, top-k, typical-p, top-p, min-p,
    /// temperature, then the final draw.
    pub fn from_params(params: &ClientParams) -> Self {
        let stages = vec![
            SamplerStage::Penalties {
                last_n: params.penalty_last_n,
                repeat: params.penalty_repeat,
                frequency: params.penalty_frequency,
                presence: params.penalty_present,
            },
            SamplerStage::TopK(params.top_k),
            SamplerStage::TypicalP(params.typical_p),
            SamplerStage::TopP(params.top_p),
            SamplerStage::MinP(params.min_p),
            SamplerStage::Temperature(params.temperature),
        ];

        let mut sampler = Self::new(stages, params.seed);
        sampler.greedy = params.temperature <= 0.0;
        sampler
    }

    /// The stages, in the order they run.
    pub fn stages(&self) -> &[SamplerStage] {
        &self.stages
    }

    fn draw(&mut self, candidates: &mut Candidates) -> Option<Token> {
        candidates.softmax();

        let target: f32 = self.rng.gen();
        let mut cumulative = 0.0;
        for d in candidates.iter() {
            cumulative += d.p;
            if target < cumulative {
                return Some(d.id);
            }
        }

        // rounding left the cumulative sum just below `target`
        candidates.last().map(|d| d.id)
    }
}

impl Default for StandardSampler {
    fn default() -> Self {
        Self::from_params(&ClientParams::default())
    }
}

impl Sampler for StandardSampler {
    fn sample(&mut self, history: &[Token], candidates: &mut Candidates) -> Token {
        if self.greedy {
            for stage in &self.stages {
                if let SamplerStage::Penalties { .. } = stage {
                    stage.apply(history, candidates, self.min_keep);
                }
            }
            return candidates.greedy().unwrap_or(Token(0));
        }

        for stage in &self.stages {
            stage.apply(history, candidates, self.min_keep);
        }

        self.draw(candidates).unwrap_or(Token(0))
    }
}

fn penalties(
    history: &[Token],
    candidates: &mut Candidates,
    last_n: usize,
    repeat: f32,
    frequency: f32,
    presence: f32,
) {
    if last_n == 0 || (repeat == 1.0 && frequency == 0.0 && presence == 0.0) {
        return;
    }

    let window = &history[history.len().saturating_sub(last_n)..];
    let mut counts: HashMap<Token, usize> = HashMap::new();
    for token in window {
        *counts.entry(*token).or_default() += 1;
    }

    for d in candidates.iter_mut() {
        let Some(&count) = counts.get(&d.id) else {
            continue;
        };

        if d.logit <= 0.0 {
            d.logit *= repeat;
        } else {
            d.logit /= repeat;
        }

        d.logit -= count as f32 * frequency + presence;
    }

    candidates.sorted = false;
}

fn top_k(candidates: &mut Candidates, k: usize, min_keep: usize) {
    if k == 0 {
        return;
    }

    let k = k.max(min_keep).min(candidates.len());
    candidates.sort_by_logit();
    candidates.truncate(k);
}

fn top_p(candidates: &mut Candidates, p: f32, min_keep: usize) {
    if p >= 1.0 {
        return;
    }

    candidates.softmax();

    let mut cumulative = 0.0;
    let mut last = candidates.len();
    for (i, d) in candidates.iter().enumerate() {
        cumulative += d.p;
        if cumulative >= p && i + 1 >= min_keep {
            last = i + 1;
            break;
        }
    }

    candidates.truncate(last);
}

fn min_p(candidates: &mut Candidates, p: f32, min_keep: usize) {
    if p <= 0.0 || candidates.is_empty() {
        return;
    }

    candidates.softmax();

    let threshold = candidates[0].p * p;
    let keep = candidates
        .iter()
        .enumerate()
        .take_while(|(i, d)| d.p >= threshold || *i < min_keep)
        .count();

    candidates.truncate(keep);
}

fn typical(candidates: &mut Candidates, p: f32, min_keep: usize) {
    if p >= 1.0 || candidates.is_empty() {
        return;
    }

    candidates.softmax();

    let entropy: f32 = candidates
        .iter()
        .filter(|d| d.p > 0.0)
        .map(|d| -d.p * d.p.ln())
        .sum();

    let mut shifted: Vec<(f32, TokenData)> = candidates
        .iter()
        .map(|d| ((-d.p.ln() - entropy).abs(), *d))
        .collect();
    shifted.sort_by(|a, b| a.0.partial_cmp(&b.0).unwrap_or(Ordering::Equal));

    let mut cumulative = 0.0;
    let mut last = shifted.len();
    for (i, (_, d)) in shifted.iter().enumerate() {
        cumulative += d.p;
        if cumulative > p && i + 1 >= min_keep {
            last = i + 1;
            break;
        }
    }

    candidates.data = shifted.into_iter().take(last).map(|(_, d)| d).collect();
    candidates.sorted = false;
    candidates.sort_by_logit();
}

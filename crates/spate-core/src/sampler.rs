//! Logits-to-token pipeline. Per row: logit bias, repetition / frequency /
//! presence penalties over the sequence history, then temperature, top-k,
//! top-p, and a multinomial draw. Greedy rows short-circuit after the
//! penalties. Fully deterministic for a seeded RNG.

use std::collections::HashMap;

use rand::rngs::StdRng;
use rand::Rng;
use spate_engine::TokenId;

use crate::sequence::SamplingParams;

#[derive(Debug, Clone, Copy)]
pub struct Sampled {
    pub token: TokenId,
    pub logprob: f32,
}

/// Sample the next token for one sequence from its logits row. `history`
/// counts every token already in the sequence, prompt included.
pub fn sample_row(
    logits: &[f32],
    params: &SamplingParams,
    history: &HashMap<TokenId, u32>,
    rng: &mut StdRng,
) -> Sampled {
    let mut row = logits.to_vec();
    apply_logit_bias(&mut row, params);
    apply_penalties(&mut row, params, history);

    if params.temperature == 0.0 {
        return greedy(&row);
    }
    for l in &mut row {
        if l.is_finite() {
            *l /= params.temperature;
        }
    }

    // Sort once, descending by logit with ties to the smaller id; top-k and
    // top-p are both prefixes of this order.
    let mut pairs: Vec<(usize, f32)> = row
        .iter()
        .enumerate()
        .filter(|(_, l)| l.is_finite())
        .map(|(i, &l)| (i, l))
        .collect();
    if pairs.is_empty() {
        tracing::warn!("all logits masked; sampling token 0");
        return Sampled { token: 0, logprob: f32::NEG_INFINITY };
    }
    pairs.sort_by(|a, b| {
        b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal).then(a.0.cmp(&b.0))
    });
    if params.top_k > 0 {
        pairs.truncate(params.top_k);
    }

    let mut probs = softmax(&pairs);
    if params.top_p < 1.0 {
        let mut mass = 0.0_f32;
        let mut keep = 0;
        for &(_, p) in &probs {
            mass += p;
            keep += 1;
            if mass >= params.top_p {
                break;
            }
        }
        probs.truncate(keep);
        let z: f32 = probs.iter().map(|&(_, p)| p).sum();
        for p in &mut probs {
            p.1 /= z.max(1e-9);
        }
    }

    let r: f32 = rng.gen();
    let mut acc = 0.0_f32;
    for &(i, p) in &probs {
        acc += p;
        if r <= acc {
            return Sampled { token: i as TokenId, logprob: p.ln() };
        }
    }
    let (i, p) = probs[probs.len() - 1];
    Sampled { token: i as TokenId, logprob: p.ln() }
}

fn apply_logit_bias(row: &mut [f32], params: &SamplingParams) {
    for (&token, &bias) in &params.logit_bias {
        if let Some(l) = row.get_mut(token as usize) {
            *l += bias;
        }
    }
}

fn apply_penalties(row: &mut [f32], params: &SamplingParams, history: &HashMap<TokenId, u32>) {
    let rep = params.repetition_penalty;
    let apply_rep = rep != 1.0 && rep > 0.0;
    for (&token, &count) in history {
        if count == 0 {
            continue;
        }
        let Some(l) = row.get_mut(token as usize) else { continue };
        if !l.is_finite() {
            continue;
        }
        if apply_rep {
            *l = if *l > 0.0 { *l / rep } else { *l * rep };
        }
        *l -= params.frequency_penalty * count as f32;
        *l -= params.presence_penalty;
    }
}

/// Argmax with ties broken toward the smaller token id; the logprob is the
/// log-softmax of the post-penalty row at that id.
fn greedy(row: &[f32]) -> Sampled {
    let mut best = 0usize;
    let mut best_logit = f32::NEG_INFINITY;
    for (i, &l) in row.iter().enumerate() {
        if l > best_logit {
            best = i;
            best_logit = l;
        }
    }
    if best_logit == f32::NEG_INFINITY {
        tracing::warn!("all logits masked; sampling token 0");
        return Sampled { token: 0, logprob: f32::NEG_INFINITY };
    }
    Sampled { token: best as TokenId, logprob: best_logit - log_sum_exp(row) }
}

fn log_sum_exp(row: &[f32]) -> f32 {
    let max = row.iter().copied().filter(|l| l.is_finite()).fold(f32::NEG_INFINITY, f32::max);
    if max == f32::NEG_INFINITY {
        return f32::NEG_INFINITY;
    }
    let sum: f32 = row.iter().filter(|l| l.is_finite()).map(|&l| (l - max).exp()).sum();
    max + sum.ln()
}

/// Softmax over the sorted finite pairs, numerically stabilized by the max
/// (the first element).
fn softmax(pairs: &[(usize, f32)]) -> Vec<(usize, f32)> {
    let max = pairs[0].1;
    let mut out: Vec<(usize, f32)> = pairs.iter().map(|&(i, l)| (i, (l - max).exp())).collect();
    let z: f32 = out.iter().map(|&(_, p)| p).sum();
    for p in &mut out {
        p.1 /= z.max(1e-9);
    }
    out
}

//! Randomness string grammar (spec §4.4): `greedy | random(:param)*` where
//! each `param` is one of `top-p=F`, `top-k=N`, `seed=N`.
//!
//! No teacher analog (the teacher's sampler config is a flat struct read
//! straight from `assets/config.json`, grounding `mlx::registry` instead);
//! this is a fresh small recursive-descent-by-`split(':')` parser in the
//! same "reject, don't guess" error style the rest of this crate uses.

use crate::error::{AfmError, AfmResult};
use crate::types::{ChatCompletionRequest, RandomnessConfig, RandomnessMode};

/// Parse a CLI/config randomness string into the tagged-variant config.
pub fn parse(spec: &str) -> AfmResult<RandomnessConfig> {
    let mut parts = spec.split(':');
    let head = parts.next().unwrap_or("").trim();

    match head {
        "greedy" => {
            if parts.next().is_some() {
                return Err(AfmError::InvalidRandomness(format!(
                    "\"greedy\" takes no parameters: {spec}"
                )));
            }
            Ok(RandomnessConfig {
                mode: RandomnessMode::Greedy,
                seed: None,
            })
        }
        "random" => parse_random_params(parts, spec),
        other => Err(AfmError::InvalidRandomness(format!(
            "unknown randomness mode \"{other}\" in {spec}"
        ))),
    }
}

fn parse_random_params<'a>(
    params: impl Iterator<Item = &'a str>,
    original: &str,
) -> AfmResult<RandomnessConfig> {
    let mut top_p: Option<f32> = None;
    let mut top_k: Option<u32> = None;
    let mut seed: Option<u64> = None;

    for param in params {
        let param = param.trim();
        if param.is_empty() {
            continue;
        }
        let (key, value) = param.split_once('=').ok_or_else(|| {
            AfmError::InvalidRandomness(format!("malformed parameter \"{param}\" in {original}"))
        })?;
        match key {
            "top-p" => {
                top_p = Some(value.parse::<f32>().map_err(|_| {
                    AfmError::InvalidRandomness(format!("invalid top-p value in {original}"))
                })?);
            }
            "top-k" => {
                top_k = Some(value.parse::<u32>().map_err(|_| {
                    AfmError::InvalidRandomness(format!("invalid top-k value in {original}"))
                })?);
            }
            "seed" => {
                seed = Some(value.parse::<u64>().map_err(|_| {
                    AfmError::InvalidRandomness(format!("invalid seed value in {original}"))
                })?);
            }
            other => {
                return Err(AfmError::InvalidRandomness(format!(
                    "unknown parameter \"{other}\" in {original}"
                )))
            }
        }
    }

    if top_p.is_some() && top_k.is_some() {
        return Err(AfmError::InvalidRandomness(format!(
            "top-p and top-k are mutually exclusive: {original}"
        )));
    }

    let mode = match (top_p, top_k) {
        (Some(p), None) => RandomnessMode::TopP(p),
        (None, Some(k)) => RandomnessMode::TopK(k),
        (None, None) => RandomnessMode::Random,
        (Some(_), Some(_)) => unreachable!("checked above"),
    };

    Ok(RandomnessConfig { mode, seed })
}

/// Derive a randomness config straight from an already-validated chat
/// request's OpenAI sampling fields (conflict already rejected upstream in
/// `mlx::generation::validate_randomness`).
pub fn from_request(request: &ChatCompletionRequest) -> RandomnessConfig {
    let mode = match (request.top_p, request.top_k) {
        (Some(p), _) => RandomnessMode::TopP(p),
        (None, Some(k)) => RandomnessMode::TopK(k),
        (None, None) if request.temperature == Some(0.0) => RandomnessMode::Greedy,
        (None, None) => RandomnessMode::Random,
    };
    RandomnessConfig {
        mode,
        seed: request.seed,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scenario_s3_valid_randomness_string() {
        let config = parse("random:top-p=0.9:seed=42").unwrap();
        assert_eq!(config.mode, RandomnessMode::TopP(0.9));
        assert_eq!(config.seed, Some(42));
    }

    #[test]
    fn scenario_s3_conflicting_randomness_string_rejected() {
        let err = parse("random:top-p=0.9:top-k=50").unwrap_err();
        match err {
            AfmError::InvalidRandomness(msg) => assert!(msg.contains("mutually exclusive")),
            other => panic!("expected InvalidRandomness, got {other:?}"),
        }
    }

    #[test]
    fn greedy_with_no_params() {
        let config = parse("greedy").unwrap();
        assert_eq!(config.mode, RandomnessMode::Greedy);
        assert_eq!(config.seed, None);
    }

    #[test]
    fn greedy_rejects_parameters() {
        assert!(parse("greedy:seed=1").is_err());
    }

    #[test]
    fn bare_random_with_no_params_is_plain_random() {
        let config = parse("random").unwrap();
        assert_eq!(config.mode, RandomnessMode::Random);
    }

    #[test]
    fn unknown_mode_is_rejected() {
        assert!(parse("banana").is_err());
    }

    #[test]
    fn unknown_parameter_is_rejected() {
        assert!(parse("random:frobnicate=1").is_err());
    }

    #[test]
    fn malformed_parameter_is_rejected() {
        assert!(parse("random:top-p").is_err());
    }
}

//! Implements [`ClientParams`], which configures a [`crate::Client`]

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::{ChatFormat, LlmError};

/// Parameters for a [`crate::Client`].
///
/// These can be deserialized from any `serde` format; missing fields take their default value.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientParams {
    /// number of positions in the key/value cache
    pub context_length: usize,

    /// maximum number of tokens decoded in one backend call
    pub batch_size: usize,

    /// number of threads to use for generation
    pub threads: usize,

    /// seed for the final random draw; `None` to seed from entropy
    pub seed: Option<u64>,

    /// <= 0.0 to always pick the most likely token
    pub temperature: f32,

    /// 0 = disabled
    pub top_k: usize,

    /// 1.0 = disabled
    pub top_p: f32,

    /// 0.0 = disabled
    pub min_p: f32,

    /// 1.0 = disabled
    pub typical_p: f32,

    /// last n tokens to penalize (0 = disabled)
    pub penalty_last_n: usize,

    /// 1.0 = disabled
    pub penalty_repeat: f32,

    /// 0.0 = disabled
    pub penalty_frequency: f32,

    /// 0.0 = disabled
    pub penalty_present: f32,

    /// Additional strings which end generation when a token decodes to exactly one of them.
    pub extra_eos_tokens: Vec<String>,

    /// The chat format used to render messages; detected from the backend if `None`.
    pub chat_format: Option<ChatFormat>,

    /// The vision projector to load alongside the model, if any.
    pub vision_projector: Option<PathBuf>,

    /// Whether control tokens written in plain prompts are parsed as control tokens.
    pub parse_special: bool,
}

impl Default for ClientParams {
    fn default() -> Self {
        let threads = num_cpus::get_physical().saturating_sub(1).max(1);

        Self {
            context_length: 2048,
            batch_size: 512,
            threads,
            seed: None,
            temperature: 0.8,
            top_k: 40,
            top_p: 0.95,
            min_p: 0.05,
            typical_p: 1.0,
            penalty_last_n: 64,
            penalty_repeat: 1.1,
            penalty_frequency: 0.0,
            penalty_present: 0.0,
            extra_eos_tokens: Vec::new(),
            chat_format: None,
            vision_projector: None,
            parse_special: true,
        }
    }
}

impl ClientParams {
    /// Checks that every parameter is within its valid range.
    pub fn validate(&self) -> Result<(), LlmError> {
        fn invalid(reason: String) -> Result<(), LlmError> {
            Err(LlmError::InvalidParameter(reason))
        }

        if self.context_length == 0 {
            return invalid("context_length must be greater than zero".into());
        }
        if self.batch_size == 0 {
            return invalid("batch_size must be greater than zero".into());
        }
        if self.batch_size > self.context_length {
            return invalid(format!(
                "batch_size ({}) cannot exceed context_length ({})",
                self.batch_size, self.context_length
            ));
        }
        if self.threads == 0 {
            return invalid("threads must be greater than zero".into());
        }
        if !self.temperature.is_finite() || self.temperature < 0.0 {
            return invalid(format!("temperature must be >= 0, got {}", self.temperature));
        }
        if !(self.top_p > 0.0 && self.top_p <= 1.0) {
            return invalid(format!("top_p must be in (0, 1], got {}", self.top_p));
        }
        if !(self.typical_p > 0.0 && self.typical_p <= 1.0) {
            return invalid(format!("typical_p must be in (0, 1], got {}", self.typical_p));
        }
        if !(0.0..=1.0).contains(&self.min_p) {
            return invalid(format!("min_p must be in [0, 1], got {}", self.min_p));
        }
        if self.penalty_repeat <= 0.0 {
            return invalid(format!(
                "penalty_repeat must be > 0, got {}",
                self.penalty_repeat
            ));
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        let params = ClientParams::default();

        assert!(params.validate().is_ok());
        assert!(params.threads >= 1);
        assert_eq!(params.context_length, 2048);
        assert_eq!(params.batch_size, 512);
    }

    #[test]
    fn rejects_out_of_range_values() {
        let cases = [
            ClientParams {
                context_length: 0,
                ..Default::default()
            },
            ClientParams {
                batch_size: 4096,
                ..Default::default()
            },
            ClientParams {
                temperature: -1.0,
                ..Default::default()
            },
            ClientParams {
                top_p: 0.0,
                ..Default::default()
            },
            ClientParams {
                typical_p: 1.5,
                ..Default::default()
            },
            ClientParams {
                penalty_repeat: 0.0,
                ..Default::default()
            },
        ];

        for params in cases {
            assert!(
                matches!(params.validate(), Err(LlmError::InvalidParameter(_))),
                "{params:?} should be rejected"
            );
        }
    }

    #[test]
    fn missing_fields_take_defaults() {
        let params: ClientParams =
            serde_json::from_str(r#"{ "context_length": 4096, "temperature": 0.0 }"#).unwrap();

        assert_eq!(params.context_length, 4096);
        assert_eq!(params.temperature, 0.0);
        assert_eq!(params.top_k, 40);
    }
}

use serde::{ Deserialize, Serialize };
use std::ops::RangeInclusive;
use thiserror::Error;

pub const MAX_TOKENS_RANGE: RangeInclusive<u32> = 1..=2048;
pub const TEMPERATURE_RANGE: RangeInclusive<f32> = 0.1..=4.0;
pub const TOP_P_RANGE: RangeInclusive<f32> = 0.1..=1.0;

/// Sampling settings forwarded verbatim to the inference endpoint.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct GenerationParameters {
    pub max_tokens: u32,
    pub temperature: f32,
    pub top_p: f32,
}

impl Default for GenerationParameters {
    fn default() -> Self {
        Self {
            max_tokens: 512,
            temperature: 0.7,
            top_p: 0.95,
        }
    }
}

/// Client-supplied settings. Any field left out takes the server's default.
#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ParameterOverrides {
    pub max_tokens: Option<u32>,
    pub temperature: Option<f32>,
    pub top_p: Option<f32>,
}

impl ParameterOverrides {
    pub fn apply(self, defaults: GenerationParameters) -> GenerationParameters {
        GenerationParameters {
            max_tokens: self.max_tokens.unwrap_or(defaults.max_tokens),
            temperature: self.temperature.unwrap_or(defaults.temperature),
            top_p: self.top_p.unwrap_or(defaults.top_p),
        }
    }
}

#[derive(Debug, Error, PartialEq)]
pub enum ParameterError {
    #[error("max_tokens must be between {} and {}, got {0}", MAX_TOKENS_RANGE.start(), MAX_TOKENS_RANGE.end())]
    MaxTokens(u32),
    #[error("temperature must be between {} and {}, got {0}", TEMPERATURE_RANGE.start(), TEMPERATURE_RANGE.end())]
    Temperature(f32),
    #[error("top_p must be between {} and {}, got {0}", TOP_P_RANGE.start(), TOP_P_RANGE.end())]
    TopP(f32),
}

impl GenerationParameters {
    /// Checks the values against the ranges the chat controls allow.
    /// The relay never calls this; it is applied where client input enters.
    pub fn validate(&self) -> Result<(), ParameterError> {
        if !MAX_TOKENS_RANGE.contains(&self.max_tokens) {
            return Err(ParameterError::MaxTokens(self.max_tokens));
        }
        if !TEMPERATURE_RANGE.contains(&self.temperature) {
            return Err(ParameterError::Temperature(self.temperature));
        }
        if !TOP_P_RANGE.contains(&self.top_p) {
            return Err(ParameterError::TopP(self.top_p));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ParameterRanges {
    pub max_tokens: [u32; 2],
    pub temperature: [f32; 2],
    pub top_p: [f32; 2],
}

impl ParameterRanges {
    pub fn current() -> Self {
        Self {
            max_tokens: [*MAX_TOKENS_RANGE.start(), *MAX_TOKENS_RANGE.end()],
            temperature: [*TEMPERATURE_RANGE.start(), *TEMPERATURE_RANGE.end()],
            top_p: [*TOP_P_RANGE.start(), *TOP_P_RANGE.end()],
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_within_ranges() {
        assert_eq!(GenerationParameters::default().validate(), Ok(()));
    }

    #[test]
    fn rejects_out_of_range_values() {
        let mut params = GenerationParameters::default();
        params.max_tokens = 0;
        assert_eq!(params.validate(), Err(ParameterError::MaxTokens(0)));

        let mut params = GenerationParameters::default();
        params.temperature = 4.5;
        assert_eq!(params.validate(), Err(ParameterError::Temperature(4.5)));

        let mut params = GenerationParameters::default();
        params.top_p = 0.0;
        assert!(matches!(params.validate(), Err(ParameterError::TopP(_))));
    }

    #[test]
    fn partial_overrides_fall_back_to_server_defaults() {
        let overrides: ParameterOverrides = serde_json::from_str(r#"{"temperature": 1.2}"#).unwrap();
        let defaults = GenerationParameters { max_tokens: 256, temperature: 0.7, top_p: 0.8 };

        assert_eq!(
            overrides.apply(defaults),
            GenerationParameters { max_tokens: 256, temperature: 1.2, top_p: 0.8 }
        );

        let empty: ParameterOverrides = serde_json::from_str("{}").unwrap();
        assert_eq!(empty.apply(defaults), defaults);
    }
}

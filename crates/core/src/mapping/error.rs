use thiserror::Error;

#[derive(Error, Debug)]
pub enum MappingError {
    #[error("invalid mapping pattern '{pattern}': {source}")]
    InvalidPattern {
        pattern: String,
        #[source]
        source: regex::Error,
    },

    #[error("checkpoint key '{key}' matches multiple mapping rules: '{first}' and '{second}'")]
    OverlappingRules {
        key: String,
        first: String,
        second: String,
    },

    #[error("cannot resolve LoRA adapter for '{module}': {detail}")]
    AdapterResolution { module: String, detail: String },

    #[error("mapped state is missing required keys: {keys:?}")]
    MissingKeys { keys: Vec<String> },

    #[error("mapped state contains unexpected keys: {keys:?}")]
    UnexpectedKeys { keys: Vec<String> },

    #[error("transpose rule '{pattern}' has invalid permutation {permutation:?} for rank-{rank} tensor '{key}'")]
    InvalidPermutation {
        pattern: String,
        permutation: Vec<usize>,
        rank: usize,
        key: String,
    },

    #[error(transparent)]
    Candle(#[from] candle_core::Error),
}

/// Errors raised while parsing a route pattern or expanding it with parameters.
#[derive(Debug, thiserror::Error)]
pub enum PatternError {
    #[error("route pattern must start with '/': {0:?}")]
    MissingLeadingSlash(String),

    #[error("unbalanced brackets in segment {segment:?} of {pattern:?}")]
    UnbalancedBracket { pattern: String, segment: String },

    #[error("invalid parameter name {name:?} in {pattern:?}")]
    InvalidParamName { pattern: String, name: String },

    #[error("parameter {name:?} declared twice in {pattern:?}")]
    DuplicateParam { pattern: String, name: String },

    #[error("catch-all parameter {name:?} must be the last segment of {pattern:?}")]
    CatchAllNotLast { pattern: String, name: String },

    #[error("missing value for parameter {name:?} of {pattern:?}")]
    MissingParam { pattern: String, name: String },

    #[error("invalid value for parameter {name:?}: {reason}")]
    InvalidParamValue { name: String, reason: String },

    #[error("failed to compile route pattern: {0}")]
    Regex(#[from] regex::Error),
}

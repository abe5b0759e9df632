//! Error types for gantry.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    // Graph errors
    #[error("Edge references unknown node: {0}")]
    UnknownNode(String),

    #[error("Unknown root label for transitive closure: {0}")]
    UnknownRoot(String),

    #[error("Dependency cycle detected among: {0:?}")]
    CycleDetected(Vec<String>),

    // Job graph errors
    #[error("Job table does not match graph nodes: {0}")]
    NodeMismatch(String),

    #[error("Duplicate job label: {0}")]
    DuplicateLabel(String),

    #[error("Job {label} depends on unknown job {dependency} (as {dep_name})")]
    UnknownDependency {
        label: String,
        dep_name: String,
        dependency: String,
    },

    // Keyed-by errors
    #[error("Keyed-by '{attribute}' unnecessary with only value 'default' found, when determining {item}")]
    KeyedByPointless { attribute: String, item: String },

    #[error("No attribute '{attribute}' and no value for 'default' found while determining {item}")]
    KeyedByMissingAttribute { attribute: String, item: String },

    #[error("Multiple matching values for '{attribute}' {key:?} found while determining {item}")]
    KeyedByAmbiguous {
        attribute: String,
        key: String,
        item: String,
    },

    #[error("No '{attribute}' matching {key:?} nor 'default' found while determining {item}")]
    KeyedByNoMatch {
        attribute: String,
        key: String,
        item: String,
    },

    #[error("Invalid pattern {pattern:?} in keyed-by mapping while determining {item}")]
    KeyedByInvalidPattern { pattern: String, item: String },

    #[error("Keyed-by '{attribute}' alternatives must be a mapping while determining {item}")]
    KeyedByInvalidAlternatives { attribute: String, item: String },

    // Reference errors
    #[error("Job {label} references unknown dependency <{token}> in its payload")]
    UnresolvedReference { label: String, token: String },

    #[error("Job {label} has a non-string job_reference in its payload")]
    InvalidReference { label: String },

    // Parameter errors
    #[error("Parameters file has unsupported format: {0}")]
    ParameterFormat(String),

    #[error("Invalid parameters: {0}")]
    InvalidParameters(String),

    // Configuration and schema errors
    #[error("Invalid graph configuration: {0}")]
    InvalidConfig(String),

    #[error("Schema validation failed for {context}: {detail}")]
    SchemaValidation { context: String, detail: String },

    // Stage errors
    #[error("Failed to load stage {stage}: {source}")]
    StageLoad {
        stage: String,
        #[source]
        source: Box<Error>,
    },

    #[error("Stage {stage} depends on unknown stage {dependency}")]
    UnknownStage { stage: String, dependency: String },

    // Registry errors
    #[error("Unknown loader: {0}")]
    UnknownLoader(String),

    #[error("Unknown transform: {0}")]
    UnknownTransform(String),

    #[error("Unknown target filter: {0}")]
    UnknownFilter(String),

    #[error("Unknown optimization strategy: {0}")]
    UnknownStrategy(String),

    #[error("Unknown extension: {0}")]
    UnknownExtension(String),

    // Optimization errors
    #[error("Optimized graph is inconsistent:\n{0}")]
    DependsOnRemoved(String),

    // Infrastructure errors
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(String),

    // Generic
    #[error("Internal error: {0}")]
    Internal(String),
}

pub type Result<T> = std::result::Result<T, Error>;

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::Serialization(err.to_string())
    }
}

impl From<serde_yaml::Error> for Error {
    fn from(err: serde_yaml::Error) -> Self {
        Error::Serialization(err.to_string())
    }
}

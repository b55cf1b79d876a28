//! Error taxonomy for scenario loading, topology building and simulation runs.
//!
//! Fatal kinds (configuration, topology, numeric blow-ups) unwind to the
//! binary, which prints the offending tick and component before exiting
//! nonzero. Recoverable kinds (identification, subscriber callbacks, data
//! access) are logged where they occur and never cross the bus boundary.

use thiserror::Error;

/// Fatal errors raised while reading and wiring a scenario directory.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read scenario file '{path}': {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse scenario file '{path}': {source}")]
    Yaml {
        path: String,
        #[source]
        source: serde_yaml::Error,
    },

    #[error("unknown class '{0}'")]
    UnknownClass(String),

    #[error("reference to unknown component '{0}'")]
    MissingReference(String),

    #[error("schema error: {0}")]
    Schema(String),

    #[error("model type '{0}' is not supported by this engine")]
    UnsupportedModel(String),

    #[error(transparent)]
    Component(#[from] ComponentError),

    #[error(transparent)]
    Topology(#[from] TopologyError),
}

/// Errors detected while assembling or sorting the component graph.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum TopologyError {
    #[error("component graph contains at least one cycle")]
    Cycle,

    #[error("component '{0}' does not exist")]
    UnknownComponent(String),

    #[error("component with id '{0}' already exists")]
    DuplicateComponent(String),
}

/// Fatal errors raised by the simulation harness.
#[derive(Debug, Error)]
pub enum HarnessError {
    #[error("harness has not been built; call build() before run()")]
    NotBuilt,

    #[error(transparent)]
    Topology(#[from] TopologyError),

    #[error("non-finite state detected in component '{component}' at tick {tick}")]
    NumericFailure { tick: usize, component: String },
}

/// Errors raised at component construction or parameter update time.
#[derive(Debug, Error, PartialEq)]
pub enum ComponentError {
    #[error("invalid storage curve: {0}")]
    InvalidStorageCurve(String),

    #[error("invalid parameter: {0}")]
    InvalidParameter(String),
}

/// Recoverable failures of the offline parameter estimators.
#[derive(Debug, Error, PartialEq)]
pub enum IdentificationError {
    #[error("insufficient data: have {have} samples, need {need}")]
    InsufficientData { have: usize, need: usize },

    #[error("identification data is missing the '{0}' series")]
    MissingSeries(String),

    #[error("estimator did not converge: {0}")]
    NotConverged(String),

    #[error("this model does not support parameter identification")]
    Unsupported,
}

/// Failure inside a bus subscriber callback. Logged by the bus and
/// swallowed so that later subscribers of the same publish still run.
#[derive(Debug, Error, PartialEq, Eq)]
#[error("{0}")]
pub struct SubscriberError(pub String);

/// Errors raised while exporting run history to disk.
#[derive(Debug, Error)]
pub enum ExportError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("csv error: {0}")]
    Csv(#[from] csv::Error),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("binary encoding error: {0}")]
    Encode(#[from] bincode::Error),
}

/// Umbrella error for the command-line driver.
#[derive(Debug, Error)]
pub enum ScenarioError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Harness(#[from] HarnessError),

    #[error(transparent)]
    Export(#[from] ExportError),
}

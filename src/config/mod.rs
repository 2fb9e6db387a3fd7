//! Engine configuration.
//!
//! Loading `strata.yaml`, applying environment overrides and validating the
//! result.

mod parser;
mod spec;
mod validator;

pub use parser::{ConfigParser, DEFAULT_CONFIG_FILES, find_config_file};
pub use spec::{
    EngineConfig, ExecutionConfig, ProvidersConfig, SandboxConfig, SandboxTypeConfig, SchemaConfig,
    StackConfig, StateBackend, StateConfig,
};
pub use validator::{ConfigIssue, ConfigValidator, ValidationReport};

// ============================================================================
// Strict linting - Dangerous or non-idiomatic practices are forbidden
// ============================================================================

#![deny(warnings)]                    // All warnings are treated as errors
#![deny(unsafe_code)]                 // Unsafe code is forbidden
#![deny(missing_docs)]                // All public items must be documented
#![deny(dead_code)]                   // Unused code is forbidden
#![deny(non_camel_case_types)]        // Types must follow CamelCase convention

// Additional strictness - Leave nothing unchecked
#![deny(unused_imports)]              // Unused imports are forbidden
#![deny(unused_variables)]            // Unused variables are forbidden
#![deny(unused_must_use)]             // Must handle Result and Option explicitly
#![deny(non_snake_case)]              // Variables and functions must be snake_case
#![deny(non_upper_case_globals)]      // Constants must be UPPER_CASE
#![deny(nonstandard_style)]           // Non-standard code style is forbidden
#![forbid(unsafe_op_in_unsafe_fn)]    // Unsafe ops in unsafe fns are forbidden

// Clippy lints (warnings only)
#![warn(clippy::all)]                 // All standard Clippy lints
#![warn(clippy::pedantic)]            // Very strict Clippy lints
#![warn(clippy::nursery)]             // Experimental lints
#![warn(clippy::unwrap_used)]         // unwrap() warning
#![warn(clippy::expect_used)]         // expect() warning
#![warn(clippy::panic)]               // panic!() warning
#![warn(clippy::print_stdout)]        // println!() warning
#![warn(clippy::todo)]                // TODO warning
#![warn(clippy::unimplemented)]       // unimplemented!() warning
#![warn(clippy::missing_const_for_fn)] // Force const when possible
#![warn(clippy::unwrap_in_result)]    // unwrap() in Result warning
#![warn(clippy::module_inception)]    // Module with same name as crate warning
#![warn(clippy::redundant_clone)]     // Useless clones warning
#![warn(clippy::shadow_unrelated)]    // Shadowing unrelated variables warning
#![warn(clippy::too_many_arguments)]  // Limit function arguments
#![warn(clippy::cognitive_complexity)] // Limit cognitive complexity
#![cfg_attr(test, allow(clippy::unwrap_used, clippy::expect_used, clippy::panic))]

// Safety and robustness lints
#![deny(overflowing_literals)]        // Overflowing literals are forbidden
#![deny(arithmetic_overflow)]         // Arithmetic overflow is forbidden

// ============================================================================
// Crate Documentation
// ============================================================================

//! # Strata
//!
//! A declarative, idempotent, template-driven infrastructure provisioning
//! engine.
//!
//! ## Overview
//!
//! A template declares parameters, conditions, resources and outputs. Strata
//! resolves the template against caller parameters, reconciles the desired
//! resources with the last applied snapshot and executes the difference
//! through resource providers, concurrently where the dependency graph
//! allows. A failed run is rolled back so state returns to its pre-plan
//! snapshot.
//!
//! ## Architecture
//!
//! 1. **Template**: parsed from YAML or JSON into typed declarations
//! 2. **Resolver**: parameters, conditions and intrinsic functions
//! 3. **Planner**: dependency graph, per-resource diff, execution DAG
//! 4. **Executor**: bounded concurrent execution with rollback
//! 5. **State**: versioned snapshot guarded by a single-writer lease
//!
//! ## Modules
//!
//! - [`template`]: Template model and parsing
//! - [`resolver`]: Parameter, condition and intrinsic resolution
//! - [`planner`]: Graph building, planning, execution and rollback
//! - [`provider`]: Provider trait, operation driver and sandbox provider
//! - [`state`]: State storage backends (local, memory)
//! - [`config`]: Engine configuration
//! - [`engine`]: The plan/apply/destroy facade
//! - [`cli`]: Command-line interface
//!
//! ## Example
//!
//! ```yaml
//! Parameters:
//!   Port:
//!     Type: Number
//!     Default: "80"
//! Resources:
//!   TargetGroup:
//!     Type: AWS::ElasticLoadBalancingV2::TargetGroup
//!     Properties:
//!       Port: !Ref Port
//! Outputs:
//!   TargetGroupPort:
//!     Value: !GetAtt TargetGroup.Port
//! ```

// ============================================================================
// Modules
// ============================================================================

pub mod cli;
pub mod config;
pub mod engine;
pub mod error;
pub mod planner;
pub mod provider;
pub mod resolver;
pub mod state;
pub mod template;

// ============================================================================
// Re-exports
// ============================================================================

pub use cli::{Cli, Commands, OutputFormatter};
pub use config::{ConfigParser, ConfigValidator, EngineConfig};
pub use engine::{ApplyReport, Engine, LoadedTemplate};
pub use error::{Result, StrataError};
pub use planner::{DiffEngine, Plan, PlanExecutor, Planner};
pub use provider::{ProviderRegistry, ResourceProvider, SandboxProvider};
pub use resolver::{ParameterResolver, Resolver};
pub use state::{LocalStateStore, MemoryStateStore, StateSnapshot, StateStore};
pub use template::{Template, TemplateParser, Value};

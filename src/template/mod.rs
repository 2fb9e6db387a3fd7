//! Template model.
//!
//! This module handles everything about the template document itself:
//! - Parsing YAML/JSON templates into declarations
//! - The intrinsic expression tree and its references
//! - The resolved value tree stored in state
//! - Content hashing for change detection

mod expr;
mod hash;
mod parser;
mod types;
mod value;

pub use expr::{Expr, Reference, SubPart, sub_reference};
pub use hash::TemplateHasher;
pub use parser::TemplateParser;
pub use types::{
    DeletionPolicy, OutputDecl, ParameterDecl, ParameterType, ResourceDecl, Template,
};
pub use value::{Properties, Value};

//! Language tooling for PDDL: a tolerant parser for domain, problem, plan and
//! happenings files, a folder-aware workspace model that binds problems to
//! their domains, and an LSP backend on top of both.

pub mod analysis;
pub mod backend;
pub mod completion;
pub mod config;
pub mod domain;
pub mod error;
pub mod file_info;
pub mod formatter;
pub mod happenings;
pub mod inheritance;
pub mod parser;
pub mod plan;
pub mod planner;
pub mod preprocess;
pub mod problem;
pub mod scheduler;
pub mod symbols;
pub mod syntax;
pub mod text;
pub mod validation;
pub mod workspace;

pub use backend::Backend;
pub use parser::PddlParser;
pub use workspace::{SharedWorkspace, Workspace};

pub const VERSION: &str = env!("CARGO_PKG_VERSION");

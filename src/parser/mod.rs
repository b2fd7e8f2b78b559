// Parser module for spot playbooks

pub mod ast;
mod tasks;
pub mod yaml;

pub use ast::*;
pub use yaml::{load_playbook, parse_playbook};

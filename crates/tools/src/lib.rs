//! Example tool collaborators for Superego inner agents.
//!
//! The flow engine does not depend on any particular tool. This crate ships
//! the calculator used by the bundled example flow and a registry builder.

pub mod calculator;

use superego_core::tool::ToolRegistry;

pub use calculator::CalculatorTool;

/// Create a registry with every bundled tool.
pub fn default_registry() -> ToolRegistry {
    let mut registry = ToolRegistry::new();
    registry.register(Box::new(CalculatorTool));
    registry
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_registry_has_calculator() {
        let registry = default_registry();
        assert_eq!(registry.names(), vec!["calculator"]);
    }
}

pub mod assets;
pub mod definition;
pub mod error;
pub mod registry;

pub use assets::all_definitions;
pub use definition::{
    AssetContext, AssetDefinition, Dependency, IngestKind, IngestRequirement, ResolvedDependency,
    ValidationIssue, ValidationSeverity,
};
pub use error::RegistryError;
pub use registry::AssetRegistry;

/// Build the registry populated with every asset slug this crate knows
/// about, pre-checked for acyclicity.
pub fn build_registry() -> Result<AssetRegistry, RegistryError> {
    let registry = AssetRegistry::new(all_definitions());
    registry.assert_acyclic()?;
    Ok(registry)
}

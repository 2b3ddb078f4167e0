//! Series configuration.

use serde::{Deserialize, Serialize};

/// Options fixed when a [`crate::series::Series`] is created.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SeriesConfig {
    /// Group name of the meshes container inside an iteration
    pub meshes_path: String,
    /// Group name of the particles container inside an iteration
    pub particles_path: String,
    /// Barrier and collective backend close when finalizing iterations
    pub collective_close: bool,
    /// Value of the `software` series attribute
    pub software: String,
    /// Value of the `author` series attribute, omitted when unset
    pub author: Option<String>,
}

impl Default for SeriesConfig {
    fn default() -> Self {
        Self {
            meshes_path: String::from("fields"),
            particles_path: String::from("particles"),
            collective_close: true,
            software: String::from("stepflux"),
            author: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_values() {
        let config = SeriesConfig::default();
        assert_eq!(config.meshes_path, "fields");
        assert_eq!(config.particles_path, "particles");
        assert!(config.collective_close);
        assert!(config.author.is_none());
    }

    #[test]
    fn test_partial_document_uses_defaults() {
        let config: SeriesConfig = serde_json::from_str(r#"{"meshes_path": "meshes"}"#).unwrap();
        assert_eq!(config.meshes_path, "meshes");
        assert_eq!(config.particles_path, "particles");
        assert!(config.collective_close);
    }
}

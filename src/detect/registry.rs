use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{anyhow, Result};
use serde::{Deserialize, Serialize};

use super::backend::DetectorBackend;
use super::backends::StubBackend;
use super::labels::LabelMap;

/// Everything needed to construct a backend.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct BackendSettings {
    /// Registered backend name (`stub`, `ssd`, `yolo`).
    pub name: String,
    pub model_path: Option<PathBuf>,
    pub labels_path: Option<PathBuf>,
    /// Square model input edge; backend default when unset.
    pub input_size: Option<u32>,
    /// SSD only: raw `u8` input instead of `[-1, 1]` floats.
    pub quantized: bool,
}

impl Default for BackendSettings {
    fn default() -> Self {
        Self {
            name: "stub".to_string(),
            model_path: None,
            labels_path: None,
            input_size: None,
            quantized: true,
        }
    }
}

impl BackendSettings {
    pub fn labels(&self) -> Result<LabelMap> {
        match &self.labels_path {
            Some(path) => LabelMap::load(path),
            None => Ok(LabelMap::default()),
        }
    }

    #[cfg_attr(not(feature = "backend-tract"), allow(dead_code))]
    fn require_model(&self) -> Result<&std::path::Path> {
        self.model_path
            .as_deref()
            .ok_or_else(|| anyhow!("backend '{}' requires a model path", self.name))
    }
}

/// Builds a backend from settings.
pub type BackendFactory =
    Arc<dyn Fn(&BackendSettings) -> Result<Box<dyn DetectorBackend>> + Send + Sync>;

/// Name-to-factory table. Backends are chosen once per run, at construction.
#[derive(Clone)]
pub struct BackendRegistry {
    factories: HashMap<String, BackendFactory>,
}

impl BackendRegistry {
    pub fn new() -> Self {
        Self {
            factories: HashMap::new(),
        }
    }

    /// Registry with `stub`, `ssd` and `yolo`.
    pub fn with_builtin() -> Self {
        let mut registry = Self::new();
        registry.register("stub", |settings: &BackendSettings| {
            let mut backend = StubBackend::new();
            if settings.labels_path.is_some() {
                backend = backend.with_labels(settings.labels()?);
            }
            Ok(Box::new(backend) as Box<dyn DetectorBackend>)
        });
        registry.register("ssd", build_ssd);
        registry.register("yolo", build_yolo);
        registry
    }

    pub fn register<F>(&mut self, name: &str, factory: F)
    where
        F: Fn(&BackendSettings) -> Result<Box<dyn DetectorBackend>> + Send + Sync + 'static,
    {
        self.factories.insert(name.to_string(), Arc::new(factory));
    }

    pub fn contains(&self, name: &str) -> bool {
        self.factories.contains_key(name)
    }

    /// List registered backends, sorted.
    pub fn list(&self) -> Vec<String> {
        let mut names: Vec<String> = self.factories.keys().cloned().collect();
        names.sort();
        names
    }

    /// Construct the backend named by `settings.name`.
    pub fn build(&self, settings: &BackendSettings) -> Result<Box<dyn DetectorBackend>> {
        let factory = self.factories.get(&settings.name).ok_or_else(|| {
            anyhow!(
                "backend '{}' not registered (available: {})",
                settings.name,
                self.list().join(", ")
            )
        })?;
        factory(settings)
    }
}

impl Default for BackendRegistry {
    fn default() -> Self {
        Self::with_builtin()
    }
}

#[cfg(feature = "backend-tract")]
fn build_ssd(settings: &BackendSettings) -> Result<Box<dyn DetectorBackend>> {
    let backend = super::backends::SsdBackend::new(
        settings.require_model()?,
        settings.labels()?,
        settings.input_size.unwrap_or(300),
        settings.quantized,
    )?;
    Ok(Box::new(backend))
}

#[cfg(feature = "backend-tract")]
fn build_yolo(settings: &BackendSettings) -> Result<Box<dyn DetectorBackend>> {
    let backend = super::backends::YoloBackend::new(
        settings.require_model()?,
        settings.labels()?,
        settings.input_size.unwrap_or(640),
    )?;
    Ok(Box::new(backend))
}

#[cfg(not(feature = "backend-tract"))]
fn build_ssd(settings: &BackendSettings) -> Result<Box<dyn DetectorBackend>> {
    Err(anyhow!(
        "backend '{}' requires the backend-tract feature",
        settings.name
    ))
}

#[cfg(not(feature = "backend-tract"))]
fn build_yolo(settings: &BackendSettings) -> Result<Box<dyn DetectorBackend>> {
    build_ssd(settings)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builtin_registry_lists_all_backends() {
        let registry = BackendRegistry::with_builtin();
        assert_eq!(registry.list(), vec!["ssd", "stub", "yolo"]);
    }

    #[test]
    fn unknown_backend_is_rejected() {
        let registry = BackendRegistry::with_builtin();
        let settings = BackendSettings {
            name: "resnet".to_string(),
            ..BackendSettings::default()
        };
        let err = registry.build(&settings).err().map(|e| e.to_string());
        assert!(err.unwrap_or_default().contains("not registered"));
    }

    #[test]
    fn stub_backend_builds_without_a_model() -> Result<()> {
        let backend = BackendRegistry::with_builtin().build(&BackendSettings::default())?;
        assert_eq!(backend.name(), "stub");
        Ok(())
    }

    #[test]
    fn model_backends_fail_without_a_model_path() {
        let registry = BackendRegistry::with_builtin();
        for name in ["ssd", "yolo"] {
            let settings = BackendSettings {
                name: name.to_string(),
                ..BackendSettings::default()
            };
            assert!(registry.build(&settings).is_err());
        }
    }

    #[test]
    fn custom_factories_can_be_registered() -> Result<()> {
        let mut registry = BackendRegistry::new();
        registry.register("custom", |_settings: &BackendSettings| {
            Ok(Box::new(StubBackend::new()) as Box<dyn DetectorBackend>)
        });
        let settings = BackendSettings {
            name: "custom".to_string(),
            ..BackendSettings::default()
        };
        assert!(registry.contains("custom"));
        assert_eq!(registry.build(&settings)?.name(), "stub");
        Ok(())
    }
}

use std::collections::{BTreeMap, HashMap};

use shmserve_core::{
    ModelDirectory, ModelHandle, ModelSpec, ModelStatusEntry, ServeError, VersionState,
};

use crate::ModelConfig;

struct RegisteredModel {
    spec: ModelSpec,
    versions: BTreeMap<u64, VersionState>,
}

/// Read-only view of the configured models and their version states.
#[derive(Default)]
pub struct ModelRegistry {
    models: HashMap<String, RegisteredModel>,
}

impl ModelRegistry {
    pub fn new() -> Self {
        Self {
            models: HashMap::new(),
        }
    }

    pub fn from_config(models: &[ModelConfig]) -> Self {
        let mut registry = Self::new();
        for model in models {
            registry.register(
                &model.name,
                model.spec(),
                model.versions.iter().map(|v| (v.version, v.state)),
            );
        }
        registry
    }

    pub fn register(
        &mut self,
        name: &str,
        spec: ModelSpec,
        versions: impl IntoIterator<Item = (u64, VersionState)>,
    ) {
        self.models.insert(
            name.to_string(),
            RegisteredModel {
                spec,
                versions: versions.into_iter().collect(),
            },
        );
    }

    fn model(&self, name: &str) -> Result<&RegisteredModel, ServeError> {
        self.models
            .get(name)
            .ok_or_else(|| ServeError::NotFound(format!("model '{name}' is not registered")))
    }
}

impl ModelDirectory for ModelRegistry {
    fn resolve(&self, name: &str, version: Option<u64>) -> Result<ModelHandle, ServeError> {
        let model = self.model(name)?;
        let version = match version {
            None => model
                .versions
                .iter()
                .rev()
                .find(|(_, state)| **state == VersionState::Available)
                .map(|(v, _)| *v)
                .ok_or_else(|| {
                    ServeError::Unavailable(format!("model '{name}' has no available version"))
                })?,
            Some(v) => match model.versions.get(&v) {
                None => {
                    return Err(ServeError::NotFound(format!("model '{name}' has no version {v}")))
                }
                Some(VersionState::Available) => v,
                Some(state) => {
                    return Err(ServeError::Unavailable(format!(
                        "model '{name}' version {v} is {state:?}"
                    )))
                }
            },
        };
        Ok(ModelHandle {
            name: name.to_string(),
            version,
            spec: model.spec.clone(),
        })
    }

    fn statuses(
        &self,
        name: &str,
        version: Option<u64>,
    ) -> Result<Vec<ModelStatusEntry>, ServeError> {
        let model = self.model(name)?;
        let entry = |(version, state): (&u64, &VersionState)| ModelStatusEntry {
            model: name.to_string(),
            version: *version,
            state: *state,
        };
        match version {
            None => Ok(model.versions.iter().map(entry).collect()),
            Some(v) => model
                .versions
                .get_key_value(&v)
                .map(|kv| vec![entry(kv)])
                .ok_or_else(|| ServeError::NotFound(format!("model '{name}' has no version {v}"))),
        }
    }
}

#[cfg(test)]
mod tests {
    use shmserve_core::{DType, StatusCode};

    use super::*;
    use crate::config::single_model;

    fn registry() -> ModelRegistry {
        let config = single_model("echo", DType::F32, &[1, 4], &[1, 4]);
        let mut registry = ModelRegistry::from_config(&config.model_config_list);
        registry.register(
            "staged",
            config.model_config_list[0].spec(),
            [
                (1, VersionState::Available),
                (2, VersionState::Available),
                (3, VersionState::Loading),
            ],
        );
        registry
    }

    #[test]
    fn unknown_model_is_not_found() {
        let err = registry().statuses("nope", None).unwrap_err();
        assert_eq!(err.code(), StatusCode::NotFound);
        let err = registry().resolve("nope", Some(1)).unwrap_err();
        assert_eq!(err.code(), StatusCode::NotFound);
    }

    #[test]
    fn unknown_version_is_not_found() {
        let err = registry().statuses("echo", Some(9)).unwrap_err();
        assert_eq!(err.code(), StatusCode::NotFound);
    }

    #[test]
    fn latest_available_version_wins() -> anyhow::Result<()> {
        let handle = registry().resolve("staged", None)?;
        assert_eq!(handle.version, 2);
        Ok(())
    }

    #[test]
    fn loading_version_is_unavailable() {
        let err = registry().resolve("staged", Some(3)).unwrap_err();
        assert_eq!(err.code(), StatusCode::Unavailable);
    }

    #[test]
    fn status_lists_every_version_in_order() -> anyhow::Result<()> {
        let states: Vec<_> = registry()
            .statuses("staged", None)?
            .into_iter()
            .map(|e| (e.version, e.state))
            .collect();
        assert_eq!(
            states,
            vec![
                (1, VersionState::Available),
                (2, VersionState::Available),
                (3, VersionState::Loading),
            ]
        );
        Ok(())
    }
}

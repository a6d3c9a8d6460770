//! Runtime control over which models are visible to clients.
//!
//! A mutable hidden set is layered over the static model catalog and
//! persisted to a small JSON side file. Persistence is best-effort: a failed
//! write is logged but the in-memory state still updates.

use std::{
    collections::HashSet,
    path::{Path, PathBuf},
    sync::Mutex,
};

use serde::Serialize;

/// Snapshot of the registry for introspection endpoints.
#[derive(Serialize, Debug, Clone, PartialEq, Eq)]
pub struct VisibilityInfo {
    pub known_models: Vec<String>,
    pub visible_models: Vec<String>,
    pub hidden_models: Vec<String>,
}

#[derive(Debug)]
pub struct ModelVisibility {
    known: Vec<String>,
    hidden: Mutex<HashSet<String>>,
    path: Option<PathBuf>,
}

impl ModelVisibility {
    /// Build the registry from the static catalog and the default hidden
    /// set. A persisted hidden set, when present and readable, wins over the
    /// defaults; entries naming unknown models are dropped silently.
    pub fn new(
        known_models: impl IntoIterator<Item = String>,
        default_hidden: &[String],
        path: Option<PathBuf>,
    ) -> Self {
        let known = normalize(known_models);

        let mut hidden: HashSet<String> = default_hidden
            .iter()
            .filter(|model| known.contains(model))
            .cloned()
            .collect();

        if let Some(persisted) = path.as_deref().and_then(load_hidden_set) {
            hidden = persisted
                .into_iter()
                .filter(|model| known.contains(model))
                .collect();
        }

        Self {
            known,
            hidden: Mutex::new(hidden),
            path,
        }
    }

    /// The static catalog, in load order.
    pub fn known_models(&self) -> &[String] {
        &self.known
    }

    /// Currently hidden models, in catalog order.
    pub fn hidden_models(&self) -> Vec<String> {
        let hidden = self.hidden.lock().unwrap();
        self.known
            .iter()
            .filter(|model| hidden.contains(*model))
            .cloned()
            .collect()
    }

    /// Visible = known − hidden, in catalog order. Derived, never stored.
    pub fn visible_models(&self) -> Vec<String> {
        let hidden = self.hidden.lock().unwrap();
        self.known
            .iter()
            .filter(|model| !hidden.contains(*model))
            .cloned()
            .collect()
    }

    pub fn is_hidden(&self, model: &str) -> bool {
        self.hidden.lock().unwrap().contains(model)
    }

    /// Replace the hidden set wholesale. Unknown models are dropped. Returns
    /// the hidden set that was applied, in catalog order.
    pub async fn set_hidden(&self, models: &[String]) -> Vec<String> {
        let next: HashSet<String> = normalize(models.iter().cloned())
            .into_iter()
            .filter(|model| self.known.contains(model))
            .collect();

        let applied: Vec<String> = {
            let mut hidden = self.hidden.lock().unwrap();
            *hidden = next;
            self.known
                .iter()
                .filter(|model| hidden.contains(*model))
                .cloned()
                .collect()
        };

        if let Some(path) = self.path.as_deref() {
            persist_hidden_set(path, &applied).await;
        }

        applied
    }

    pub fn describe(&self) -> VisibilityInfo {
        let hidden = self.hidden.lock().unwrap();
        VisibilityInfo {
            known_models: self.known.clone(),
            visible_models: self
                .known
                .iter()
                .filter(|model| !hidden.contains(*model))
                .cloned()
                .collect(),
            hidden_models: self
                .known
                .iter()
                .filter(|model| hidden.contains(*model))
                .cloned()
                .collect(),
        }
    }
}

/// Trim, drop empties, dedupe while preserving order.
fn normalize(models: impl IntoIterator<Item = String>) -> Vec<String> {
    let mut seen = HashSet::new();
    models
        .into_iter()
        .map(|model| model.trim().to_string())
        .filter(|model| !model.is_empty())
        .filter(|model| seen.insert(model.clone()))
        .collect()
}

fn load_hidden_set(path: &Path) -> Option<HashSet<String>> {
    if !path.exists() {
        return None;
    }

    let data = match std::fs::read_to_string(path) {
        Ok(data) => data,
        Err(e) => {
            tracing::error!(error = %e, path = %path.display(), "Failed to read hidden model list, using defaults");
            return None;
        }
    };

    match serde_json::from_str::<Vec<serde_json::Value>>(&data) {
        Ok(values) => Some(
            values
                .into_iter()
                .filter_map(|value| value.as_str().map(str::to_string))
                .collect(),
        ),
        Err(e) => {
            tracing::error!(error = %e, path = %path.display(), "Hidden model list is malformed, using defaults");
            None
        }
    }
}

async fn persist_hidden_set(path: &Path, hidden: &[String]) {
    let write = async {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                tokio::fs::create_dir_all(parent).await?;
            }
        }
        let payload = serde_json::to_string_pretty(hidden).unwrap_or_else(|_| "[]".to_string());
        tokio::fs::write(path, payload).await
    };

    if let Err(e) = write.await {
        tracing::error!(error = %e, path = %path.display(), "Failed to persist hidden model list");
    }
}

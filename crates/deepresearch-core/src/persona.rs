use std::path::{Path, PathBuf};

use chrono::Utc;
use deepresearch_schema::persona::{Persona, TerminalPreferences};
use deepresearch_schema::CoreError;
use serde::{Deserialize, Serialize};
use tracing::warn;

/// The closed set of selectable personas. Only the default *slug* is
/// persisted; the catalog entries themselves are compiled in.
pub fn catalog() -> Vec<Persona> {
    vec![
        Persona::new("default", "Default", "Balanced, neutral research assistant."),
        Persona::new("analyst", "Analyst", "Methodical and citation-heavy."),
        Persona::new("explainer", "Explainer", "Plain-language summaries for newcomers."),
        Persona::new("skeptic", "Skeptic", "Challenges claims and flags weak sourcing."),
    ]
}

pub fn known_slugs() -> std::collections::HashSet<String> {
    catalog().into_iter().map(|p| p.slug).collect()
}

fn normalize_slug(slug: &str) -> Option<String> {
    let normalized = slug.trim().to_lowercase();
    known_slugs().contains(&normalized).then_some(normalized)
}

#[derive(Debug, Serialize, Deserialize)]
struct PersonaFile {
    default_slug: String,
    updated_at: chrono::DateTime<Utc>,
}

/// Reads/writes `persona.json` under a storage directory with the
/// write-to-temp-then-rename durability pattern. A corrupted file is not
/// overwritten until the next successful `set_default`.
pub struct PersonaStore {
    path: PathBuf,
}

impl PersonaStore {
    pub fn new(storage_dir: impl AsRef<Path>) -> Self {
        Self { path: storage_dir.as_ref().join("persona.json") }
    }

    pub async fn get_default(&self) -> Persona {
        let slug = match tokio::fs::read(&self.path).await {
            Ok(bytes) => match serde_json::from_slice::<PersonaFile>(&bytes) {
                Ok(file) => file.default_slug,
                Err(e) => {
                    warn!(error = %e, "persona file corrupted, using built-in default");
                    "default".to_string()
                }
            },
            Err(_) => "default".to_string(),
        };

        catalog()
            .into_iter()
            .find(|p| p.slug == slug)
            .unwrap_or_else(|| catalog().into_iter().next().expect("catalog is non-empty"))
    }

    pub async fn set_default(&self, slug: &str) -> Result<Persona, CoreError> {
        let normalized = normalize_slug(slug).ok_or_else(|| CoreError::PersonaUnknown(slug.to_string()))?;
        let file = PersonaFile { default_slug: normalized.clone(), updated_at: Utc::now() };
        let json = serde_json::to_vec_pretty(&file)
            .map_err(|e| CoreError::ProviderError(format!("serialize persona file: {e}")))?;
        write_atomic(&self.path, &json).await?;

        Ok(catalog().into_iter().find(|p| p.slug == normalized).expect("normalized slug is known"))
    }
}

/// Reads/writes `preferences.json`. Unknown keys on write are dropped
/// (`TerminalPreferences::retain_known`); missing known keys on read are
/// filled from `defaults`.
pub struct PreferencesStore {
    path: PathBuf,
    defaults: TerminalPreferences,
}

impl PreferencesStore {
    pub fn new(storage_dir: impl AsRef<Path>, defaults: TerminalPreferences) -> Self {
        Self { path: storage_dir.as_ref().join("preferences.json"), defaults }
    }

    pub async fn read(&self) -> TerminalPreferences {
        match tokio::fs::read(&self.path).await {
            Ok(bytes) => match serde_json::from_slice::<TerminalPreferences>(&bytes) {
                Ok(mut prefs) => {
                    for (k, v) in &self.defaults.widgets {
                        prefs.widgets.entry(k.clone()).or_insert(*v);
                    }
                    for (k, v) in &self.defaults.terminal {
                        prefs.terminal.entry(k.clone()).or_insert(*v);
                    }
                    prefs
                }
                Err(e) => {
                    warn!(error = %e, "preferences file corrupted, using built-in defaults");
                    self.defaults.clone()
                }
            },
            Err(_) => self.defaults.clone(),
        }
    }

    pub async fn update(&self, mut patch: TerminalPreferences) -> Result<TerminalPreferences, CoreError> {
        patch.retain_known();
        let mut current = self.read().await;
        current.widgets.extend(patch.widgets);
        current.terminal.extend(patch.terminal);
        current.touch();

        let json = serde_json::to_vec_pretty(&current)
            .map_err(|e| CoreError::ProviderError(format!("serialize preferences: {e}")))?;
        write_atomic(&self.path, &json).await?;
        Ok(current)
    }
}

async fn write_atomic(path: &Path, bytes: &[u8]) -> Result<(), CoreError> {
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent)
            .await
            .map_err(|e| CoreError::ProviderError(format!("create storage dir: {e}")))?;
    }
    let tmp_path = path.with_extension("json.tmp");
    tokio::fs::write(&tmp_path, bytes)
        .await
        .map_err(|e| CoreError::ProviderError(format!("write temp file: {e}")))?;
    tokio::fs::rename(&tmp_path, path)
        .await
        .map_err(|e| CoreError::ProviderError(format!("rename into place: {e}")))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn persona_round_trip_set_then_get() {
        let dir = tempfile::tempdir().unwrap();
        let store = PersonaStore::new(dir.path());
        let set = store.set_default("analyst").await.unwrap();
        assert_eq!(set.slug, "analyst");
        let got = store.get_default().await;
        assert_eq!(got.slug, "analyst");
    }

    #[tokio::test]
    async fn persona_unknown_slug_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let store = PersonaStore::new(dir.path());
        let err = store.set_default("ghost").await.unwrap_err();
        assert!(matches!(err, CoreError::PersonaUnknown(s) if s == "ghost"));
    }

    #[tokio::test]
    async fn persona_missing_file_yields_catalog_default() {
        let dir = tempfile::tempdir().unwrap();
        let store = PersonaStore::new(dir.path());
        let got = store.get_default().await;
        assert_eq!(got.slug, "default");
    }

    #[tokio::test]
    async fn persona_corrupted_file_yields_default_without_overwrite() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("persona.json");
        tokio::fs::write(&path, b"not json").await.unwrap();
        let store = PersonaStore::new(dir.path());
        let got = store.get_default().await;
        assert_eq!(got.slug, "default");
        let raw = tokio::fs::read(&path).await.unwrap();
        assert_eq!(raw, b"not json");
    }

    #[tokio::test]
    async fn preferences_update_preserves_patch_keys() {
        let dir = tempfile::tempdir().unwrap();
        let store = PreferencesStore::new(dir.path(), TerminalPreferences::default());
        let mut patch = TerminalPreferences::default();
        patch.widgets.insert("sources_panel".to_string(), true);
        let updated = store.update(patch).await.unwrap();
        assert_eq!(updated.widgets.get("sources_panel"), Some(&true));

        let read_back = store.read().await;
        assert_eq!(read_back.widgets.get("sources_panel"), Some(&true));
    }

    #[tokio::test]
    async fn preferences_update_drops_unknown_keys() {
        let dir = tempfile::tempdir().unwrap();
        let store = PreferencesStore::new(dir.path(), TerminalPreferences::default());
        let mut patch = TerminalPreferences::default();
        patch.widgets.insert("made_up_widget".to_string(), true);
        let updated = store.update(patch).await.unwrap();
        assert!(!updated.widgets.contains_key("made_up_widget"));
    }

    #[tokio::test]
    async fn preferences_missing_keys_filled_from_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let mut defaults = TerminalPreferences::default();
        defaults.terminal.insert("bell".to_string(), false);
        let store = PreferencesStore::new(dir.path(), defaults);
        let read = store.read().await;
        assert_eq!(read.terminal.get("bell"), Some(&false));
    }
}

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A selectable assistant persona from the built-in catalog. `slug` is the
/// stable identifier used in wire messages and persisted preferences.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Persona {
    pub slug: String,
    pub name: String,
    pub description: String,
}

impl Persona {
    pub fn new(slug: impl Into<String>, name: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            slug: slug.into(),
            name: name.into(),
            description: description.into(),
        }
    }
}

/// The fixed, closed set of recognized widget toggle keys.
pub const KNOWN_WIDGET_KEYS: &[&str] = &["sources_panel", "thought_panel", "progress_bar"];

/// The fixed, closed set of recognized terminal toggle keys.
pub const KNOWN_TERMINAL_KEYS: &[&str] = &["bell", "ansi_color", "word_wrap"];

/// Per-user terminal client preferences, persisted atomically between
/// sessions. `widgets`/`terminal` are a fixed known key set; unknown keys
/// are dropped on write (see `retain_known`).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TerminalPreferences {
    #[serde(default)]
    pub widgets: BTreeMap<String, bool>,
    #[serde(default)]
    pub terminal: BTreeMap<String, bool>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub updated_at: Option<DateTime<Utc>>,
}

impl TerminalPreferences {
    pub fn touch(&mut self) {
        self.updated_at = Some(Utc::now());
    }

    /// Drops any `widgets`/`terminal` key outside the fixed known set.
    pub fn retain_known(&mut self) {
        self.widgets.retain(|k, _| KNOWN_WIDGET_KEYS.contains(&k.as_str()));
        self.terminal.retain(|k, _| KNOWN_TERMINAL_KEYS.contains(&k.as_str()));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn preferences_round_trip_known_keys() {
        let mut prefs = TerminalPreferences::default();
        prefs.widgets.insert("sources_panel".to_string(), true);
        prefs.terminal.insert("bell".to_string(), false);
        prefs.touch();

        let json = serde_json::to_string(&prefs).unwrap();
        let restored: TerminalPreferences = serde_json::from_str(&json).unwrap();
        assert_eq!(restored.widgets.get("sources_panel"), Some(&true));
        assert_eq!(restored.terminal.get("bell"), Some(&false));
        assert!(restored.updated_at.is_some());
    }

    #[test]
    fn retain_known_drops_unknown_keys_on_write() {
        let mut prefs = TerminalPreferences::default();
        prefs.widgets.insert("sources_panel".to_string(), true);
        prefs.widgets.insert("made_up_widget".to_string(), true);
        prefs.terminal.insert("bell".to_string(), true);
        prefs.terminal.insert("made_up_terminal_key".to_string(), true);

        prefs.retain_known();

        assert_eq!(prefs.widgets.len(), 1);
        assert!(prefs.widgets.contains_key("sources_panel"));
        assert_eq!(prefs.terminal.len(), 1);
        assert!(prefs.terminal.contains_key("bell"));
    }

    #[test]
    fn persona_equality_is_by_value() {
        let a = Persona::new("analyst", "Analyst", "Methodical and citation-heavy.");
        let b = Persona::new("analyst", "Analyst", "Methodical and citation-heavy.");
        assert_eq!(a, b);
    }
}

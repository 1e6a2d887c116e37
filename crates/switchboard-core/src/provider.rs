//! Provider catalog
//!
//! The catalog lists every configured backend provider together with the
//! models it serves. The router consults it to turn a bare model or provider
//! name into a full `provider,model` route.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Separator between provider and model in a route string
pub const ROUTE_SEPARATOR: char = ',';

/// A configured provider
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ProviderEntry {
    /// Provider name (the left half of a route)
    pub name: String,
    /// Models served by this provider, primary model first
    #[serde(default)]
    pub models: Vec<String>,
    /// Model used when a route names only the provider
    #[serde(default, alias = "defaultModel", skip_serializing_if = "Option::is_none")]
    pub default_model: Option<String>,
    /// Single-model shorthand
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    /// Settings the router does not interpret (base URL, keys, transformers)
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl ProviderEntry {
    /// Create a provider serving the given models
    pub fn new(name: impl Into<String>, models: impl IntoIterator<Item = impl Into<String>>) -> Self {
        Self {
            name: name.into(),
            models: models.into_iter().map(Into::into).collect(),
            ..Default::default()
        }
    }

    /// Set the default model
    pub fn with_default_model(mut self, model: impl Into<String>) -> Self {
        self.default_model = Some(model.into());
        self
    }

    /// Whether this provider lists `model` (in `models` or the single `model` field)
    pub fn serves(&self, model: &str) -> bool {
        self.models.iter().any(|m| m == model) || self.model.as_deref() == Some(model)
    }
}

/// The list of configured providers
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ProviderCatalog {
    providers: Vec<ProviderEntry>,
}

impl ProviderCatalog {
    /// Create a catalog from provider entries
    pub fn new(providers: Vec<ProviderEntry>) -> Self {
        Self { providers }
    }

    /// All providers in configuration order
    pub fn providers(&self) -> &[ProviderEntry] {
        &self.providers
    }

    /// Number of providers
    pub fn len(&self) -> usize {
        self.providers.len()
    }

    /// Check if the catalog is empty
    pub fn is_empty(&self) -> bool {
        self.providers.is_empty()
    }

    /// Find a provider by name, ignoring ASCII case
    pub fn find_by_name(&self, name: &str) -> Option<&ProviderEntry> {
        self.providers
            .iter()
            .find(|provider| provider.name.eq_ignore_ascii_case(name))
    }
}

impl From<Vec<ProviderEntry>> for ProviderCatalog {
    fn from(providers: Vec<ProviderEntry>) -> Self {
        Self::new(providers)
    }
}

/// Split a route into its provider and (optional) model parts
pub fn split_route(route: &str) -> (&str, Option<&str>) {
    match route.split_once(ROUTE_SEPARATOR) {
        Some((provider, model)) => (provider, Some(model)),
        None => (route, None),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_deserialize_provider_with_aliases() {
        let json = r#"{
            "name": "haiku-glm",
            "api_base_url": "https://example.invalid/v1",
            "models": ["glm-4.7", "glm-4.0"],
            "defaultModel": "glm-4.7"
        }"#;

        let provider: ProviderEntry = serde_json::from_str(json).unwrap();
        assert_eq!(provider.name, "haiku-glm");
        assert_eq!(provider.default_model.as_deref(), Some("glm-4.7"));
        assert_eq!(provider.extra["api_base_url"], "https://example.invalid/v1");
    }

    #[test]
    fn test_serves_checks_both_model_fields() {
        let mut provider = ProviderEntry::new("p", ["a", "b"]);
        assert!(provider.serves("b"));
        assert!(!provider.serves("c"));

        provider.model = Some("c".to_string());
        assert!(provider.serves("c"));
    }

    #[test]
    fn test_find_by_name_is_case_insensitive() {
        let catalog = ProviderCatalog::new(vec![ProviderEntry::new("OpenRouter", ["m"])]);
        assert!(catalog.find_by_name("openrouter").is_some());
        assert!(catalog.find_by_name("gemini").is_none());
    }

    #[test]
    fn test_split_route() {
        assert_eq!(split_route("gemini,gemini-2.5-pro"), ("gemini", Some("gemini-2.5-pro")));
        assert_eq!(split_route("gemini"), ("gemini", None));
    }
}

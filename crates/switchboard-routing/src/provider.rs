//! Provider/model resolution
//!
//! Turns a bare model name or a bare provider name into a full
//! `provider,model` route by consulting the provider catalog.
//!
//! ```rust
//! use switchboard_core::{ProviderCatalog, ProviderEntry};
//! use switchboard_routing::resolve_provider_model;
//!
//! let catalog = ProviderCatalog::new(vec![
//!     ProviderEntry::new("haiku-glm", ["glm-4.7", "glm-4.0"]).with_default_model("glm-4.7"),
//! ]);
//!
//! assert_eq!(
//!     resolve_provider_model("haiku-glm", &catalog, false).as_deref(),
//!     Some("haiku-glm,glm-4.7"),
//! );
//! assert_eq!(resolve_provider_model("unknown", &catalog, false), None);
//! assert_eq!(
//!     resolve_provider_model("unknown", &catalog, true).as_deref(),
//!     Some("unknown"),
//! );
//! ```

use switchboard_core::{ProviderCatalog, ROUTE_SEPARATOR};

/// Resolve `input` to a `provider,model` route
///
/// 1. Input that already contains the separator is returned unchanged.
/// 2. A provider listing `input` as a model resolves to that provider's
///    *first* model (or its single `model` field).
/// 3. A provider whose name matches `input` (ignoring ASCII case) resolves to
///    its default model, else its first model, else its `model` field.
/// 4. Otherwise the input itself is returned when `fallback_to_input` is set.
pub fn resolve_provider_model(
    input: &str,
    catalog: &ProviderCatalog,
    fallback_to_input: bool,
) -> Option<String> {
    if input.contains(ROUTE_SEPARATOR) {
        return Some(input.to_string());
    }

    tracing::debug!(input = %input, providers = catalog.len(), "Resolving provider model");

    for provider in catalog.providers() {
        if provider.models.iter().any(|model| model == input) {
            let route = format!("{}{}{}", provider.name, ROUTE_SEPARATOR, provider.models[0]);
            tracing::info!(request = %input, route = %route, "Model name matched");
            return Some(route);
        }
        if let Some(model) = provider.model.as_deref().filter(|model| *model == input) {
            let route = format!("{}{}{}", provider.name, ROUTE_SEPARATOR, model);
            tracing::info!(request = %input, route = %route, "Model name matched");
            return Some(route);
        }
    }

    let fallback = || fallback_to_input.then(|| input.to_string());

    let Some(provider) = catalog.find_by_name(input) else {
        tracing::debug!(input = %input, "No provider or model matched");
        return fallback();
    };

    let model = provider
        .default_model
        .as_deref()
        .or_else(|| provider.models.first().map(String::as_str))
        .or(provider.model.as_deref());

    match model {
        Some(model) => {
            tracing::info!(provider = %provider.name, model = %model, "Provider name matched");
            Some(format!("{}{}{}", provider.name, ROUTE_SEPARATOR, model))
        }
        None => {
            tracing::error!(provider = %provider.name, "Provider has no models configured");
            fallback()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use switchboard_core::ProviderEntry;

    fn catalog() -> ProviderCatalog {
        let mut single = ProviderEntry::new("local", Vec::<String>::new());
        single.model = Some("llama3".to_string());

        ProviderCatalog::new(vec![
            ProviderEntry::new("openrouter", ["claude-3.5-sonnet", "claude-3.7-sonnet"]),
            ProviderEntry::new("haiku-glm", ["glm-4.7", "glm-4.0"]).with_default_model("glm-4.7"),
            ProviderEntry::new("gemini", ["gemini-2.5-flash", "gemini-2.5-pro"]),
            single,
            ProviderEntry::new("empty", Vec::<String>::new()),
        ])
    }

    #[test]
    fn test_qualified_input_is_unchanged() {
        assert_eq!(
            resolve_provider_model("anything,goes", &catalog(), false).as_deref(),
            Some("anything,goes")
        );
    }

    #[test]
    fn test_model_match_routes_to_first_model() {
        // Matching any listed model routes to the provider's primary model
        assert_eq!(
            resolve_provider_model("claude-3.7-sonnet", &catalog(), false).as_deref(),
            Some("openrouter,claude-3.5-sonnet")
        );
    }

    #[test]
    fn test_single_model_field_matches() {
        assert_eq!(
            resolve_provider_model("llama3", &catalog(), false).as_deref(),
            Some("local,llama3")
        );
    }

    #[test]
    fn test_provider_name_prefers_default_model() {
        assert_eq!(
            resolve_provider_model("haiku-glm", &catalog(), false).as_deref(),
            Some("haiku-glm,glm-4.7")
        );
        assert_eq!(
            resolve_provider_model("GEMINI", &catalog(), false).as_deref(),
            Some("gemini,gemini-2.5-flash")
        );
        assert_eq!(
            resolve_provider_model("local", &catalog(), false).as_deref(),
            Some("local,llama3")
        );
    }

    #[test]
    fn test_unresolvable_input() {
        assert_eq!(resolve_provider_model("mystery", &catalog(), false), None);
        assert_eq!(
            resolve_provider_model("mystery", &catalog(), true).as_deref(),
            Some("mystery")
        );
        assert_eq!(resolve_provider_model("empty", &catalog(), false), None);
        assert_eq!(
            resolve_provider_model("empty", &catalog(), true).as_deref(),
            Some("empty")
        );
    }
}

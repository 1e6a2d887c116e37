//! Route template variables
//!
//! A rule's route may contain one of three placeholders:
//!
//! - `${userModel}`: the model string the caller sent, verbatim
//! - `${subagent}`: the route embedded in a system block between
//!   `<TAG>` and `</TAG>` markers
//! - `${mappedModel}`: the caller's bare model resolved through the
//!   provider catalog
//!
//! An unresolved `${userModel}` or `${mappedModel}` sends the request to the
//! default route. An unresolved `${subagent}` is handed back literally so a
//! downstream layer can detect the missing marker.

use crate::provider::resolve_provider_model;
use regex::Regex;
use switchboard_core::{Error, ProviderCatalog, ROUTE_SEPARATOR, Result, RouteRequest, SystemBlock};

pub const USER_MODEL: &str = "${userModel}";
pub const SUBAGENT: &str = "${subagent}";
pub const MAPPED_MODEL: &str = "${mappedModel}";

/// Default marker tag for `${subagent}`
pub const DEFAULT_SUBAGENT_TAG: &str = "CCR-SUBAGENT-MODEL";

/// Outcome of placeholder substitution
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Substitution {
    /// Every placeholder was replaced
    Resolved(String),
    /// Use the default route
    Fallback,
    /// `${subagent}` stayed unresolved; the string is returned as-is
    KeepLiteral(String),
}

/// Whether `route` contains any placeholder
pub fn has_placeholder(route: &str) -> bool {
    route.contains("${")
}

/// Expands route placeholders
#[derive(Debug, Clone)]
pub struct VariableResolver {
    open_tag: String,
    marker: Regex,
}

impl VariableResolver {
    /// Create a resolver for `<tag>…</tag>` subagent markers
    pub fn new(tag: &str) -> Result<Self> {
        let escaped = regex::escape(tag);
        let marker = Regex::new(&format!("<{escaped}>(.*?)</{escaped}>"))
            .map_err(|e| Error::Config(format!("invalid subagent tag {tag:?}: {e}")))?;

        Ok(Self {
            open_tag: format!("<{tag}>"),
            marker,
        })
    }

    /// Extract the subagent route from the first system block carrying the marker
    pub fn extract_subagent(&self, system: &[SystemBlock]) -> Option<String> {
        let text = system
            .iter()
            .map(SystemBlock::body)
            .find(|body| body.contains(&self.open_tag))?;

        self.marker
            .captures(text)
            .and_then(|captures| captures.get(1))
            .map(|m| m.as_str())
            .filter(|route| !route.is_empty())
            .map(str::to_string)
    }

    /// Substitute the placeholders in `route`
    pub fn substitute(
        &self,
        route: &str,
        request: &RouteRequest,
        system: &[SystemBlock],
        catalog: &ProviderCatalog,
        default_route: &str,
    ) -> Substitution {
        let mut resolved = route.to_string();

        if resolved.contains(USER_MODEL) {
            match request.model().filter(|model| !model.is_empty()) {
                Some(model) => resolved = resolved.replace(USER_MODEL, model),
                None => {
                    tracing::warn!("${{userModel}} could not be resolved: request has no model");
                    return Substitution::Fallback;
                }
            }
        }

        if resolved.contains(SUBAGENT) {
            match self.extract_subagent(system) {
                Some(subagent) => resolved = resolved.replace(SUBAGENT, &subagent),
                None => tracing::warn!(tag = %self.open_tag, "${{subagent}} marker not found"),
            }
        }

        if resolved.contains(MAPPED_MODEL) {
            match request
                .model()
                .filter(|model| !model.is_empty() && !model.contains(ROUTE_SEPARATOR))
            {
                Some(model) => match resolve_provider_model(model, catalog, false) {
                    Some(mapped) if mapped != default_route => {
                        resolved = resolved.replace(MAPPED_MODEL, &mapped)
                    }
                    _ => tracing::warn!(model = %model, "${{mappedModel}} has no usable mapping"),
                },
                None => tracing::warn!("${{mappedModel}} needs a bare model name"),
            }
        }

        if route != resolved {
            tracing::debug!(template = %route, route = %resolved, "Substituted route variables");
        }

        if has_placeholder(&resolved) {
            if resolved.contains(SUBAGENT) {
                tracing::debug!(route = %resolved, "Keeping unresolved subagent route");
                return Substitution::KeepLiteral(resolved);
            }
            tracing::warn!(route = %resolved, "Unresolved route variables, using default route");
            return Substitution::Fallback;
        }

        Substitution::Resolved(resolved)
    }
}

//! Model selection.
//!
//! Resolution order: explicit override, the agent's config file, the
//! server's provider catalog, then nothing (the server picks its default).
//! A candidate the reachable catalog does not know is skipped with a warning.

use std::fmt;
use std::path::Path;

use serde::Serialize;
use serde_json::{Map, Value, json};
use tracing::{debug, warn};

/// `provider` + `model` pair sent with a task.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ModelSpec {
    pub provider_id: String,
    pub model_id: String,
}

impl ModelSpec {
    pub fn new(provider_id: impl Into<String>, model_id: impl Into<String>) -> Self {
        Self {
            provider_id: provider_id.into(),
            model_id: model_id.into(),
        }
    }

    /// Parse `provider:model` or `provider/model`, splitting at whichever
    /// separator comes first so the model id may contain the other one.
    pub fn parse(spec: &str) -> Option<Self> {
        let spec = spec.trim();
        let sep = spec.find([':', '/'])?;
        let provider = spec[..sep].trim();
        let model = spec[sep + 1..].trim();
        if provider.is_empty() || model.is_empty() {
            return None;
        }
        Some(Self::new(provider, model))
    }

    /// Request body form.
    pub fn to_json(&self) -> Value {
        json!({"providerID": self.provider_id, "modelID": self.model_id})
    }
}

impl fmt::Display for ModelSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.provider_id, self.model_id)
    }
}

/// Where the chosen model came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ModelSource {
    Override,
    ConfigFile,
    Catalog,
    ServerDefault,
}

impl fmt::Display for ModelSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Override => write!(f, "override"),
            Self::ConfigFile => write!(f, "config file"),
            Self::Catalog => write!(f, "server catalog"),
            Self::ServerDefault => write!(f, "server default"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ModelChoice {
    /// `None` means: omit the model and let the server choose.
    pub model: Option<ModelSpec>,
    pub source: ModelSource,
    pub provider_label: Option<String>,
    pub model_label: Option<String>,
}

impl ModelChoice {
    fn server_default() -> Self {
        Self {
            model: None,
            source: ModelSource::ServerDefault,
            provider_label: None,
            model_label: None,
        }
    }

    pub fn describe(&self) -> String {
        match &self.model {
            Some(m) => format!("{} ({})", m, self.source),
            None => "server default".to_string(),
        }
    }
}

// ── Agent config file ──────────────────────────────────────────────────────

/// Model named in the agent's JSON config file: `agent.<agent>.model`,
/// `mode.<agent>.model`, `model`, then the first model of the first custom
/// provider.
pub fn model_from_config(cfg: &Value, agent: &str) -> Option<ModelSpec> {
    let nested = |section: &str| cfg.get(section)?.get(agent)?.get("model")?.as_str();
    let candidates = [nested("agent"), nested("mode"), cfg.get("model").and_then(Value::as_str)];
    if let Some(spec) = candidates.into_iter().flatten().find_map(ModelSpec::parse) {
        return Some(spec);
    }

    let providers = cfg.get("provider")?.as_object()?;
    providers.iter().find_map(|(provider_id, data)| {
        let models = data.get("models")?.as_object()?;
        let (key, model) = models.iter().next()?;
        let model_id = model
            .get("id")
            .and_then(Value::as_str)
            .unwrap_or(key.as_str());
        (!provider_id.is_empty() && !model_id.is_empty()).then(|| ModelSpec::new(provider_id, model_id))
    })
}

/// Read the config file at `path`. Missing or unreadable files yield `None`.
pub fn model_from_config_file(path: &Path, agent: &str) -> Option<ModelSpec> {
    let text = match std::fs::read_to_string(path) {
        Ok(t) => t,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return None,
        Err(e) => {
            warn!(path = %path.display(), error = %e, "cannot read agent config");
            return None;
        }
    };
    match serde_json::from_str::<Value>(&text) {
        Ok(cfg) => model_from_config(&cfg, agent),
        Err(e) => {
            warn!(path = %path.display(), error = %e, "agent config is not valid JSON");
            None
        }
    }
}

// ── Server catalog ─────────────────────────────────────────────────────────

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProviderEntry {
    pub id: String,
    pub name: String,
    /// `(canonical id, display name)` in server order.
    pub models: Vec<(String, String)>,
    /// Alias (key, id or display name) → canonical id.
    pub aliases: Vec<(String, String)>,
}

impl ProviderEntry {
    fn add_alias(&mut self, alias: String, canonical: &str) {
        if !self.aliases.iter().any(|(a, _)| *a == alias) {
            self.aliases.push((alias, canonical.to_string()));
        }
    }

    fn add_model(&mut self, canonical: String, display: String) {
        self.add_alias(canonical.clone(), &canonical);
        self.add_alias(display.clone(), &canonical);
        if !self.models.iter().any(|(id, _)| *id == canonical) {
            self.models.push((canonical, display));
        }
    }

    pub fn canonical(&self, model: &str) -> Option<&str> {
        if let Some((id, _)) = self.models.iter().find(|(id, _)| id == model) {
            return Some(id);
        }
        self.aliases
            .iter()
            .find(|(alias, _)| alias == model)
            .map(|(_, id)| id.as_str())
    }

    pub fn display_name(&self, canonical: &str) -> Option<&str> {
        self.models
            .iter()
            .find(|(id, _)| id == canonical)
            .map(|(_, name)| name.as_str())
    }
}

/// Providers and models the server reports.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProviderCatalog {
    pub providers: Vec<ProviderEntry>,
    pub default: Option<ModelSpec>,
}

impl ProviderCatalog {
    /// Accepts `{providers:[…], default:{provider: model}}`,
    /// `{provider_id: {name, models}}` and `[…]`. Malformed entries are
    /// dropped.
    pub fn parse(raw: &Value) -> Self {
        let mut catalog = Self::default();
        match raw {
            Value::Object(obj) if obj.get("providers").is_some_and(Value::is_array) => {
                if let Some(Value::Array(list)) = obj.get("providers") {
                    catalog.add_list(list);
                }
                if let Some(Value::Object(default)) = obj.get("default") {
                    catalog.default = default.iter().find_map(|(p, m)| {
                        let m = m.as_str()?;
                        (!p.is_empty() && !m.is_empty()).then(|| ModelSpec::new(p, m))
                    });
                }
            }
            Value::Object(obj) => {
                for (id, data) in obj {
                    let Some(data) = data.as_object() else { continue };
                    if !data.contains_key("models") && !data.contains_key("name") {
                        continue;
                    }
                    catalog.add_provider(id, data);
                }
            }
            Value::Array(list) => catalog.add_list(list),
            _ => {}
        }
        catalog
    }

    fn add_list(&mut self, list: &[Value]) {
        for item in list {
            let Some(data) = item.as_object() else { continue };
            let id = data
                .get("id")
                .or_else(|| data.get("providerID"))
                .and_then(Value::as_str);
            if let Some(id) = id {
                self.add_provider(id, data);
            }
        }
    }

    fn add_provider(&mut self, id: &str, data: &Map<String, Value>) {
        if id.is_empty() {
            return;
        }
        let name = data
            .get("name")
            .and_then(Value::as_str)
            .filter(|s| !s.is_empty())
            .unwrap_or(id)
            .to_string();
        let idx = match self.providers.iter().position(|p| p.id == id) {
            Some(i) => i,
            None => {
                self.providers.push(ProviderEntry {
                    id: id.to_string(),
                    name,
                    ..ProviderEntry::default()
                });
                self.providers.len() - 1
            }
        };
        let entry = &mut self.providers[idx];

        match data.get("models") {
            Some(Value::Object(models)) => {
                for (key, model) in models {
                    let canonical = model
                        .get("id")
                        .and_then(Value::as_str)
                        .filter(|s| !s.is_empty())
                        .unwrap_or(key.as_str())
                        .to_string();
                    let display = model
                        .get("name")
                        .and_then(Value::as_str)
                        .filter(|s| !s.is_empty())
                        .unwrap_or(canonical.as_str())
                        .to_string();
                    entry.add_alias(key.clone(), &canonical);
                    entry.add_model(canonical, display);
                }
            }
            Some(Value::Array(models)) => {
                for model in models {
                    let Some(m) = model.as_object() else { continue };
                    let Some(canonical) = m
                        .get("id")
                        .or_else(|| m.get("modelID"))
                        .and_then(Value::as_str)
                        .filter(|s| !s.is_empty())
                    else {
                        continue;
                    };
                    let display = m
                        .get("name")
                        .and_then(Value::as_str)
                        .filter(|s| !s.is_empty())
                        .unwrap_or(canonical)
                        .to_string();
                    entry.add_model(canonical.to_string(), display);
                }
            }
            _ => {}
        }
    }

    pub fn is_empty(&self) -> bool {
        self.providers.iter().all(|p| p.models.is_empty())
    }

    /// Map `spec` to the catalog's canonical ids, if the provider knows it.
    pub fn resolve(&self, spec: &ModelSpec) -> Option<(ModelSpec, &ProviderEntry)> {
        let provider = self.providers.iter().find(|p| p.id == spec.provider_id)?;
        let canonical = provider.canonical(&spec.model_id)?;
        Some((ModelSpec::new(&provider.id, canonical), provider))
    }

    /// The server's declared default when it resolves, else the first model
    /// listed.
    pub fn first_entry(&self) -> Option<(ModelSpec, &ProviderEntry)> {
        if let Some(found) = self.default.as_ref().and_then(|d| self.resolve(d)) {
            return Some(found);
        }
        self.providers.iter().find_map(|p| {
            let (id, _) = p.models.first()?;
            Some((ModelSpec::new(&p.id, id), p))
        })
    }
}

fn labelled(model: ModelSpec, provider: Option<&ProviderEntry>, source: ModelSource) -> ModelChoice {
    let (provider_label, model_label) = match provider {
        Some(p) => (
            Some(p.name.clone()),
            p.display_name(&model.model_id).map(str::to_string),
        ),
        None => (None, None),
    };
    ModelChoice {
        model: Some(model),
        source,
        provider_label,
        model_label,
    }
}

/// Pick the model for a run. `catalog` is `None` when the server's catalog
/// could not be fetched; candidates are then used unchecked.
pub fn resolve_model(
    override_spec: Option<&str>,
    config_file: Option<ModelSpec>,
    catalog: Option<&ProviderCatalog>,
) -> ModelChoice {
    let from_override = override_spec.and_then(|raw| {
        let parsed = ModelSpec::parse(raw);
        if parsed.is_none() {
            warn!(model = %raw, "ignoring model override (expected provider/model or provider:model)");
        }
        parsed
    });

    let candidates = [
        (from_override, ModelSource::Override),
        (config_file, ModelSource::ConfigFile),
    ];
    for (candidate, source) in candidates {
        let Some(spec) = candidate else { continue };
        match catalog {
            None => return labelled(spec, None, source),
            Some(cat) => match cat.resolve(&spec) {
                Some((canonical, provider)) => return labelled(canonical, Some(provider), source),
                None => warn!(model = %spec, %source, "model not offered by the running server; skipping"),
            },
        }
    }

    if let Some((spec, provider)) = catalog.and_then(ProviderCatalog::first_entry) {
        debug!(model = %spec, "using first model from server catalog");
        return labelled(spec, Some(provider), ModelSource::Catalog);
    }
    ModelChoice::server_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_splits_at_first_separator() {
        assert_eq!(
            ModelSpec::parse("openrouter:anthropic/claude-sonnet-4"),
            Some(ModelSpec::new("openrouter", "anthropic/claude-sonnet-4"))
        );
        assert_eq!(
            ModelSpec::parse("openrouter/deepseek/deepseek-r1:free"),
            Some(ModelSpec::new("openrouter", "deepseek/deepseek-r1:free"))
        );
        assert_eq!(ModelSpec::parse(" zai : glm-4.6 "), Some(ModelSpec::new("zai", "glm-4.6")));
        assert!(ModelSpec::parse("justamodel").is_none());
        assert!(ModelSpec::parse(":x").is_none());
        assert!(ModelSpec::parse("p/").is_none());
    }

    #[test]
    fn test_config_lookup_order() {
        let cfg = json!({
            "model": "top/level",
            "mode": {"build": {"model": "mode/model"}},
            "agent": {"build": {"model": "agent/model"}}
        });
        assert_eq!(model_from_config(&cfg, "build"), ModelSpec::parse("agent/model"));
        assert_eq!(model_from_config(&cfg, "plan"), ModelSpec::parse("top/level"));

        let cfg = json!({"mode": {"build": {"model": "mode/model"}}, "model": "bad"});
        assert_eq!(model_from_config(&cfg, "build"), ModelSpec::parse("mode/model"));

        let cfg = json!({"provider": {"local": {"models": {"qwen": {"id": "qwen3-coder"}}}}});
        assert_eq!(model_from_config(&cfg, "build"), Some(ModelSpec::new("local", "qwen3-coder")));

        assert!(model_from_config(&json!({"agent": "x", "model": 3}), "build").is_none());
    }

    #[test]
    fn test_catalog_three_shapes() {
        let a = ProviderCatalog::parse(&json!({
            "providers": [{"id": "anthropic", "name": "Anthropic",
                           "models": {"sonnet": {"id": "claude-sonnet-4", "name": "Claude Sonnet 4"}}}],
            "default": {"anthropic": "claude-sonnet-4"}
        }));
        assert_eq!(a.default, Some(ModelSpec::new("anthropic", "claude-sonnet-4")));
        let (spec, _) = a.resolve(&ModelSpec::new("anthropic", "sonnet")).unwrap();
        assert_eq!(spec.model_id, "claude-sonnet-4");
        let (spec, _) = a.resolve(&ModelSpec::new("anthropic", "Claude Sonnet 4")).unwrap();
        assert_eq!(spec.model_id, "claude-sonnet-4");

        let b = ProviderCatalog::parse(&json!({
            "zai": {"name": "Z.AI", "models": [{"id": "glm-4.6", "name": "GLM 4.6"}, 5]},
            "junk": 3,
            "other": {"unrelated": true}
        }));
        assert_eq!(b.providers.len(), 1);
        assert!(b.resolve(&ModelSpec::new("zai", "GLM 4.6")).is_some());

        let c = ProviderCatalog::parse(&json!([{"providerID": "local", "models": [{"modelID": "m1"}]}, "x"]));
        assert_eq!(c.first_entry().unwrap().0, ModelSpec::new("local", "m1"));

        assert!(ProviderCatalog::parse(&json!("nope")).is_empty());
    }

    #[test]
    fn test_resolution_order() {
        let catalog = ProviderCatalog::parse(&json!([
            {"id": "p1", "models": [{"id": "first"}, {"id": "second"}]},
            {"id": "p2", "models": [{"id": "other"}]}
        ]));

        let c = resolve_model(Some("p1/second"), ModelSpec::parse("p2/other"), Some(&catalog));
        assert_eq!(c.source, ModelSource::Override);
        assert_eq!(c.model, ModelSpec::parse("p1/second"));

        let c = resolve_model(Some("p9/missing"), ModelSpec::parse("p2/other"), Some(&catalog));
        assert_eq!(c.source, ModelSource::ConfigFile);

        let c = resolve_model(None, ModelSpec::parse("p9/missing"), Some(&catalog));
        assert_eq!(c.source, ModelSource::Catalog);
        assert_eq!(c.model, ModelSpec::parse("p1/first"));

        let c = resolve_model(None, None, Some(&ProviderCatalog::default()));
        assert_eq!(c.source, ModelSource::ServerDefault);
        assert!(c.model.is_none());

        let c = resolve_model(Some("any/thing"), None, None);
        assert_eq!(c.source, ModelSource::Override);
    }
}

//! CR-003: Declaration resolution and template rendering.
//!
//! Turns a parsed stack declaration into a [`StackConfig`]:
//! range names are unrolled, each concrete instance is validated, and every
//! string leaf is rendered against `{{ instance.name }}`. Plan references are
//! left in place; the pipeline substitutes plan blocks at prepare time.

use super::error::ConfigError;
use super::parser;
use super::types::*;
use indexmap::IndexMap;
use serde_json::Value;

const STAGE_KEYS: [&str; 3] = ["initializer", "orchestrator", "configurer"];

/// Variables visible to templates for one instance.
#[derive(Debug, Clone, Default)]
pub struct TemplateVars {
    values: IndexMap<String, String>,
}

impl TemplateVars {
    /// Variables bound for the concrete instance `name`.
    pub fn for_instance(name: &str) -> Self {
        let mut values = IndexMap::new();
        values.insert("instance.name".to_string(), name.to_string());
        Self { values }
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.values.get(key).map(String::as_str)
    }
}

/// Resolve all template variables in a string.
pub fn render_template(template: &str, vars: &TemplateVars) -> Result<String, String> {
    let mut result = template.to_string();
    let mut start = 0;

    while let Some(open) = result[start..].find("{{") {
        let open = start + open;
        let close = result[open..]
            .find("}}")
            .ok_or_else(|| format!("unclosed template at position {}", open))?;
        let close = open + close + 2;
        let key = result[open + 2..close - 2].trim();

        let value = vars
            .get(key)
            .ok_or_else(|| format!("unknown template variable: {}", key))?
            .to_string();

        result.replace_range(open..close, &value);
        start = open + value.len();
    }

    Ok(result)
}

/// Render every string leaf of a value tree; other scalars pass through.
pub fn render_value(value: &Value, vars: &TemplateVars) -> Result<Value, String> {
    match value {
        Value::String(s) => render_template(s, vars).map(Value::String),
        Value::Array(items) => items
            .iter()
            .map(|v| render_value(v, vars))
            .collect::<Result<Vec<_>, _>>()
            .map(Value::Array),
        Value::Object(map) => {
            let mut out = serde_json::Map::with_capacity(map.len());
            for (k, v) in map {
                out.insert(k.clone(), render_value(v, vars)?);
            }
            Ok(Value::Object(out))
        }
        other => Ok(other.clone()),
    }
}

/// Render the stage blocks of a plan for a concrete instance.
pub fn render_blocks(blocks: &StageBlocks, instance: &str) -> Result<StageBlocks, ConfigError> {
    let template_err = |reason: String| ConfigError::Template {
        instance: instance.to_string(),
        reason,
    };
    let raw = serde_json::to_value(blocks).map_err(|e| template_err(e.to_string()))?;
    let rendered = render_value(&raw, &TemplateVars::for_instance(instance)).map_err(template_err)?;
    serde_json::from_value(rendered).map_err(|e| {
        ConfigError::InvalidDeclaration(format!("instance '{}': {}", instance, e))
    })
}

/// Check that every stage block present in `raw` has a provider and settings.
///
/// `owner` names the instance or plan in errors. With `require_block`, at least
/// one stage block must be declared.
pub fn validate_blocks(owner: &str, raw: &Value, require_block: bool) -> Result<(), ConfigError> {
    let map = raw.as_object().ok_or_else(|| {
        ConfigError::InvalidDeclaration(format!("'{}' must be a mapping", owner))
    })?;
    let mut found = false;
    for key in STAGE_KEYS {
        let Some(block) = map.get(key) else {
            continue;
        };
        found = true;
        let provider = block.get("provider").filter(|p| !p.is_null());
        match provider {
            Some(p) if p.get("name").and_then(Value::as_str).is_some() => {}
            _ => {
                return Err(ConfigError::MissingProvider {
                    instance: owner.to_string(),
                })
            }
        }
        if block.get("settings").filter(|s| !s.is_null()).is_none() {
            return Err(ConfigError::MissingSettings {
                instance: owner.to_string(),
            });
        }
    }
    if require_block && !found {
        return Err(ConfigError::MissingProvider {
            instance: owner.to_string(),
        });
    }
    Ok(())
}

/// `{provider, settings}` without stage keys is shorthand for an orchestrator block.
fn normalize_instance(raw: &Value) -> Value {
    let Some(map) = raw.as_object() else {
        return raw.clone();
    };
    let has_stage = STAGE_KEYS.iter().any(|k| map.contains_key(*k));
    let bare = map.contains_key("provider") || map.contains_key("settings");
    if has_stage || !bare || map.contains_key("plan") {
        return raw.clone();
    }
    let mut wrapped = serde_json::Map::new();
    wrapped.insert("orchestrator".to_string(), raw.clone());
    Value::Object(wrapped)
}

/// Resolve one declared (possibly ranged) instance into its concrete configs.
pub fn resolve_instance(
    declared_name: &str,
    raw: &Value,
) -> Result<Vec<(String, InstanceConfig)>, ConfigError> {
    let raw = normalize_instance(raw);
    let mut resolved = Vec::new();

    for name in parser::expand_range(declared_name)? {
        let plan = raw.get("plan");
        match plan {
            Some(Value::String(_)) => validate_blocks(&name, &raw, false)?,
            Some(_) => {
                return Err(ConfigError::InvalidDeclaration(format!(
                    "instance '{}': plan must be a plan name",
                    name
                )))
            }
            None => validate_blocks(&name, &raw, true)?,
        }

        let rendered = render_value(&raw, &TemplateVars::for_instance(&name)).map_err(|reason| {
            ConfigError::Template {
                instance: name.clone(),
                reason,
            }
        })?;
        let config: InstanceConfig = serde_json::from_value(rendered).map_err(|e| {
            ConfigError::InvalidDeclaration(format!("instance '{}': {}", name, e))
        })?;
        resolved.push((name, config));
    }

    Ok(resolved)
}

/// Resolve a parsed stack declaration.
pub fn resolve_declaration(declaration: &Value) -> Result<StackConfig, ConfigError> {
    let instances = declaration
        .get("instances")
        .ok_or_else(|| ConfigError::InvalidDeclaration("missing 'instances' section".to_string()))?
        .as_object()
        .ok_or_else(|| {
            ConfigError::InvalidDeclaration("'instances' must be a mapping".to_string())
        })?;

    let mut config = StackConfig::default();
    for (declared_name, raw) in instances {
        for (name, instance) in resolve_instance(declared_name, raw)? {
            if config.instances.contains_key(&name) {
                return Err(ConfigError::DuplicateInstance { instance: name });
            }
            config.instances.insert(name, instance);
        }
    }

    if let Some(pools) = declaration.get("pools").filter(|p| !p.is_null()) {
        config.pools = serde_json::from_value(pools.clone())
            .map_err(|e| ConfigError::InvalidDeclaration(format!("pools: {}", e)))?;
    }

    Ok(config)
}

/// Pool members that exist in the resolved instance map, ranges expanded.
pub fn pool_members(
    pool: &PoolDeclaration,
    instances: &IndexMap<String, InstanceConfig>,
) -> Result<Vec<String>, ConfigError> {
    Ok(parser::expand_names(&pool.instances)?
        .into_iter()
        .filter(|name| instances.contains_key(name))
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn orchestrated(kwargs: Value) -> Value {
        json!({
            "orchestrator": {
                "provider": {"name": "local"},
                "settings": {"kwargs": kwargs}
            }
        })
    }

    #[test]
    fn test_cr003_render_instance_name() {
        let vars = TemplateVars::for_instance("node01");
        let result = render_template("host-{{ instance.name }}.lan", &vars).unwrap();
        assert_eq!(result, "host-node01.lan");
    }

    #[test]
    fn test_cr003_render_multiple() {
        let vars = TemplateVars::for_instance("x");
        let result = render_template("{{instance.name}}-{{instance.name}}", &vars).unwrap();
        assert_eq!(result, "x-x");
    }

    #[test]
    fn test_cr003_render_unknown_variable() {
        let vars = TemplateVars::for_instance("x");
        let result = render_template("{{ params.missing }}", &vars);
        assert!(result.unwrap_err().contains("unknown template variable"));
    }

    #[test]
    fn test_cr003_render_unclosed() {
        let vars = TemplateVars::for_instance("x");
        assert!(render_template("{{ instance.name", &vars).is_err());
    }

    #[test]
    fn test_cr003_render_value_walks_nested() {
        let vars = TemplateVars::for_instance("db01");
        let value = json!({
            "name": "{{ instance.name }}",
            "tags": ["a", "{{ instance.name }}-tag"],
            "nested": {"cpu": 4, "enabled": true, "host": "{{instance.name}}"},
            "none": null
        });
        let out = render_value(&value, &vars).unwrap();
        assert_eq!(out["name"], "db01");
        assert_eq!(out["tags"][1], "db01-tag");
        assert_eq!(out["nested"]["cpu"], 4);
        assert_eq!(out["nested"]["enabled"], true);
        assert_eq!(out["nested"]["host"], "db01");
        assert!(out["none"].is_null());
    }

    #[test]
    fn test_cr003_range_expansion_binds_each_name() {
        let decl = json!({
            "instances": {
                "node[01-03]": orchestrated(json!({"hostname": "{{ instance.name }}", "size": 2}))
            }
        });
        let config = resolve_declaration(&decl).unwrap();
        let names: Vec<_> = config.instances.keys().cloned().collect();
        assert_eq!(names, vec!["node01", "node02", "node03"]);
        for (name, instance) in &config.instances {
            let settings = &instance.blocks.orchestrator.as_ref().unwrap().settings;
            assert_eq!(settings.kwargs["hostname"], json!(name));
            assert_eq!(settings.kwargs["size"], 2);
        }
    }

    #[test]
    fn test_cr003_missing_provider() {
        let decl = json!({
            "instances": {"web": {"orchestrator": {"settings": {}}}}
        });
        let err = resolve_declaration(&decl).unwrap_err();
        assert_eq!(
            err,
            ConfigError::MissingProvider {
                instance: "web".to_string()
            }
        );
    }

    #[test]
    fn test_cr003_missing_settings_names_concrete_instance() {
        let decl = json!({
            "instances": {"web[1-2]": {"orchestrator": {"provider": {"name": "local"}}}}
        });
        let err = resolve_declaration(&decl).unwrap_err();
        assert_eq!(
            err,
            ConfigError::MissingSettings {
                instance: "web01".to_string()
            }
        );
    }

    #[test]
    fn test_cr003_provider_without_name() {
        let decl = json!({
            "instances": {"web": {"initializer": {"provider": {"driver": "x"}, "settings": {}}}}
        });
        assert!(matches!(
            resolve_declaration(&decl),
            Err(ConfigError::MissingProvider { .. })
        ));
    }

    #[test]
    fn test_cr003_no_blocks_is_missing_provider() {
        let decl = json!({"instances": {"web": {}}});
        assert!(matches!(
            resolve_declaration(&decl),
            Err(ConfigError::MissingProvider { .. })
        ));
    }

    #[test]
    fn test_cr003_bare_provider_settings_is_orchestrator() {
        let decl = json!({
            "instances": {"web": {"provider": {"name": "local"}, "settings": {"args": [1]}}}
        });
        let config = resolve_declaration(&decl).unwrap();
        let orch = config.instances["web"].blocks.orchestrator.as_ref().unwrap();
        assert_eq!(orch.provider.name, "local");
        assert_eq!(orch.settings.args, vec![json!(1)]);
    }

    #[test]
    fn test_cr003_bare_provider_without_settings() {
        let decl = json!({"instances": {"web": {"provider": {"name": "local"}}}});
        assert!(matches!(
            resolve_declaration(&decl),
            Err(ConfigError::MissingSettings { .. })
        ));
    }

    #[test]
    fn test_cr003_plan_reference_is_deferred() {
        let decl = json!({"instances": {"app[1-2]": {"plan": "small"}}});
        let config = resolve_declaration(&decl).unwrap();
        assert_eq!(config.instances.len(), 2);
        assert_eq!(config.instances["app01"].plan.as_deref(), Some("small"));
        assert!(config.instances["app01"].blocks.is_empty());
    }

    #[test]
    fn test_cr003_plan_must_be_string() {
        let decl = json!({"instances": {"app": {"plan": 3}}});
        assert!(matches!(
            resolve_declaration(&decl),
            Err(ConfigError::InvalidDeclaration(_))
        ));
    }

    #[test]
    fn test_cr003_duplicate_after_expansion() {
        let decl = json!({
            "instances": {
                "n[1-2]": orchestrated(json!({})),
                "n02": orchestrated(json!({}))
            }
        });
        assert_eq!(
            resolve_declaration(&decl).unwrap_err(),
            ConfigError::DuplicateInstance {
                instance: "n02".to_string()
            }
        );
    }

    #[test]
    fn test_cr003_missing_instances_section() {
        assert!(matches!(
            resolve_declaration(&json!({"pools": {}})),
            Err(ConfigError::InvalidDeclaration(_))
        ));
    }

    #[test]
    fn test_cr003_template_error_names_instance() {
        let decl = json!({"instances": {"web": orchestrated(json!({"x": "{{ nope }}"}))}});
        match resolve_declaration(&decl) {
            Err(ConfigError::Template { instance, .. }) => assert_eq!(instance, "web"),
            other => panic!("unexpected: {:?}", other),
        }
    }

    #[test]
    fn test_cr003_pools_unmodified_and_resolved_late() {
        let decl = json!({
            "instances": {"node[01-02]": orchestrated(json!({}))},
            "pools": {"workers": {"instances": ["node[01-03]", "ghost"]}}
        });
        let config = resolve_declaration(&decl).unwrap();
        assert_eq!(config.pools["workers"].instances, vec!["node[01-03]", "ghost"]);
        let members = pool_members(&config.pools["workers"], &config.instances).unwrap();
        assert_eq!(members, vec!["node01", "node02"]);
    }

    #[test]
    fn test_cr003_render_blocks_for_plan() {
        let blocks: StageBlocks = serde_json::from_value(json!({
            "orchestrator": {
                "provider": {"name": "local"},
                "settings": {"kwargs": {"name": "{{ instance.name }}"}}
            }
        }))
        .unwrap();
        let rendered = render_blocks(&blocks, "app01").unwrap();
        assert_eq!(
            rendered.orchestrator.unwrap().settings.kwargs["name"],
            "app01"
        );
    }
}

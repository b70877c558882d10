//! Parameter templating and condition evaluation.
//!
//! String parameters are rendered with minijinja against a context built from
//! playbook vars, the host fact table and a few host identity keys. Undefined
//! variables are errors: a typo in a parameter must fail the task instead of
//! running a command with an empty substitution.

use minijinja::{Environment, UndefinedBehavior};
use serde_json::{Map, Value};

use crate::inventory::{Host, HostFacts};
use crate::modules::ModuleParams;
use crate::playbook::Vars;

/// Minijinja environment shared by all hosts of a run
pub struct TemplateEngine {
    env: Environment<'static>,
}

impl std::fmt::Debug for TemplateEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TemplateEngine").finish_non_exhaustive()
    }
}

impl Default for TemplateEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl TemplateEngine {
    /// Create an engine with strict undefined handling
    pub fn new() -> Self {
        let mut env = Environment::new();
        env.set_undefined_behavior(UndefinedBehavior::Strict);
        Self { env }
    }

    /// Build the rendering context for one host.
    ///
    /// Facts shadow vars of the same name; both are also reachable through
    /// the `vars` and `facts` namespaces.
    pub fn context(vars: &Vars, facts: &HostFacts, host: &Host) -> Value {
        let mut ctx = Map::new();
        for (k, v) in vars {
            ctx.insert(k.clone(), v.clone());
        }
        for (k, v) in facts {
            ctx.insert(k.clone(), v.clone());
        }
        ctx.insert("inventory_hostname".into(), Value::String(host.name.clone()));
        ctx.insert("ansible_host".into(), Value::String(host.address.clone()));
        ctx.insert(
            "group_names".into(),
            Value::Array(host.groups.iter().cloned().map(Value::String).collect()),
        );
        ctx.insert(
            "vars".into(),
            Value::Object(vars.iter().map(|(k, v)| (k.clone(), v.clone())).collect()),
        );
        ctx.insert(
            "facts".into(),
            Value::Object(facts.iter().map(|(k, v)| (k.clone(), v.clone())).collect()),
        );
        Value::Object(ctx)
    }

    /// Render one template string
    pub fn render_str(&self, template: &str, ctx: &Value) -> Result<String, minijinja::Error> {
        if !is_template(template) {
            return Ok(template.to_string());
        }
        self.env.render_str(template, ctx)
    }

    /// Render every string inside a JSON value
    pub fn render_value(&self, value: &Value, ctx: &Value) -> Result<Value, minijinja::Error> {
        Ok(match value {
            Value::String(s) => Value::String(self.render_str(s, ctx)?),
            Value::Array(items) => Value::Array(
                items
                    .iter()
                    .map(|v| self.render_value(v, ctx))
                    .collect::<Result<_, _>>()?,
            ),
            Value::Object(map) => {
                let mut out = Map::with_capacity(map.len());
                for (k, v) in map {
                    out.insert(k.clone(), self.render_value(v, ctx)?);
                }
                Value::Object(out)
            }
            other => other.clone(),
        })
    }

    /// Render all task parameters
    pub fn render_params(
        &self,
        params: &ModuleParams,
        ctx: &Value,
    ) -> Result<ModuleParams, minijinja::Error> {
        params
            .iter()
            .map(|(k, v)| Ok((k.clone(), self.render_value(v, ctx)?)))
            .collect()
    }

    /// Evaluate a `when` condition.
    ///
    /// Bare expressions (`splunk_type == "indexer"`) are compiled as
    /// expressions; templated strings are rendered and the result is checked
    /// for a truthy spelling.
    pub fn evaluate(&self, condition: &str, ctx: &Value) -> Result<bool, minijinja::Error> {
        if is_template(condition) {
            let rendered = self.env.render_str(condition, ctx)?;
            return Ok(matches!(
                rendered.trim().to_lowercase().as_str(),
                "true" | "yes" | "1"
            ));
        }
        let expr = self.env.compile_expression(condition)?;
        Ok(expr.eval(ctx)?.is_true())
    }
}

fn is_template(s: &str) -> bool {
    s.contains("{{") || s.contains("{%")
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn ctx() -> Value {
        let mut vars = Vars::new();
        vars.insert("target_version".into(), json!("9.1.2"));
        vars.insert("splunk_home".into(), json!("/opt/splunk"));
        let mut facts = HostFacts::new();
        facts.insert("splunk_type".into(), json!("indexer"));
        facts.insert("splunk_home".into(), json!("/opt/splunkforwarder"));
        let host = Host::with_address("idx1", "10.0.0.9").in_group("indexers");
        TemplateEngine::context(&vars, &facts, &host)
    }

    #[test]
    fn test_render_params() {
        let engine = TemplateEngine::new();
        let mut params = ModuleParams::new();
        params.insert("version".into(), json!("{{ target_version }}"));
        params.insert("hosts".into(), json!(["{{ inventory_hostname }}", "static"]));
        params.insert("retries".into(), json!(3));

        let rendered = engine.render_params(&params, &ctx()).unwrap();
        assert_eq!(rendered["version"], json!("9.1.2"));
        assert_eq!(rendered["hosts"], json!(["idx1", "static"]));
        assert_eq!(rendered["retries"], json!(3));
    }

    #[test]
    fn test_facts_shadow_vars() {
        let engine = TemplateEngine::new();
        let out = engine.render_str("{{ splunk_home }}", &ctx()).unwrap();
        assert_eq!(out, "/opt/splunkforwarder");
        let out = engine.render_str("{{ vars.splunk_home }}", &ctx()).unwrap();
        assert_eq!(out, "/opt/splunk");
    }

    #[test]
    fn test_undefined_is_error() {
        let engine = TemplateEngine::new();
        assert!(engine.render_str("{{ nope }}", &ctx()).is_err());
    }

    #[test]
    fn test_evaluate_conditions() {
        let engine = TemplateEngine::new();
        assert!(engine.evaluate("splunk_type == 'indexer'", &ctx()).unwrap());
        assert!(!engine.evaluate("splunk_type == 'forwarder'", &ctx()).unwrap());
        assert!(engine
            .evaluate("'indexers' in group_names", &ctx())
            .unwrap());
        assert!(engine
            .evaluate("{{ target_version is startingwith('9') }}", &ctx())
            .unwrap());
    }
}

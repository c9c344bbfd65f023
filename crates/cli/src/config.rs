//! Service description file.
//!
//! ```yaml
//! service: my-service
//! provider:
//!   namespace: default
//!   runtime: python2.7
//!   hostname: api.example.com
//!   ingress:
//!     annotations: { kubernetes.io/tls-acme: "true" }
//! functions:
//!   hello:
//!     handler: handler.hello
//!     contentFile: handler.py
//!     events:
//!       - type: http
//!         path: /hello
//! ```

use std::collections::BTreeMap;
use std::path::Path;

use anyhow::{bail, Context, Result};
use serde::Deserialize;
use serde_json::Value as Json;
use skiff_core::{FunctionSpec, ProviderDefaults};
use skiff_ingress::IngressOptions;

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IngressSection {
    #[serde(default)]
    pub annotations: BTreeMap<String, String>,
    #[serde(default)]
    pub tls: Option<Json>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProviderSection {
    #[serde(flatten)]
    pub defaults: ProviderDefaults,
    #[serde(default)]
    pub hostname: Option<String>,
    #[serde(default)]
    pub ingress: IngressSection,
}

#[derive(Debug, Clone)]
pub struct ServiceConfig {
    pub service: String,
    pub provider: ProviderSection,
    /// In file order.
    pub functions: Vec<FunctionSpec>,
}

#[derive(Deserialize)]
struct RawConfig {
    service: String,
    #[serde(default)]
    provider: Option<ProviderSection>,
    #[serde(default)]
    functions: serde_yaml::Mapping,
}

impl ServiceConfig {
    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
        let base = path.parent().unwrap_or_else(|| Path::new("."));
        Self::parse(&text, base).with_context(|| format!("parsing {}", path.display()))
    }

    /// Parse a description; `contentFile` entries resolve against `base`.
    pub fn parse(text: &str, base: &Path) -> Result<Self> {
        let raw: RawConfig = serde_yaml::from_str(text)?;
        let mut functions = Vec::with_capacity(raw.functions.len());
        for (key, value) in raw.functions {
            let id = match key.as_str() {
                Some(id) => id.to_string(),
                None => bail!("function names must be strings"),
            };
            let mut doc = serde_json::to_value(&value).with_context(|| format!("function {}", id))?;
            let Some(obj) = doc.as_object_mut() else {
                bail!("function {} must be a mapping", id);
            };
            if let Some(file) = obj.remove("contentFile") {
                let rel = file.as_str().unwrap_or_default();
                let content = std::fs::read_to_string(base.join(rel))
                    .with_context(|| format!("reading content of function {} from {}", id, rel))?;
                obj.insert("content".into(), Json::String(content));
            }
            obj.insert("id".into(), Json::String(id.clone()));
            let spec: FunctionSpec = serde_json::from_value(doc).with_context(|| format!("function {}", id))?;
            functions.push(spec);
        }
        Ok(Self { service: raw.service, provider: raw.provider.unwrap_or_default(), functions })
    }

    pub fn ingress_options(&self) -> IngressOptions {
        IngressOptions {
            hostname: self.provider.hostname.clone(),
            additional_annotations: self.provider.ingress.annotations.clone(),
            tls: self.provider.ingress.tls.clone(),
            ..IngressOptions::default()
        }
    }

    /// The named function alone, or an error naming the unknown function.
    pub fn only(&self, name: &str) -> Result<Vec<FunctionSpec>> {
        match self.functions.iter().find(|f| f.id == name) {
            Some(f) => Ok(vec![f.clone()]),
            None => bail!("function {} not found in service {}", name, self.service),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    const SAMPLE: &str = r#"
service: my-service
provider:
  namespace: staging
  runtime: python2.7
  memorySize: 256
  environment: { STAGE: dev }
  hostname: api.example.com
  ingress:
    annotations: { "kubernetes.io/tls-acme": "true" }
functions:
  zeta:
    handler: handler.zeta
    content: "def zeta(): pass"
    events:
      - type: trigger
        topic: orders
  alpha:
    handler: handler.alpha
    port: 9000
    labels: { tier: 1 }
"#;

    #[test]
    fn functions_keep_file_order_and_take_ids_from_keys() {
        let cfg = ServiceConfig::parse(SAMPLE, Path::new(".")).unwrap();
        assert_eq!(cfg.service, "my-service");
        let ids: Vec<_> = cfg.functions.iter().map(|f| f.id.as_str()).collect();
        assert_eq!(ids, vec!["zeta", "alpha"]);
        assert_eq!(cfg.functions[0].events[0].topic.as_deref(), Some("orders"));
        assert_eq!(cfg.functions[1].port, Some(9000));
        assert_eq!(cfg.functions[1].labels["tier"], json!(1));
    }

    #[test]
    fn provider_section_feeds_defaults_and_routing() {
        let cfg = ServiceConfig::parse(SAMPLE, Path::new(".")).unwrap();
        assert_eq!(cfg.provider.defaults.namespace, "staging");
        assert_eq!(cfg.provider.defaults.runtime.as_deref(), Some("python2.7"));
        assert_eq!(cfg.provider.defaults.content_type, "text");
        assert_eq!(cfg.provider.defaults.environment, Some(json!({ "STAGE": "dev" })));
        let ing = cfg.ingress_options();
        assert_eq!(ing.hostname.as_deref(), Some("api.example.com"));
        assert_eq!(ing.additional_annotations["kubernetes.io/tls-acme"], "true");
    }

    #[test]
    fn missing_provider_uses_defaults() {
        let cfg = ServiceConfig::parse("service: s\nfunctions:\n  f:\n    handler: h.f\n", Path::new(".")).unwrap();
        assert_eq!(cfg.provider.defaults.namespace, "default");
        assert_eq!(cfg.functions.len(), 1);
    }

    #[test]
    fn content_file_is_read_relative_to_the_description() {
        let dir = std::env::temp_dir().join(format!("skiffctl-config-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        std::fs::write(dir.join("handler.py"), "def hello(): return 1\n").unwrap();
        let text = "service: s\nfunctions:\n  hello:\n    handler: handler.hello\n    contentFile: handler.py\n";
        let cfg = ServiceConfig::parse(text, &dir).unwrap();
        assert_eq!(cfg.functions[0].content, "def hello(): return 1\n");
        std::fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn unknown_function_is_an_error() {
        let cfg = ServiceConfig::parse(SAMPLE, Path::new(".")).unwrap();
        assert_eq!(cfg.only("alpha").unwrap()[0].id, "alpha");
        let err = cfg.only("nope").unwrap_err().to_string();
        assert!(err.contains("nope"), "{}", err);
    }
}

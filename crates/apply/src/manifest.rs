//! Function manifest synthesis: a pure projection of a [`FunctionSpec`] and
//! the provider defaults onto the `Function` resource shape.

use std::collections::BTreeMap;

use serde_json::Value as Json;
use skiff_core::manifest::{
    Container, DeploymentSpec, DeploymentTemplate, FunctionBody, ManifestMeta, PodSpec, PodTemplate, Resources,
    SecretSource, ServicePort, ServiceSpec, Volume, VolumeMount,
};
use skiff_core::{Event, FunctionManifest, FunctionSpec, ProviderDefaults, Quantity, SpecError};
use skiff_core::{DEFAULT_PORT, DEFAULT_TIMEOUT_SECS, FUNCTION_LABEL};

pub const DESCRIPTION_ANNOTATION: &str = "kubeless.serverless.com/description";

/// Render an arbitrary JSON scalar the way label values must be written.
pub fn force_string(v: &Json) -> String {
    match v {
        Json::String(s) => s.clone(),
        Json::Null => "null".to_string(),
        other => other.to_string(),
    }
}

/// Memory without a unit is taken as mebibytes.
pub fn memory_with_unit(q: &Quantity) -> String {
    let s = q.to_string();
    if s.ends_with(|c: char| c.is_ascii_digit()) { format!("{}Mi", s) } else { s }
}

/// Normalize an `environment` block (mapping or list) into ordered env entries.
pub fn parse_env(function: &str, src: &Json) -> Result<Vec<Json>, SpecError> {
    match src {
        Json::Object(map) => Ok(map
            .iter()
            .map(|(k, v)| serde_json::json!({ "name": k, "value": force_string(v) }))
            .collect()),
        Json::Array(items) => Ok(items.clone()),
        _ => Err(SpecError::MalformedEnvironment { function: function.to_string() }),
    }
}

/// Build the target manifest. Fails without producing a partial manifest
/// when the function is invalid.
pub fn synthesize(f: &FunctionSpec, defaults: &ProviderDefaults) -> Result<FunctionManifest, SpecError> {
    let event = f.event()?;
    let runtime = f
        .runtime
        .clone()
        .or_else(|| defaults.runtime.clone())
        .ok_or_else(|| SpecError::MissingRuntime { function: f.id.clone() })?;
    let namespace = f.namespace.clone().unwrap_or_else(|| defaults.namespace.clone());

    let mut env: Option<Vec<Json>> = match &defaults.environment {
        Some(e) => Some(parse_env(&f.id, e)?),
        None => None,
    };
    if let Some(fe) = &f.environment {
        let fenv = parse_env(&f.id, fe)?;
        env = Some(match env { Some(mut pe) => { pe.extend(fenv); pe } None => fenv });
    }

    let user_labels: BTreeMap<String, String> = f.labels.iter().map(|(k, v)| (k.clone(), force_string(v))).collect();
    let mut labels = user_labels.clone();
    labels.insert("created-by".into(), "kubeless".into());
    labels.insert(FUNCTION_LABEL.into(), f.id.clone());
    let mut selector = user_labels;
    selector.insert(FUNCTION_LABEL.into(), f.id.clone());

    let mut annotations = f.annotations.clone();
    if let Some(desc) = f.description.as_deref().filter(|d| !d.is_empty()) {
        annotations.insert(DESCRIPTION_ANNOTATION.into(), desc.to_string());
    }

    let port = f.port.unwrap_or(DEFAULT_PORT);
    let timeout = f.timeout.or(defaults.timeout).unwrap_or(DEFAULT_TIMEOUT_SECS);
    let (topic, schedule) = match &event {
        Event::Http { .. } => (None, None),
        Event::Trigger { topic } => (Some(topic.clone()), None),
        Event::Schedule { schedule } => (None, Some(schedule.clone())),
    };

    let template = pod_template(f, defaults, env);

    Ok(FunctionManifest {
        api_version: format!("{}/{}", skiff_core::manifest::API_GROUP, skiff_core::manifest::API_VERSION),
        kind: skiff_core::manifest::KIND.to_string(),
        metadata: ManifestMeta { name: f.id.clone(), namespace, labels, annotations },
        spec: FunctionBody {
            deps: f.deps.clone().unwrap_or_default(),
            function: f.content.clone(),
            content_type: f.content_type.clone().unwrap_or_else(|| defaults.content_type.clone()),
            handler: f.handler.clone().unwrap_or_default(),
            runtime,
            timeout: timeout.to_string(),
            service: ServiceSpec {
                ports: vec![ServicePort { name: "http-function-port".into(), port, protocol: "TCP".into(), target_port: port }],
                selector,
                service_type: "ClusterIP".into(),
            },
            function_type: event.function_type().to_string(),
            topic,
            schedule,
            template,
        },
    })
}

fn pod_template(f: &FunctionSpec, defaults: &ProviderDefaults, env: Option<Vec<Json>>) -> Option<DeploymentTemplate> {
    let memory = f.memory_size.as_ref().or(defaults.memory_size.as_ref()).map(memory_with_unit);
    let cpu = f.cpu.as_ref().or(defaults.cpu.as_ref()).map(|c| c.to_string());
    let affinity = f.affinity.clone().or_else(|| defaults.affinity.clone());
    let tolerations = f.tolerations.clone().or_else(|| defaults.tolerations.clone());

    let customized = f.image.is_some()
        || env.is_some()
        || memory.is_some()
        || cpu.is_some()
        || !f.secrets.is_empty()
        || affinity.is_some()
        || tolerations.is_some();
    if !customized {
        return None;
    }

    let resources = if memory.is_some() || cpu.is_some() {
        let mut r = Resources::default();
        for (key, val) in [("memory", memory), ("cpu", cpu)] {
            if let Some(v) = val {
                r.limits.insert(key.into(), v.clone());
                r.requests.insert(key.into(), v);
            }
        }
        Some(r)
    } else {
        None
    };

    let volume_mounts = f
        .secrets
        .iter()
        .map(|s| VolumeMount { name: format!("{}-vol", s), mount_path: format!("/{}", s) })
        .collect();
    let volumes = f
        .secrets
        .iter()
        .map(|s| Volume { name: format!("{}-vol", s), secret: SecretSource { secret_name: s.clone() } })
        .collect();

    Some(DeploymentTemplate {
        spec: DeploymentSpec {
            template: PodTemplate {
                spec: PodSpec {
                    containers: vec![Container { name: f.id.clone(), image: f.image.clone(), env, resources, volume_mounts }],
                    volumes,
                    affinity,
                    tolerations,
                },
            },
        },
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use skiff_core::EventSpec;

    fn defaults() -> ProviderDefaults {
        ProviderDefaults { runtime: Some("python2.7".into()), ..Default::default() }
    }

    fn container(m: &FunctionManifest) -> &Container {
        &m.spec.template.as_ref().expect("template").spec.template.spec.containers[0]
    }

    #[test]
    fn hello_manifest_is_http_with_function_selector() {
        let mut f = FunctionSpec::new("hello", "f.hello");
        f.content = "def hello(): pass".into();
        let m = synthesize(&f, &defaults()).unwrap();
        assert_eq!(m.spec.function_type, "HTTP");
        assert_eq!(m.spec.service.selector, BTreeMap::from([("function".to_string(), "hello".to_string())]));
        assert_eq!(m.spec.service.ports[0].port, 8080);
        assert_eq!(m.spec.timeout, "180");
        assert_eq!(m.metadata.labels.get("created-by").map(String::as_str), Some("kubeless"));
        assert!(m.spec.template.is_none());
        let doc = m.to_json().unwrap();
        assert_eq!(doc["spec"]["function-content-type"], json!("text"));
        assert_eq!(doc["kind"], json!("Function"));
    }

    #[test]
    fn synthesis_is_deterministic() {
        let mut f = FunctionSpec::new("a", "h.a");
        f.labels.insert("tier".into(), json!(1));
        f.environment = Some(json!({"B": 2, "A": "x"}));
        f.secrets = vec!["s1".into()];
        let a = serde_json::to_string(&synthesize(&f, &defaults()).unwrap()).unwrap();
        let b = serde_json::to_string(&synthesize(&f, &defaults()).unwrap()).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn memory_suffix_only_added_to_bare_numbers() {
        assert_eq!(memory_with_unit(&Quantity::Int(128)), "128Mi");
        assert_eq!(memory_with_unit(&Quantity::Text("128".into())), "128Mi");
        assert_eq!(memory_with_unit(&Quantity::Text("128Gi".into())), "128Gi");

        let mut f = FunctionSpec::new("m", "h.m");
        f.memory_size = Some(Quantity::Int(256));
        f.cpu = Some(Quantity::Text("500m".into()));
        let m = synthesize(&f, &defaults()).unwrap();
        let r = container(&m).resources.as_ref().unwrap();
        assert_eq!(r.limits.get("memory"), Some(&"256Mi".to_string()));
        assert_eq!(r.requests.get("memory"), Some(&"256Mi".to_string()));
        assert_eq!(r.limits.get("cpu"), r.requests.get("cpu"));
    }

    #[test]
    fn environment_mapping_keeps_order_and_provider_goes_first() {
        let mut d = defaults();
        d.environment = Some(json!([{ "name": "P", "valueFrom": { "secretKeyRef": { "name": "s", "key": "k" } } }]));
        let mut f = FunctionSpec::new("e", "h.e");
        f.environment = Some(json!({ "ZED": 1, "ALPHA": true }));
        let m = synthesize(&f, &d).unwrap();
        let env = container(&m).env.clone().unwrap();
        let names: Vec<_> = env.iter().map(|e| e["name"].as_str().unwrap().to_string()).collect();
        assert_eq!(names, vec!["P", "ZED", "ALPHA"]);
        assert_eq!(env[1]["value"], json!("1"));
        assert_eq!(env[2]["value"], json!("true"));
        assert!(env[0].get("valueFrom").is_some());
    }

    #[test]
    fn malformed_environment_fails() {
        let mut f = FunctionSpec::new("e", "h.e");
        f.environment = Some(json!("A=1"));
        assert_eq!(synthesize(&f, &defaults()).unwrap_err(), SpecError::MalformedEnvironment { function: "e".into() });
    }

    #[test]
    fn secrets_become_volumes_and_mounts() {
        let mut f = FunctionSpec::new("s", "h.s");
        f.secrets = vec!["creds".into()];
        let m = synthesize(&f, &defaults()).unwrap();
        let pod = &m.spec.template.as_ref().unwrap().spec.template.spec;
        assert_eq!(pod.volumes[0].name, "creds-vol");
        assert_eq!(pod.volumes[0].secret.secret_name, "creds");
        assert_eq!(pod.containers[0].volume_mounts[0].mount_path, "/creds");
    }

    #[test]
    fn event_kinds_map_to_function_types() {
        let mut f = FunctionSpec::new("t", "h.t");
        f.events = vec![EventSpec::trigger("orders")];
        let m = synthesize(&f, &defaults()).unwrap();
        assert_eq!((m.spec.function_type.as_str(), m.spec.topic.as_deref()), ("PubSub", Some("orders")));

        f.events = vec![EventSpec::schedule("*/5 * * * *")];
        let m = synthesize(&f, &defaults()).unwrap();
        assert_eq!(m.spec.function_type, "Scheduled");

        f.events = vec![EventSpec { kind: "schedule".into(), ..Default::default() }];
        assert!(matches!(synthesize(&f, &defaults()), Err(SpecError::ScheduleRequired { .. })));

        f.events = vec![EventSpec { kind: "sqs".into(), ..Default::default() }];
        assert!(matches!(synthesize(&f, &defaults()), Err(SpecError::UnsupportedEvent { .. })));
    }

    #[test]
    fn function_values_override_provider_defaults() {
        let mut d = defaults();
        d.timeout = Some(60);
        d.memory_size = Some(Quantity::Text("1Gi".into()));
        let mut f = FunctionSpec::new("o", "h.o");
        f.timeout = Some(30);
        f.labels.insert("team".into(), json!("core"));
        f.description = Some("greets".into());
        let m = synthesize(&f, &d).unwrap();
        assert_eq!(m.spec.timeout, "30");
        assert_eq!(container(&m).resources.as_ref().unwrap().limits.get("memory").map(String::as_str), Some("1Gi"));
        assert_eq!(m.spec.service.selector.get("team").map(String::as_str), Some("core"));
        assert_eq!(m.metadata.annotations.get(DESCRIPTION_ANNOTATION).map(String::as_str), Some("greets"));
    }
}

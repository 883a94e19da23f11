//! Template rendering against a hardware record.
//!
//! The template body is a text template evaluated over the hardware JSON
//! document as a nested map. Missing keys are hard errors, never empty
//! strings; the rendered output is re-parsed and re-validated before it
//! can become a workflow.

use crate::error::TemplateError;
use crate::plan::{self, WorkflowPlan};
use anvil_common::net::normalize_mac;
use minijinja::{Environment, ErrorKind, UndefinedBehavior, Value};

/// Render a template against a hardware record, returning the validated
/// plan together with the rendered YAML bytes that produced it. Failures
/// are attributed to `template_id` for operator diagnosis.
pub fn render(
    template_id: &str,
    template: &str,
    hardware: &serde_json::Value,
) -> crate::Result<(WorkflowPlan, String)> {
    let mut env = Environment::new();
    env.set_undefined_behavior(UndefinedBehavior::Strict);
    register_helpers(&mut env, hardware);

    env.add_template("workflow", template)
        .map_err(|e| render_error(template_id, &e))?;
    let rendered = env
        .get_template("workflow")
        .and_then(|t| t.render(Value::from_serialize(hardware)))
        .map_err(|e| render_error(template_id, &e))?;

    let plan = plan::parse(&rendered).map_err(|e| TemplateError::Render {
        template_id: template_id.to_string(),
        reason: e.to_string(),
    })?;

    // The template must have resolved a worker selector for every task;
    // an empty address means the hardware record had no matching entry.
    for task in &plan.tasks {
        if task.worker.is_empty() {
            return Err(TemplateError::EmptyWorkerAddr {
                template_id: template_id.to_string(),
                task: task.name.clone(),
            });
        }
    }

    Ok((plan, rendered))
}

fn render_error(template_id: &str, err: &minijinja::Error) -> TemplateError {
    // Walk the cause chain; minijinja nests the interesting detail
    // (the undefined key, the failing helper) below the outer error.
    let mut reason = err.to_string();
    let mut source = std::error::Error::source(err);
    while let Some(cause) = source {
        reason.push_str(": ");
        reason.push_str(&cause.to_string());
        source = cause.source();
    }
    TemplateError::Render {
        template_id: template_id.to_string(),
        reason,
    }
}

/// Register the built-in helper functions on the environment:
/// `hardware_ip(mac)` and `hardware_mac(ip)` look up the interface pairs
/// of the hardware record being rendered.
fn register_helpers(env: &mut Environment<'_>, hardware: &serde_json::Value) {
    let pairs = interface_pairs(hardware);

    let by_mac = pairs.clone();
    env.add_function("hardware_ip", move |mac: String| -> Result<String, minijinja::Error> {
        let wanted = normalize_mac(&mac);
        by_mac
            .iter()
            .find(|(m, ip)| normalize_mac(m) == wanted && ip.is_some())
            .and_then(|(_, ip)| ip.clone())
            .ok_or_else(|| {
                minijinja::Error::new(
                    ErrorKind::InvalidOperation,
                    format!("hardware record has no interface with MAC {}", mac),
                )
            })
    });

    let by_ip = pairs;
    env.add_function("hardware_mac", move |ip: String| -> Result<String, minijinja::Error> {
        by_ip
            .iter()
            .find(|(_, i)| i.as_deref() == Some(ip.as_str()))
            .map(|(m, _)| normalize_mac(m))
            .ok_or_else(|| {
                minijinja::Error::new(
                    ErrorKind::InvalidOperation,
                    format!("hardware record has no interface with IP {}", ip),
                )
            })
    });
}

/// Collect `(mac, ip)` pairs from the hardware document. Any object with
/// a string `mac` counts as an interface; its address is taken from a
/// sibling `ip` (string, or object with `address`) or `address` key.
fn interface_pairs(value: &serde_json::Value) -> Vec<(String, Option<String>)> {
    let mut pairs = Vec::new();
    collect_pairs(value, &mut pairs);
    pairs
}

fn collect_pairs(value: &serde_json::Value, out: &mut Vec<(String, Option<String>)>) {
    match value {
        serde_json::Value::Object(map) => {
            if let Some(mac) = map.get("mac").and_then(|v| v.as_str()) {
                let ip = map
                    .get("ip")
                    .and_then(|v| match v {
                        serde_json::Value::String(s) => Some(s.clone()),
                        serde_json::Value::Object(o) => {
                            o.get("address").and_then(|a| a.as_str()).map(String::from)
                        }
                        _ => None,
                    })
                    .or_else(|| {
                        map.get("address").and_then(|v| v.as_str()).map(String::from)
                    });
                out.push((mac.to_string(), ip));
            }
            for child in map.values() {
                collect_pairs(child, out);
            }
        }
        serde_json::Value::Array(items) => {
            for child in items {
                collect_pairs(child, out);
            }
        }
        _ => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    const TEMPLATE: &str = r#"
version: "0.1"
name: provision
tasks:
  - name: os-installation
    worker: "{{ device_1 }}"
    actions:
      - name: stream-image
        image: quay.io/anvil/image2disk:v1.0.0
        timeout: 600
        environment:
          MIRROR: "{{ network.mirror }}"
"#;

    fn hardware() -> serde_json::Value {
        json!({
            "id": "hw-1",
            "device_1": "aa:bb:cc:00:11:22",
            "network": {
                "mirror": "http://192.168.1.2",
                "interfaces": [
                    {"dhcp": {"mac": "aa:bb:cc:00:11:22", "ip": {"address": "192.168.1.50"}}}
                ]
            }
        })
    }

    #[test]
    fn test_render_substitutes_hardware_values() {
        let (plan, rendered) = render("tmpl-1", TEMPLATE, &hardware()).unwrap();
        assert_eq!(plan.tasks[0].worker, "aa:bb:cc:00:11:22");
        assert_eq!(
            plan.tasks[0].actions[0].environment.get("MIRROR").unwrap(),
            "http://192.168.1.2"
        );
        assert!(rendered.contains("aa:bb:cc:00:11:22"));
    }

    #[test]
    fn test_render_missing_key_is_an_error() {
        let template = TEMPLATE.replace("network.mirror", "network.unknown");
        let err = render("tmpl-1", &template, &hardware()).unwrap_err();
        match err {
            TemplateError::Render { template_id, .. } => assert_eq!(template_id, "tmpl-1"),
            other => panic!("expected render error, got {other:?}"),
        }
    }

    #[test]
    fn test_hardware_ip_helper() {
        let template = TEMPLATE.replace(
            "{{ device_1 }}",
            "{{ hardware_ip('AA:BB:CC:00:11:22') }}",
        );
        let (plan, _) = render("tmpl-1", &template, &hardware()).unwrap();
        assert_eq!(plan.tasks[0].worker, "192.168.1.50");
    }

    #[test]
    fn test_hardware_mac_helper() {
        let template = TEMPLATE.replace(
            "{{ device_1 }}",
            "{{ hardware_mac('192.168.1.50') }}",
        );
        let (plan, _) = render("tmpl-1", &template, &hardware()).unwrap();
        assert_eq!(plan.tasks[0].worker, "aa:bb:cc:00:11:22");
    }

    #[test]
    fn test_hardware_ip_unknown_mac_fails() {
        let template = TEMPLATE.replace(
            "{{ device_1 }}",
            "{{ hardware_ip('ff:ff:ff:ff:ff:ff') }}",
        );
        let err = render("tmpl-1", &template, &hardware()).unwrap_err();
        assert!(err.is_render());
    }

    #[test]
    fn test_empty_worker_addr_rejected() {
        let mut hw = hardware();
        hw["device_1"] = json!("");
        let err = render("tmpl-1", TEMPLATE, &hw).unwrap_err();
        assert!(matches!(err, TemplateError::EmptyWorkerAddr { ref task, .. } if task == "os-installation"));
    }

    #[test]
    fn test_rendered_output_is_revalidated() {
        // The substituted value produces an invalid image reference.
        let template = TEMPLATE.replace(
            "quay.io/anvil/image2disk:v1.0.0",
            "{{ network.mirror }}",
        );
        let err = render("tmpl-1", &template, &hardware()).unwrap_err();
        assert!(err.is_render());
    }

    #[test]
    fn test_render_is_deterministic() {
        let first = render("tmpl-1", TEMPLATE, &hardware()).unwrap().1;
        let second = render("tmpl-1", TEMPLATE, &hardware()).unwrap().1;
        assert_eq!(first, second);
    }
}

//! `ftl2.builtin.debug` — prints a message or a parameter value. Runs
//! entirely on the control node; never requires a gate.

use async_trait::async_trait;
use indexmap::IndexMap;
use serde_json::Value;

use super::{Module, ModuleDescriptor, ModuleOutput, ParamDoc};
use crate::error::Result;

pub struct DebugModule;

#[async_trait]
impl Module for DebugModule {
    fn fqcn(&self) -> &'static str {
        "ftl2.builtin.debug"
    }

    fn describe(&self) -> ModuleDescriptor {
        ModuleDescriptor {
            fqcn: self.fqcn().to_string(),
            params: vec![
                ParamDoc {
                    name: "msg".to_string(),
                    required: false,
                    doc: "message to print".to_string(),
                },
                ParamDoc {
                    name: "var".to_string(),
                    required: false,
                    doc: "name of a param to echo back".to_string(),
                },
            ],
            docs: "Prints a message or the value of another param. Never changes anything.".to_string(),
        }
    }

    async fn execute(&self, params: &IndexMap<String, Value>, _check_mode: bool) -> Result<ModuleOutput> {
        let message = if let Some(msg) = params.get("msg") {
            format_value(msg)
        } else if let Some(Value::String(name)) = params.get("var") {
            match params.get(name) {
                Some(value) => format!("{name}: {}", format_value(value)),
                None => format!("{name}: VARIABLE IS NOT DEFINED!"),
            }
        } else {
            String::new()
        };

        Ok(ModuleOutput {
            success: true,
            changed: false,
            output: Value::String(message),
            error: None,
        })
    }
}

fn format_value(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Null => "(undefined)".to_string(),
        _ => serde_json::to_string_pretty(value).unwrap_or_else(|_| value.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn params(pairs: &[(&str, Value)]) -> IndexMap<String, Value> {
        pairs.iter().map(|(k, v)| (k.to_string(), v.clone())).collect()
    }

    #[tokio::test]
    async fn prints_msg() {
        let module = DebugModule;
        let output = module
            .execute(&params(&[("msg", Value::String("hello".to_string()))]), false)
            .await
            .unwrap();
        assert!(output.success);
        assert!(!output.changed);
        assert_eq!(output.output, Value::String("hello".to_string()));
    }

    #[tokio::test]
    async fn echoes_named_var() {
        let module = DebugModule;
        let p = params(&[
            ("var", Value::String("host_count".to_string())),
            ("host_count", Value::from(3)),
        ]);
        let output = module.execute(&p, false).await.unwrap();
        assert_eq!(output.output, Value::String("host_count: 3".to_string()));
    }

    #[tokio::test]
    async fn reports_undefined_var() {
        let module = DebugModule;
        let p = params(&[("var", Value::String("missing".to_string()))]);
        let output = module.execute(&p, false).await.unwrap();
        assert_eq!(output.output, Value::String("missing: VARIABLE IS NOT DEFINED!".to_string()));
    }

    #[tokio::test]
    async fn never_changes_in_check_mode() {
        let module = DebugModule;
        let p = params(&[("msg", Value::String("x".to_string()))]);
        let output = module.execute(&p, true).await.unwrap();
        assert!(!output.changed);
    }
}

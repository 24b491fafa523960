use async_trait::async_trait;
use common_bus::{FailedMessage, Message, Record, Role};
use serde_json::{Map, Value};

use crate::config::TransformRule;
use crate::error::EngineError;
use crate::expr::Expression;
use crate::process::{Processor, ProcessorBatch, StageFailure};
use crate::schema::{coerce, FieldType};

struct CompiledRule {
    expression: Expression,
    output: String,
    output_type: FieldType,
}

/// Stateless per-record derivation: every rule is evaluated against the
/// payload and the result is a fresh JSON object holding only the declared
/// outputs, each cast to its declared type. Per-record evaluation errors
/// become failed messages; the batch carries on.
pub struct TransformProcessor {
    rules: Vec<CompiledRule>,
}

impl TransformProcessor {
    pub fn new(rules: &[TransformRule]) -> Result<Self, EngineError> {
        let mut compiled = Vec::with_capacity(rules.len());
        for rule in rules {
            let expression = Expression::parse(&rule.expression).map_err(|e| {
                EngineError::Config(format!(
                    "invalid transform expression for {}: {e}",
                    rule.output
                ))
            })?;
            let output_type = parse_output_type(&rule.output_type).ok_or_else(|| {
                EngineError::Config(format!(
                    "unknown output type {} for {}",
                    rule.output_type, rule.output
                ))
            })?;
            compiled.push(CompiledRule {
                expression,
                output: rule.output.clone(),
                output_type,
            });
        }
        Ok(Self { rules: compiled })
    }

    fn derive(&self, payload: &[u8]) -> Result<Vec<u8>, String> {
        let value: Value = serde_json::from_slice(payload).map_err(|e| e.to_string())?;
        let mut output = Map::with_capacity(self.rules.len());
        for rule in &self.rules {
            let derived = rule
                .expression
                .evaluate(&value)
                .map_err(|e| format!("{}: {e}", rule.output))?;
            let cast = coerce(&derived, rule.output_type)
                .map_err(|wanted| format!("{}: cannot cast {derived} to {wanted}", rule.output))?;
            output.insert(rule.output.clone(), cast);
        }
        serde_json::to_vec(&Value::Object(output)).map_err(|e| e.to_string())
    }
}

fn parse_output_type(name: &str) -> Option<FieldType> {
    match name {
        "string" => Some(FieldType::String),
        "int" => Some(FieldType::Int),
        "float" => Some(FieldType::Float),
        "bool" => Some(FieldType::Bool),
        "json" => Some(FieldType::Json),
        _ => None,
    }
}

#[async_trait]
impl Processor for TransformProcessor {
    fn role(&self) -> Role {
        Role::Transform
    }

    async fn process(&self, mut batch: ProcessorBatch) -> Result<ProcessorBatch, StageFailure> {
        let mut transformed = Vec::with_capacity(batch.messages.len());

        for message in std::mem::take(&mut batch.messages) {
            match self.derive(message.payload()) {
                Ok(payload) => {
                    // new payload, same routing headers
                    let mut record = Record::new(payload);
                    for (name, value) in message.record().headers() {
                        record.add_header(name.clone(), value.clone());
                    }
                    transformed.push(Message::produced(record));
                }
                Err(error) => {
                    batch
                        .failed
                        .push(FailedMessage::new(message, Role::Transform, error));
                }
            }
        }

        batch.messages = transformed;
        Ok(batch)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use common_bus::testing::delivery;
    use serde_json::json;

    fn rules(defs: &[(&str, &str, &str)]) -> Vec<TransformRule> {
        defs.iter()
            .map(|(expression, output, output_type)| TransformRule {
                expression: expression.to_string(),
                output: output.to_string(),
                output_type: output_type.to_string(),
            })
            .collect()
    }

    #[tokio::test]
    async fn outputs_contain_only_declared_fields() {
        let processor = TransformProcessor::new(&rules(&[
            ("user.id", "user_id", "string"),
            ("age >= 18", "adult", "bool"),
        ]))
        .unwrap();

        let message = delivery(r#"{"user":{"id":42},"age":30,"noise":true}"#).0;
        let batch = processor
            .process(ProcessorBatch::new(vec![message]))
            .await
            .unwrap();

        assert_eq!(batch.messages.len(), 1);
        let output: Value = serde_json::from_slice(batch.messages[0].payload()).unwrap();
        assert_eq!(output, json!({"user_id": "42", "adult": true}));
    }

    #[tokio::test]
    async fn evaluation_error_fails_the_record_not_the_batch() {
        let processor =
            TransformProcessor::new(&rules(&[("containsStr(tet, 'x')", "hit", "bool")])).unwrap();

        let messages = vec![
            delivery(r#"{"text":"xyz"}"#).0,
            delivery(r#"{"text":"abc"}"#).0,
        ];
        let batch = processor
            .process(ProcessorBatch::new(messages))
            .await
            .unwrap();

        assert!(batch.messages.is_empty());
        assert_eq!(batch.failed.len(), 2);
        assert_eq!(batch.failed[0].role, Role::Transform);
        assert!(batch.failed[0].error.contains("tet"));
    }

    #[tokio::test]
    async fn headers_survive_the_rewrite() {
        let processor = TransformProcessor::new(&rules(&[("id", "id", "int")])).unwrap();
        let message = common_bus::testing::delivery_with_headers(
            r#"{"id": 1}"#,
            &[("Gf-Source-Id", "orders")],
        )
        .0;

        let batch = processor
            .process(ProcessorBatch::new(vec![message]))
            .await
            .unwrap();
        assert_eq!(
            batch.messages[0].record().header("Gf-Source-Id"),
            Some("orders")
        );
    }

    #[test]
    fn bad_rules_are_config_errors() {
        assert!(TransformProcessor::new(&rules(&[("a <", "x", "json")])).is_err());
        assert!(TransformProcessor::new(&rules(&[("a", "x", "decimal")])).is_err());
    }
}

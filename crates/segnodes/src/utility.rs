use async_trait::async_trait;
use segcore::{NodeError, Operation, OperationContext, OperationOutput, PortDefinition, Signature, Value};
use segruntime::{OperationFactory, OperationMetadata};
use std::collections::BTreeMap;
use std::sync::Arc;

/// Youngest and oldest post-conceptional ages (weeks) with their own template volume
const YOUNGEST_TEMPLATE_AGE: i64 = 28;
const OLDEST_TEMPLATE_AGE: i64 = 44;

/// Volume of the 4-D age atlas matching a post-conceptional age
pub fn template_index(age: i64) -> i64 {
    if age >= OLDEST_TEMPLATE_AGE {
        OLDEST_TEMPLATE_AGE - YOUNGEST_TEMPLATE_AGE
    } else if age <= YOUNGEST_TEMPLATE_AGE {
        0
    } else {
        age - YOUNGEST_TEMPLATE_AGE
    }
}

/// Passes its inputs through unchanged; used as the iteration source
pub struct IdentityOperation {
    signature: Signature,
}

impl IdentityOperation {
    pub const TYPE: &'static str = "utility.identity";

    pub fn new<I, S>(fields: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let signature = fields.into_iter().map(Into::into).fold(
            Signature::new(),
            |sig, field: String| {
                sig.input(PortDefinition::required(field.clone()))
                    .output(PortDefinition::output(field))
            },
        );
        Self { signature }
    }
}

#[async_trait]
impl Operation for IdentityOperation {
    fn operation_type(&self) -> &str {
        Self::TYPE
    }

    fn signature(&self) -> &Signature {
        &self.signature
    }

    async fn invoke(&self, ctx: OperationContext) -> Result<OperationOutput, NodeError> {
        self.signature
            .inputs
            .iter()
            .try_fold(OperationOutput::new(), |out, port| {
                Ok(out.with_output(port.name.clone(), ctx.require_input(&port.name)?.clone()))
            })
    }
}

pub struct IdentityFactory;

impl OperationFactory for IdentityFactory {
    fn create(&self, config: &BTreeMap<String, Value>) -> Result<Arc<dyn Operation>, NodeError> {
        let fields = match config.get("fields") {
            None => Vec::new(),
            Some(value) => value
                .as_array()
                .and_then(|items| {
                    items
                        .iter()
                        .map(|v| v.as_str().map(str::to_string))
                        .collect::<Option<Vec<_>>>()
                })
                .ok_or_else(|| NodeError::InvalidInputType {
                    field: "fields".to_string(),
                    expected: "array of strings".to_string(),
                    actual: value.type_name().to_string(),
                })?,
        };
        Ok(Arc::new(IdentityOperation::new(fields)))
    }

    fn operation_type(&self) -> &str {
        IdentityOperation::TYPE
    }

    fn metadata(&self) -> OperationMetadata {
        OperationMetadata {
            description: "Forward the configured fields unchanged".to_string(),
            category: "utility".to_string(),
        }
    }
}

/// Age in weeks to atlas volume index
pub struct TemplateIndexOperation {
    signature: Signature,
}

impl TemplateIndexOperation {
    pub const TYPE: &'static str = "utility.template_index";

    pub fn new() -> Self {
        Self {
            signature: Signature::new()
                .input(PortDefinition::required("PCA").describe("Post-conceptional age in weeks"))
                .output(PortDefinition::output("index")),
        }
    }
}

impl Default for TemplateIndexOperation {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Operation for TemplateIndexOperation {
    fn operation_type(&self) -> &str {
        Self::TYPE
    }

    fn signature(&self) -> &Signature {
        &self.signature
    }

    async fn invoke(&self, ctx: OperationContext) -> Result<OperationOutput, NodeError> {
        let age = ctx
            .optional_i64("PCA")?
            .ok_or_else(|| NodeError::MissingInput("PCA".to_string()))?;
        let index = template_index(age);
        ctx.events.info(format!("Age {} weeks uses template volume {}", age, index));
        Ok(OperationOutput::new().with_output("index", index))
    }
}

pub struct TemplateIndexFactory;

impl OperationFactory for TemplateIndexFactory {
    fn create(&self, _config: &BTreeMap<String, Value>) -> Result<Arc<dyn Operation>, NodeError> {
        Ok(Arc::new(TemplateIndexOperation::new()))
    }

    fn operation_type(&self) -> &str {
        TemplateIndexOperation::TYPE
    }

    fn metadata(&self) -> OperationMetadata {
        OperationMetadata {
            description: "Select the atlas volume for a post-conceptional age".to_string(),
            category: "utility".to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use segcore::EventEmitter;

    fn ctx(inputs: Vec<(&str, Value)>) -> OperationContext {
        OperationContext {
            node_name: "n".to_string(),
            instance: String::new(),
            inputs: inputs.into_iter().map(|(k, v)| (k.to_string(), v)).collect(),
            work_dir: std::env::temp_dir(),
            events: EventEmitter::detached("n"),
        }
    }

    #[test]
    fn template_index_clamps_to_atlas_range() {
        assert_eq!(template_index(20), 0);
        assert_eq!(template_index(28), 0);
        assert_eq!(template_index(29), 1);
        assert_eq!(template_index(30), 2);
        assert_eq!(template_index(43), 15);
        assert_eq!(template_index(44), 16);
        assert_eq!(template_index(60), 16);
    }

    #[tokio::test]
    async fn identity_forwards_declared_fields() {
        let op = IdentityFactory
            .create(&BTreeMap::from([("fields".to_string(), Value::from(vec!["pid"]))]))
            .unwrap();
        assert!(op.signature().has_output("pid"));

        let out = op.invoke(ctx(vec![("pid", Value::from("P001"))])).await.unwrap();
        assert_eq!(out.outputs["pid"], Value::from("P001"));
    }

    #[test]
    fn identity_rejects_non_string_fields() {
        let err = IdentityFactory
            .create(&BTreeMap::from([("fields".to_string(), Value::from(3.0))]))
            .err()
            .unwrap();
        assert!(matches!(err, NodeError::InvalidInputType { .. }));
    }

    #[tokio::test]
    async fn template_index_operation_emits_integer() {
        let out = TemplateIndexOperation::new()
            .invoke(ctx(vec![("PCA", Value::from(30))]))
            .await
            .unwrap();
        assert_eq!(out.outputs["index"].as_i64(), Some(2));

        let err = TemplateIndexOperation::new()
            .invoke(ctx(vec![("PCA", Value::from(30.5))]))
            .await
            .unwrap_err();
        assert!(matches!(err, NodeError::InvalidInputType { .. }));
    }
}

//! Input discovery by filename templates
//!
//! Each output field has a glob template with `%s` placeholders. The
//! placeholders are filled, in order, from the template arguments, which
//! name either an input field (replaced by its value) or a literal.

use async_trait::async_trait;
use segcore::{NodeError, Operation, OperationContext, OperationOutput, PortDefinition, Signature, Value};
use segruntime::{OperationFactory, OperationMetadata};
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;

const OPERATION: &str = "io.datagrabber";

pub struct DataGrabber {
    infields: Vec<String>,
    outfields: Vec<String>,
    signature: Signature,
}

impl DataGrabber {
    pub const TYPE: &'static str = OPERATION;

    pub fn new(infields: Vec<String>, outfields: Vec<String>) -> Self {
        let signature = Signature::new()
            .input(PortDefinition::required("base_directory"))
            .input(PortDefinition::optional("template").with_default("*"))
            .input(
                PortDefinition::optional("field_template")
                    .describe("Per-output templates overriding `template`"),
            )
            .input(
                PortDefinition::required("template_args")
                    .describe("Per-output lists of argument lists filling `%s`"),
            )
            .input(PortDefinition::optional("sort_filelist").with_default(true));
        let signature = infields
            .iter()
            .fold(signature, |sig, f| sig.input(PortDefinition::required(f.clone())));
        let signature = outfields
            .iter()
            .fold(signature, |sig, f| sig.output(PortDefinition::output(f.clone())));

        Self {
            infields,
            outfields,
            signature,
        }
    }

    fn resolve_arg(&self, ctx: &OperationContext, arg: &Value) -> Result<String, NodeError> {
        let name = arg.as_str().ok_or_else(|| NodeError::InvalidInputType {
            field: "template_args".to_string(),
            expected: "string".to_string(),
            actual: arg.type_name().to_string(),
        })?;
        if !self.infields.iter().any(|f| f == name) {
            return Ok(name.to_string());
        }
        match ctx.require_input(name)? {
            Value::Array(_) | Value::Object(_) => Err(NodeError::InvalidInputType {
                field: name.to_string(),
                expected: "scalar".to_string(),
                actual: "collection".to_string(),
            }),
            value => Ok(value.label()),
        }
    }
}

/// Replace each `%s` in `template` with the next value.
pub fn fill_template(template: &str, values: &[String]) -> Result<String, NodeError> {
    let pieces: Vec<&str> = template.split("%s").collect();
    if pieces.len() - 1 != values.len() {
        return Err(NodeError::Configuration(format!(
            "template '{}' has {} placeholders but {} arguments were given",
            template,
            pieces.len() - 1,
            values.len()
        )));
    }
    let mut filled = pieces[0].to_string();
    for (value, piece) in values.iter().zip(&pieces[1..]) {
        filled.push_str(value);
        filled.push_str(piece);
    }
    Ok(filled)
}

fn find_files(pattern: &str, sort: bool) -> Result<Vec<PathBuf>, NodeError> {
    let entries = glob::glob(pattern)
        .map_err(|e| NodeError::Configuration(format!("bad pattern '{}': {}", pattern, e)))?;
    let mut files = entries
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| NodeError::Io(e.to_string()))?;
    if sort {
        files.sort();
    }
    Ok(files)
}

fn object<'a>(
    ctx: &'a OperationContext,
    field: &str,
) -> Result<Option<&'a BTreeMap<String, Value>>, NodeError> {
    match ctx.inputs.get(field) {
        None | Some(Value::Null) => Ok(None),
        Some(Value::Object(map)) => Ok(Some(map)),
        Some(other) => Err(NodeError::InvalidInputType {
            field: field.to_string(),
            expected: "object".to_string(),
            actual: other.type_name().to_string(),
        }),
    }
}

#[async_trait]
impl Operation for DataGrabber {
    fn operation_type(&self) -> &str {
        Self::TYPE
    }

    fn signature(&self) -> &Signature {
        &self.signature
    }

    async fn invoke(&self, ctx: OperationContext) -> Result<OperationOutput, NodeError> {
        let base = ctx.require_path("base_directory")?.to_path_buf();
        let default_template = ctx.get_input_or("template", Value::from("*"));
        let default_template = default_template.as_str().unwrap_or("*");
        let sort = ctx.get_input_or("sort_filelist", Value::from(true)).as_bool() != Some(false);
        let field_templates = object(&ctx, "field_template")?;
        let template_args = object(&ctx, "template_args")?
            .ok_or_else(|| NodeError::MissingInput("template_args".to_string()))?;

        let mut output = OperationOutput::new();
        for field in &self.outfields {
            let template = field_templates
                .and_then(|t| t.get(field))
                .and_then(Value::as_str)
                .unwrap_or(default_template);

            // No argument list means a single, argument-free lookup.
            let arg_sets: Vec<&[Value]> = match template_args.get(field) {
                None => vec![&[] as &[Value]],
                Some(value) => value
                    .as_array()
                    .and_then(|sets| sets.iter().map(Value::as_array).collect::<Option<Vec<_>>>())
                    .ok_or_else(|| NodeError::InvalidInputType {
                        field: format!("template_args.{}", field),
                        expected: "array of arrays".to_string(),
                        actual: value.type_name().to_string(),
                    })?,
            };

            let mut found = Vec::with_capacity(arg_sets.len());
            for args in arg_sets {
                let values = args
                    .iter()
                    .map(|arg| self.resolve_arg(&ctx, arg))
                    .collect::<Result<Vec<_>, _>>()?;
                let pattern = base.join(fill_template(template, &values)?);
                let pattern = pattern.to_string_lossy();

                let mut files = find_files(&pattern, sort)?;
                tracing::debug!("{} matched {} file(s) for '{}'", pattern, files.len(), field);
                found.push(match files.len() {
                    0 => {
                        return Err(NodeError::operation_failed(
                            OPERATION,
                            None,
                            format!("no files match {} for '{}'", pattern, field),
                        ))
                    }
                    1 => Value::from(files.remove(0)),
                    _ => Value::from(files),
                });
            }

            let value = if found.len() == 1 {
                found.remove(0)
            } else {
                Value::Array(found)
            };
            output = output.with_output(field.clone(), value);
        }
        Ok(output)
    }
}

pub struct DataGrabberFactory;

fn string_list(config: &BTreeMap<String, Value>, key: &str) -> Result<Vec<String>, NodeError> {
    let Some(value) = config.get(key) else {
        return Ok(Vec::new());
    };
    value
        .as_array()
        .and_then(|items| {
            items
                .iter()
                .map(|v| v.as_str().map(str::to_string))
                .collect::<Option<Vec<_>>>()
        })
        .ok_or_else(|| NodeError::InvalidInputType {
            field: key.to_string(),
            expected: "array of strings".to_string(),
            actual: value.type_name().to_string(),
        })
}

impl OperationFactory for DataGrabberFactory {
    fn create(&self, config: &BTreeMap<String, Value>) -> Result<Arc<dyn Operation>, NodeError> {
        let infields = string_list(config, "infields")?;
        let outfields = string_list(config, "outfields")?;
        if outfields.is_empty() {
            return Err(NodeError::Configuration(
                "a data grabber needs at least one outfield".to_string(),
            ));
        }
        Ok(Arc::new(DataGrabber::new(infields, outfields)))
    }

    fn operation_type(&self) -> &str {
        DataGrabber::TYPE
    }

    fn metadata(&self) -> OperationMetadata {
        OperationMetadata {
            description: "Find input files from templated glob patterns".to_string(),
            category: "io".to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use segcore::EventEmitter;
    use std::path::Path;

    fn grabber() -> DataGrabber {
        DataGrabber::new(vec!["pid".to_string()], vec!["T1".to_string()])
    }

    fn object(entries: Vec<(&str, Value)>) -> Value {
        Value::Object(entries.into_iter().map(|(k, v)| (k.to_string(), v)).collect())
    }

    fn ctx(base: &Path, pid: &str, field_template: &str) -> OperationContext {
        let inputs = BTreeMap::from([
            ("base_directory".to_string(), Value::from(base)),
            ("template".to_string(), Value::from("%s")),
            (
                "field_template".to_string(),
                object(vec![("T1", Value::from(field_template))]),
            ),
            (
                "template_args".to_string(),
                object(vec![("T1", Value::from(vec![Value::from(vec!["pid"])]))]),
            ),
            ("sort_filelist".to_string(), Value::from(false)),
            ("pid".to_string(), Value::from(pid)),
        ]);
        OperationContext {
            node_name: "datasource".to_string(),
            instance: String::new(),
            inputs,
            work_dir: base.to_path_buf(),
            events: EventEmitter::detached("datasource"),
        }
    }

    #[test]
    fn placeholders_fill_in_order() {
        let values = vec!["P001".to_string(), "T1".to_string()];
        assert_eq!(fill_template("%s/%s3D.nii.gz", &values).unwrap(), "P001/T13D.nii.gz");
        assert!(fill_template("%s_T13D.nii.gz", &values).is_err());
    }

    #[tokio::test]
    async fn single_match_is_a_path() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("P001_T13D.nii.gz"), b"t1").unwrap();
        std::fs::write(dir.path().join("P002_T13D.nii.gz"), b"t1").unwrap();

        let out = grabber()
            .invoke(ctx(dir.path(), "P001", "%s_T13D.nii.gz"))
            .await
            .unwrap();
        assert_eq!(
            out.outputs["T1"],
            Value::from(dir.path().join("P001_T13D.nii.gz"))
        );
    }

    #[tokio::test]
    async fn several_matches_are_a_list() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("P001_T13D_a.nii.gz"), b"t1").unwrap();
        std::fs::write(dir.path().join("P001_T13D_b.nii.gz"), b"t1").unwrap();

        let out = grabber()
            .invoke(ctx(dir.path(), "P001", "%s_T13D_*.nii.gz"))
            .await
            .unwrap();
        assert_eq!(out.outputs["T1"].as_array().map(<[Value]>::len), Some(2));
    }

    #[tokio::test]
    async fn no_match_fails() {
        let dir = tempfile::tempdir().unwrap();
        let err = grabber()
            .invoke(ctx(dir.path(), "P404", "%s_T13D.nii.gz"))
            .await
            .unwrap_err();
        assert!(matches!(err, NodeError::OperationFailed { ref diagnostics, .. } if diagnostics.contains("P404")));
    }

    #[test]
    fn factory_needs_outfields() {
        let config = BTreeMap::from([("infields".to_string(), Value::from(vec!["pid"]))]);
        assert!(DataGrabberFactory.create(&config).is_err());
    }
}

//! Decoding of declared step outputs.

use serde_json::Value;
use thiserror::Error;

use crate::step::OutputFormat;

/// Output decoding failure.
#[derive(Debug, Error)]
pub enum OutputError {
    #[error("output `{name}` is not valid JSON: {source}")]
    Json {
        name: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("output `{name}` is not valid YAML: {source}")]
    Yaml {
        name: String,
        #[source]
        source: serde_yaml::Error,
    },
}

/// Decode a rendered output value according to its declared format.
pub fn decode_output(name: &str, rendered: &str, format: OutputFormat) -> Result<Value, OutputError> {
    match format {
        OutputFormat::Text => Ok(Value::String(rendered.to_string())),
        OutputFormat::Json => serde_json::from_str(rendered).map_err(|source| OutputError::Json {
            name: name.to_string(),
            source,
        }),
        OutputFormat::Yaml => serde_yaml::from_str(rendered).map_err(|source| OutputError::Yaml {
            name: name.to_string(),
            source,
        }),
    }
}

//! Validated model spec records
//!
//! The upstream document is either an object keyed by spec id or a plain
//! list of records. Both shapes are accepted; individual records that do not
//! deserialize are skipped rather than failing the whole catalog.

use serde::{Deserialize, Serialize};
use std::collections::HashSet;

/// Fallback runtime parameters when a record omits them
pub const DEFAULT_MAX_CONTEXT: u32 = 65536;
pub const DEFAULT_MAX_NUM_SEQS: u32 = 16;
pub const DEFAULT_BLOCK_SIZE: u32 = 64;

/// One validated (hardware, model, commit pair) record
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelSpec {
    pub model_name: String,

    #[serde(default)]
    pub model_id: String,

    /// HuggingFace repository id, e.g. "meta-llama/Llama-3.1-8B-Instruct"
    #[serde(default)]
    pub hf_model_repo: String,

    pub device_type: String,

    #[serde(default, deserialize_with = "commit_field")]
    pub tt_metal_commit: Option<String>,

    #[serde(default, deserialize_with = "commit_field")]
    pub vllm_commit: Option<String>,

    #[serde(default)]
    pub version: Option<String>,

    #[serde(default)]
    pub status: Option<String>,

    /// Billions of parameters
    #[serde(default)]
    pub param_count: Option<f64>,

    #[serde(default)]
    pub min_disk_gb: Option<f64>,

    #[serde(default)]
    pub min_ram_gb: Option<f64>,

    #[serde(default)]
    pub device_model_spec: RuntimeParams,

    #[serde(default)]
    pub vllm_args: VllmArgs,

    #[serde(default)]
    pub env_vars: SpecEnv,
}

/// Device runtime parameters
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RuntimeParams {
    #[serde(default)]
    pub max_context: Option<u32>,
    #[serde(default)]
    pub max_num_seqs: Option<u32>,
    #[serde(default)]
    pub block_size: Option<u32>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct VllmArgs {
    #[serde(default, deserialize_with = "lenient_u32")]
    pub tensor_parallel_size: Option<u32>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SpecEnv {
    #[serde(rename = "ARCH_NAME", default)]
    pub arch_name: Option<String>,
}

impl ModelSpec {
    pub fn max_context(&self) -> u32 {
        self.device_model_spec
            .max_context
            .unwrap_or(DEFAULT_MAX_CONTEXT)
    }

    pub fn max_num_seqs(&self) -> u32 {
        self.device_model_spec
            .max_num_seqs
            .unwrap_or(DEFAULT_MAX_NUM_SEQS)
    }

    pub fn block_size(&self) -> u32 {
        self.device_model_spec
            .block_size
            .unwrap_or(DEFAULT_BLOCK_SIZE)
    }

    /// Parallelism degree, only when it is more than one device
    pub fn tensor_parallel(&self) -> Option<u32> {
        self.vllm_args.tensor_parallel_size.filter(|tp| *tp > 1)
    }

    /// Upper-cased status, "UNKNOWN" when absent
    pub fn status_label(&self) -> String {
        self.status
            .as_deref()
            .map(str::to_uppercase)
            .unwrap_or_else(|| "UNKNOWN".to_string())
    }

    /// Model family: the name up to the first '-'
    pub fn family(&self) -> &str {
        self.model_name
            .split_once('-')
            .map(|(family, _)| family)
            .unwrap_or(&self.model_name)
    }
}

/// Parse the upstream document into spec records
///
/// Records without a `device_type` or with an unusable shape are skipped.
/// Duplicate (model_name, device_type) pairs keep their first occurrence.
pub fn parse_specs(document: &serde_json::Value) -> Option<Vec<ModelSpec>> {
    let records: Vec<&serde_json::Value> = match document {
        serde_json::Value::Object(map) => map.values().collect(),
        serde_json::Value::Array(items) => items.iter().collect(),
        _ => return None,
    };

    let mut seen = HashSet::new();
    let mut specs = Vec::with_capacity(records.len());

    for record in records {
        if record.get("device_type").is_none() {
            continue;
        }

        let spec: ModelSpec = match serde_json::from_value(record.clone()) {
            Ok(spec) => spec,
            Err(e) => {
                tracing::warn!(
                    error = %e,
                    model = ?record.get("model_name"),
                    "Skipping malformed model spec record"
                );
                continue;
            }
        };

        let key = (
            spec.model_name.to_lowercase(),
            spec.device_type.to_uppercase(),
        );
        if !seen.insert(key) {
            tracing::debug!(
                model = %spec.model_name,
                device = %spec.device_type,
                "Dropping duplicate model spec, first occurrence wins"
            );
            continue;
        }

        specs.push(spec);
    }

    Some(specs)
}

/// Commits arrive as strings, sometimes as the literals "None"/"null"
fn commit_field<'de, D>(deserializer: D) -> Result<Option<String>, D::Error>
where
    D: serde::Deserializer<'de>,
{
    let value: Option<String> = Option::deserialize(deserializer)?;
    Ok(value
        .map(|c| c.trim().to_string())
        .filter(|c| !c.is_empty() && c != "None" && c != "null"))
}

/// Accepts 2, "2" or null
fn lenient_u32<'de, D>(deserializer: D) -> Result<Option<u32>, D::Error>
where
    D: serde::Deserializer<'de>,
{
    let value: Option<serde_json::Value> = Option::deserialize(deserializer)?;
    Ok(match value {
        Some(serde_json::Value::Number(n)) => n.as_u64().and_then(|n| u32::try_from(n).ok()),
        Some(serde_json::Value::String(s)) => s.trim().parse().ok(),
        _ => None,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn record(name: &str, device: &str) -> serde_json::Value {
        json!({
            "model_name": name,
            "model_id": format!("id_{}_{}", name, device),
            "hf_model_repo": format!("org/{}", name),
            "device_type": device,
            "tt_metal_commit": "abc1234",
            "vllm_commit": "def5678",
            "status": "complete",
            "device_model_spec": { "max_context": 131072, "max_num_seqs": 32, "block_size": 64 },
            "vllm_args": { "tensor_parallel_size": "2" },
            "env_vars": { "ARCH_NAME": "wormhole_b0" }
        })
    }

    #[test]
    fn test_parse_list_document() {
        let doc = json!([record("Llama-3.1-8B", "N150"), record("Qwen3-8B", "N300")]);
        let specs = parse_specs(&doc).unwrap();

        assert_eq!(specs.len(), 2);
        assert_eq!(specs[0].model_name, "Llama-3.1-8B");
        assert_eq!(specs[0].tt_metal_commit.as_deref(), Some("abc1234"));
        assert_eq!(specs[0].max_context(), 131072);
        assert_eq!(specs[0].max_num_seqs(), 32);
        assert_eq!(specs[0].tensor_parallel(), Some(2));
        assert_eq!(specs[0].env_vars.arch_name.as_deref(), Some("wormhole_b0"));
        assert_eq!(specs[0].status_label(), "COMPLETE");
    }

    #[test]
    fn test_parse_object_document() {
        let doc = json!({ "a": record("Llama-3.1-8B", "N150") });
        let specs = parse_specs(&doc).unwrap();
        assert_eq!(specs.len(), 1);
    }

    #[test]
    fn test_scalar_document_rejected() {
        assert!(parse_specs(&json!("nope")).is_none());
    }

    #[test]
    fn test_duplicates_first_wins() {
        let mut second = record("Llama-3.1-8B", "n150");
        second["tt_metal_commit"] = json!("9999999");
        let doc = json!([record("Llama-3.1-8B", "N150"), second]);

        let specs = parse_specs(&doc).unwrap();
        assert_eq!(specs.len(), 1);
        assert_eq!(specs[0].tt_metal_commit.as_deref(), Some("abc1234"));
    }

    #[test]
    fn test_skips_records_without_device_or_malformed() {
        let doc = json!([
            { "model_name": "NoDevice" },
            { "model_name": 42, "device_type": "N150" },
            record("Gemma-3-4B", "N150"),
        ]);
        let specs = parse_specs(&doc).unwrap();
        assert_eq!(specs.len(), 1);
        assert_eq!(specs[0].model_name, "Gemma-3-4B");
    }

    #[test]
    fn test_defaults_and_placeholder_commits() {
        let doc = json!([{
            "model_name": "Mistral-7B",
            "device_type": "N300",
            "tt_metal_commit": "None",
            "vllm_commit": null,
            "vllm_args": { "tensor_parallel_size": 1 }
        }]);
        let spec = &parse_specs(&doc).unwrap()[0];

        assert_eq!(spec.tt_metal_commit, None);
        assert_eq!(spec.vllm_commit, None);
        assert_eq!(spec.max_context(), DEFAULT_MAX_CONTEXT);
        assert_eq!(spec.max_num_seqs(), DEFAULT_MAX_NUM_SEQS);
        assert_eq!(spec.block_size(), DEFAULT_BLOCK_SIZE);
        assert_eq!(spec.tensor_parallel(), None);
        assert_eq!(spec.status_label(), "UNKNOWN");
    }

    #[test]
    fn test_family() {
        let doc = json!([record("Llama-3.1-8B", "N150"), record("QwQ", "N150")]);
        let specs = parse_specs(&doc).unwrap();
        assert_eq!(specs[0].family(), "Llama");
        assert_eq!(specs[1].family(), "QwQ");
    }
}

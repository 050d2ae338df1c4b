//! Matching catalog records against hardware and a user query

use crate::hardware::{ARCH_FAMILIES, Hardware, arch_family};
use crate::specs::ModelSpec;
use std::collections::{BTreeMap, HashSet};

/// Task keywords and the model-name fragments they select
pub const TASKS: &[(&str, &[&str])] = &[
    ("chat", &["llama", "mistral", "qwen", "gemma"]),
    ("code", &["llama", "qwen", "code"]),
    ("code_assistant", &["llama", "qwen", "code"]),
    ("generate_image", &["stable", "diffusion", "sd", "image"]),
    ("image", &["stable", "diffusion", "sd", "image"]),
    ("generate_video", &["video", "sora"]),
    ("video", &["video", "sora"]),
    ("agent", &["qwen", "llama", "agent"]),
    ("reasoning", &["qwq", "reason"]),
];

/// Name fragments mapped to a task keyword, if `query` is one
pub fn task_fragments(query: &str) -> Option<&'static [&'static str]> {
    let query = query.trim().to_lowercase();
    TASKS
        .iter()
        .find(|(task, _)| *task == query)
        .map(|(_, fragments)| *fragments)
}

pub fn is_task_keyword(query: &str) -> bool {
    task_fragments(query).is_some()
}

/// Conservative reduction applied to relaxed candidates: floor(n * 2 / 3), at least 1
pub fn derate(value: u32) -> u32 {
    let reduced = u64::from(value) * 2 / 3;
    u32::try_from(reduced).unwrap_or(u32::MAX).max(1)
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MatchMode {
    /// Also consider specs validated for another device of the same family
    pub include_experimental: bool,
}

/// A spec that survived matching
#[derive(Debug, Clone, PartialEq)]
pub struct Candidate {
    /// Runtime parameters already derated for experimental candidates
    pub spec: ModelSpec,
    pub experimental: bool,
    /// Why an experimental candidate was included
    pub reason: Option<String>,
}

impl Candidate {
    fn validated(spec: &ModelSpec) -> Self {
        Self {
            spec: spec.clone(),
            experimental: false,
            reason: None,
        }
    }

    fn relaxed(spec: &ModelSpec, family: &str) -> Self {
        let mut derated = spec.clone();
        derated.device_model_spec.max_context = Some(derate(spec.max_context()));
        derated.device_model_spec.max_num_seqs = Some(derate(spec.max_num_seqs()));
        Self {
            spec: derated,
            experimental: true,
            reason: Some(format!(
                "same architecture family ({}), validated for {}",
                family,
                spec.device_type.to_uppercase()
            )),
        }
    }
}

/// Select the specs usable on `hardware` that answer `query`
///
/// Validated candidates come first, then experimental ones, each in catalog
/// order. A blank query keeps every hardware-compatible spec.
pub fn match_specs(
    specs: &[ModelSpec],
    hardware: &Hardware,
    query: Option<&str>,
    mode: MatchMode,
) -> Vec<Candidate> {
    let (validated, experimental) = filter_by_hardware(specs, hardware, mode);

    let query = query.map(str::trim).filter(|q| !q.is_empty());
    let matcher = query.map(QueryMatcher::new);

    let mut seen = HashSet::new();
    let matches: Vec<Candidate> = validated
        .into_iter()
        .chain(experimental)
        .filter(|c| matcher.as_ref().is_none_or(|m| m.accepts(&c.spec)))
        .filter(|c| {
            seen.insert((
                c.spec.model_name.to_lowercase(),
                c.spec.device_type.to_uppercase(),
            ))
        })
        .collect();

    tracing::debug!(
        query = ?query,
        hardware = %hardware,
        experimental = mode.include_experimental,
        matches = matches.len(),
        "Matched model specs"
    );

    matches
}

/// Split the catalog into exact-device and same-family candidates
pub fn filter_by_hardware(
    specs: &[ModelSpec],
    hardware: &Hardware,
    mode: MatchMode,
) -> (Vec<Candidate>, Vec<Candidate>) {
    let Some(device) = hardware.device_type() else {
        // Nothing to constrain against
        return (specs.iter().map(Candidate::validated).collect(), Vec::new());
    };
    let device = device.to_uppercase();
    let family = arch_family(&device);

    let mut validated = Vec::new();
    let mut experimental = Vec::new();

    for spec in specs {
        if spec.device_type.eq_ignore_ascii_case(&device) {
            validated.push(Candidate::validated(spec));
        } else if mode.include_experimental
            && let Some(family) = family
            && same_family(spec, family)
        {
            experimental.push(Candidate::relaxed(spec, family));
        }
    }

    (validated, experimental)
}

fn same_family(spec: &ModelSpec, family: &str) -> bool {
    let in_family = ARCH_FAMILIES
        .iter()
        .find(|(name, _)| *name == family)
        .is_some_and(|(_, devices)| devices.contains(&spec.device_type.to_uppercase().as_str()));

    in_family
        || spec
            .env_vars
            .arch_name
            .as_deref()
            .is_some_and(|arch| arch.eq_ignore_ascii_case(family))
}

enum QueryMatcher {
    Task(&'static [&'static str]),
    Name(String),
}

impl QueryMatcher {
    fn new(query: &str) -> Self {
        match task_fragments(query) {
            Some(fragments) => Self::Task(fragments),
            None => Self::Name(query.to_lowercase()),
        }
    }

    fn accepts(&self, spec: &ModelSpec) -> bool {
        let name = spec.model_name.to_lowercase();
        match self {
            Self::Task(fragments) => fragments.iter().any(|f| name.contains(f)),
            Self::Name(needle) => name.contains(needle.as_str()),
        }
    }
}

/// Candidates grouped by model family, families sorted by name
pub fn group_by_family(candidates: &[Candidate]) -> BTreeMap<String, Vec<&Candidate>> {
    let mut groups: BTreeMap<String, Vec<&Candidate>> = BTreeMap::new();
    for candidate in candidates {
        groups
            .entry(candidate.spec.family().to_string())
            .or_default()
            .push(candidate);
    }
    groups
}

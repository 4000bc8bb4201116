//! Checkpoint key translation between naming schemes.
//!
//! A [`WeightMapper`] turns a checkpoint's native state dict into the layout
//! one of the decode backends expects: transpose rules first, then key
//! renames, then LoRA factor merging. The translation is pure, the input
//! state is never mutated.

pub mod error;

use std::collections::HashMap;

use candle_core::Tensor;
use regex::Regex;
use serde::Deserialize;
use tracing::debug;

use crate::model::ModelState;

pub use error::MappingError;

const LORA_A_SUFFIX: &str = ".lora_a";
const LORA_B_SUFFIX: &str = ".lora_b";

/// Regex-to-template key rename. `template` may reference capture groups
/// (`$1`, `$2`, ...) of `pattern`.
#[derive(Debug, Clone, Deserialize)]
pub struct MappingRule {
    pub pattern: String,
    pub template: String,
}

/// Keys matching `pattern` get their axes permuted before renaming.
#[derive(Debug, Clone, Deserialize)]
pub struct TransposeRule {
    pub pattern: String,
    pub permutation: Vec<usize>,
}

/// Low-rank adapter configuration, PEFT-style. `module_path`, when set,
/// restricts which modules may carry factors.
#[derive(Debug, Clone, Deserialize)]
pub struct LoraConfig {
    pub rank: usize,
    pub alpha: f32,
    #[serde(default)]
    pub module_path: Option<String>,
}

impl LoraConfig {
    pub fn scale(&self) -> f64 {
        f64::from(self.alpha) / self.rank as f64
    }
}

/// What to do with keys no rename rule covers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UnmatchedKeyPolicy {
    /// Keep the key under its original name.
    #[default]
    PassThrough,
    /// Silently discard it.
    Drop,
}

/// Which naming scheme [`WeightMapper::to_backend`] should produce.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MappingTarget {
    Hf,
    Backend,
}

/// Full translation table for one model family.
#[derive(Debug, Clone, Deserialize)]
pub struct MappingConfig {
    #[serde(default)]
    pub to_hf_mappings: Vec<MappingRule>,
    #[serde(default)]
    pub to_backend_mapping: Vec<MappingRule>,
    #[serde(default)]
    pub transpose_keys: Vec<TransposeRule>,
    #[serde(default)]
    pub lora_to_hf_mappings: Vec<MappingRule>,
    #[serde(default)]
    pub lora_config: Option<LoraConfig>,
    #[serde(default)]
    pub unmatched: UnmatchedKeyPolicy,
}

struct CompiledRule {
    pattern: String,
    regex: Regex,
    template: String,
}

struct CompiledTranspose {
    pattern: String,
    regex: Regex,
    permutation: Vec<usize>,
}

pub struct WeightMapper {
    to_hf: Vec<CompiledRule>,
    to_backend: Vec<CompiledRule>,
    transpose: Vec<CompiledTranspose>,
    lora_to_hf: Vec<CompiledRule>,
    lora_config: Option<LoraConfig>,
    lora_module: Option<Regex>,
    unmatched: UnmatchedKeyPolicy,
}

fn compile(pattern: &str) -> Result<Regex, MappingError> {
    // Rules match whole keys, not substrings.
    Regex::new(&format!("^(?:{pattern})$")).map_err(|source| MappingError::InvalidPattern {
        pattern: pattern.to_string(),
        source,
    })
}

fn compile_rules(rules: &[MappingRule]) -> Result<Vec<CompiledRule>, MappingError> {
    rules
        .iter()
        .map(|r| {
            Ok(CompiledRule {
                pattern: r.pattern.clone(),
                regex: compile(&r.pattern)?,
                template: r.template.clone(),
            })
        })
        .collect()
}

/// Rename `key` through the matching rule, erroring if a second rule also
/// matches. `None` means no rule applied.
fn rename(rules: &[CompiledRule], key: &str) -> Result<Option<String>, MappingError> {
    let mut hit: Option<&CompiledRule> = None;
    for rule in rules {
        if rule.regex.is_match(key) {
            if let Some(first) = hit {
                return Err(MappingError::OverlappingRules {
                    key: key.to_string(),
                    first: first.pattern.clone(),
                    second: rule.pattern.clone(),
                });
            }
            hit = Some(rule);
        }
    }
    Ok(hit.map(|rule| rule.regex.replace(key, rule.template.as_str()).into_owned()))
}

impl WeightMapper {
    pub fn new(config: MappingConfig) -> Result<Self, MappingError> {
        let transpose = config
            .transpose_keys
            .iter()
            .map(|r| {
                Ok(CompiledTranspose {
                    pattern: r.pattern.clone(),
                    regex: compile(&r.pattern)?,
                    permutation: r.permutation.clone(),
                })
            })
            .collect::<Result<Vec<_>, MappingError>>()?;
        let lora_module = match config.lora_config.as_ref().and_then(|c| c.module_path.as_ref()) {
            Some(pattern) => Some(compile(pattern)?),
            None => None,
        };
        Ok(Self {
            to_hf: compile_rules(&config.to_hf_mappings)?,
            to_backend: compile_rules(&config.to_backend_mapping)?,
            transpose,
            lora_to_hf: compile_rules(&config.lora_to_hf_mappings)?,
            lora_config: config.lora_config,
            lora_module,
            unmatched: config.unmatched,
        })
    }

    fn transpose_for(&self, key: &str) -> Result<Option<&CompiledTranspose>, MappingError> {
        let mut hit: Option<&CompiledTranspose> = None;
        for rule in &self.transpose {
            if rule.regex.is_match(key) {
                if let Some(first) = hit {
                    return Err(MappingError::OverlappingRules {
                        key: key.to_string(),
                        first: first.pattern.clone(),
                        second: rule.pattern.clone(),
                    });
                }
                hit = Some(rule);
            }
        }
        Ok(hit)
    }

    fn apply_transpose(
        rule: &CompiledTranspose,
        key: &str,
        tensor: &Tensor,
    ) -> Result<Tensor, MappingError> {
        let rank = tensor.rank();
        let mut seen = vec![false; rank];
        let valid = rule.permutation.len() == rank
            && rule.permutation.iter().all(|&axis| {
                if axis >= rank || seen[axis] {
                    false
                } else {
                    seen[axis] = true;
                    true
                }
            });
        if !valid {
            return Err(MappingError::InvalidPermutation {
                pattern: rule.pattern.clone(),
                permutation: rule.permutation.clone(),
                rank,
                key: key.to_string(),
            });
        }
        Ok(tensor.permute(rule.permutation.as_slice())?)
    }

    /// Translate `state` into `target` naming.
    ///
    /// LoRA factors (`<module>.lora_a` / `<module>.lora_b`) are consumed and
    /// merged into their base weight as `W + (alpha / rank) * B A`, with the
    /// delta permuted the same way the base weight was.
    pub fn to_backend(
        &self,
        state: &ModelState,
        target: MappingTarget,
    ) -> Result<ModelState, MappingError> {
        let rules = match target {
            MappingTarget::Hf => &self.to_hf,
            MappingTarget::Backend => &self.to_backend,
        };

        let mut lora_a: HashMap<String, &Tensor> = HashMap::new();
        let mut lora_b: HashMap<String, &Tensor> = HashMap::new();
        let mut mapped: ModelState = HashMap::new();
        // Applied permutation per mapped key and original-to-mapped names,
        // both needed to attach LoRA factors to renamed bases.
        let mut provenance: HashMap<String, Option<Vec<usize>>> = HashMap::new();
        let mut renames: HashMap<String, String> = HashMap::new();

        let mut keys: Vec<&String> = state.keys().collect();
        keys.sort();
        for key in keys {
            let tensor = &state[key];
            if let Some(module) = key.strip_suffix(LORA_A_SUFFIX) {
                lora_a.insert(module.to_string(), tensor);
                continue;
            }
            if let Some(module) = key.strip_suffix(LORA_B_SUFFIX) {
                lora_b.insert(module.to_string(), tensor);
                continue;
            }

            let (tensor, permutation) = match self.transpose_for(key)? {
                Some(rule) => (
                    Self::apply_transpose(rule, key, tensor)?,
                    Some(rule.permutation.clone()),
                ),
                None => (tensor.clone(), None),
            };
            let new_key = match rename(rules, key)? {
                Some(renamed) => renamed,
                None => match self.unmatched {
                    UnmatchedKeyPolicy::PassThrough => key.clone(),
                    UnmatchedKeyPolicy::Drop => {
                        debug!(key, "dropping unmatched checkpoint key");
                        continue;
                    }
                },
            };
            provenance.insert(new_key.clone(), permutation);
            renames.insert(key.clone(), new_key.clone());
            mapped.insert(new_key, tensor);
        }

        self.merge_lora(&mut mapped, &provenance, &renames, lora_a, lora_b)?;
        Ok(mapped)
    }

    fn merge_lora(
        &self,
        mapped: &mut ModelState,
        provenance: &HashMap<String, Option<Vec<usize>>>,
        renames: &HashMap<String, String>,
        lora_a: HashMap<String, &Tensor>,
        lora_b: HashMap<String, &Tensor>,
    ) -> Result<(), MappingError> {
        if lora_a.is_empty() && lora_b.is_empty() {
            return Ok(());
        }
        let config = self
            .lora_config
            .as_ref()
            .ok_or_else(|| MappingError::AdapterResolution {
                module: "*".to_string(),
                detail: "no lora_config in mapping config".to_string(),
            })?;

        for module in lora_b.keys() {
            if !lora_a.contains_key(module) {
                return Err(MappingError::AdapterResolution {
                    module: module.clone(),
                    detail: format!("missing factor '{module}{LORA_A_SUFFIX}'"),
                });
            }
        }
        let mut modules: Vec<&String> = lora_a.keys().collect();
        modules.sort();
        for module in modules {
            if let Some(allowed) = &self.lora_module {
                if !allowed.is_match(module) {
                    return Err(MappingError::AdapterResolution {
                        module: module.clone(),
                        detail: "module is not targeted by module_path".to_string(),
                    });
                }
            }
            let a = lora_a[module];
            let b = *lora_b
                .get(module)
                .ok_or_else(|| MappingError::AdapterResolution {
                    module: module.clone(),
                    detail: format!("missing factor '{module}{LORA_B_SUFFIX}'"),
                })?;

            // Resolve the factor's module name, then follow the rename the
            // base weight itself went through.
            let canonical = match rename(&self.lora_to_hf, module)? {
                Some(renamed) => renamed,
                None => module.clone(),
            };
            let base_key = renames.get(&canonical).cloned().unwrap_or(canonical);
            let base = mapped
                .get(&base_key)
                .ok_or_else(|| MappingError::AdapterResolution {
                    module: module.clone(),
                    detail: format!("base weight '{base_key}' not found"),
                })?;

            let mut delta = b.matmul(a)?.affine(config.scale(), 0.0)?;
            if let Some(Some(permutation)) = provenance.get(&base_key) {
                delta = delta.permute(permutation.as_slice())?;
            }
            debug!(module, base = %base_key, "merging LoRA factors");
            let merged = base.add(&delta.to_dtype(base.dtype())?)?;
            mapped.insert(base_key, merged);
        }
        Ok(())
    }

    /// Check a mapped state against the exact key set a model builder needs.
    pub fn validate_against(
        mapped: &ModelState,
        required_keys: &[String],
    ) -> Result<(), MappingError> {
        let mut missing: Vec<String> = required_keys
            .iter()
            .filter(|k| !mapped.contains_key(*k))
            .cloned()
            .collect();
        missing.sort();
        if !missing.is_empty() {
            return Err(MappingError::MissingKeys { keys: missing });
        }
        let mut unexpected: Vec<String> = mapped
            .keys()
            .filter(|k| !required_keys.contains(*k))
            .cloned()
            .collect();
        unexpected.sort();
        if !unexpected.is_empty() {
            return Err(MappingError::UnexpectedKeys { keys: unexpected });
        }
        Ok(())
    }
}

//! Run manifest: the models and prompts a sequence benchmarks
//!
//! Two JSON files, kept separate so prompt sets can be swapped without touching the model list:
//!
//! ```json
//! {"models": ["llama2", "mistral"], "weights": ["7b", "7b"]}
//! {"prompts": ["Why is the sky blue?", "Explain TCP slow start"]}
//! ```
//!
//! `models` and `weights` are zipped pairwise and must have the same length.

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{MedidorError, Result};

/// One model of the run matrix
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModelSpec {
    /// Model identifier on the endpoint
    pub name: String,
    /// Weight tag handed to the job script
    pub weight: String,
}

impl ModelSpec {
    /// Create a model entry
    pub fn new(name: impl Into<String>, weight: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            weight: weight.into(),
        }
    }
}

#[derive(Debug, Deserialize)]
struct ModelsFile {
    models: Vec<String>,
    #[serde(default)]
    weights: Vec<String>,
}

#[derive(Debug, Deserialize)]
struct PromptsFile {
    prompts: Vec<String>,
}

/// Models and prompts of one sequence
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct RunManifest {
    /// Ordered models
    pub models: Vec<ModelSpec>,
    /// Ordered prompts sent to every job
    pub prompts: Vec<String>,
}

impl RunManifest {
    /// Parse both manifest documents
    ///
    /// # Errors
    /// Returns `Configuration` for invalid JSON, unequal `models`/`weights`, or empty lists
    pub fn from_json(models_json: &str, prompts_json: &str) -> Result<Self> {
        let models: ModelsFile = serde_json::from_str(models_json)
            .map_err(|e| MedidorError::config(format!("invalid models manifest: {e}")))?;
        let prompts: PromptsFile = serde_json::from_str(prompts_json)
            .map_err(|e| MedidorError::config(format!("invalid prompts manifest: {e}")))?;

        if models.models.len() != models.weights.len() {
            return Err(MedidorError::config(format!(
                "models manifest lists {} models but {} weights",
                models.models.len(),
                models.weights.len()
            )));
        }

        let manifest = Self {
            models: models
                .models
                .into_iter()
                .zip(models.weights)
                .map(|(name, weight)| ModelSpec { name, weight })
                .collect(),
            prompts: prompts.prompts,
        };
        manifest.validate()?;
        Ok(manifest)
    }

    /// Read and parse both manifest files
    ///
    /// # Errors
    /// Returns `Io` if a file cannot be read, `Configuration` if it does not parse
    pub fn load(models_path: &Path, prompts_path: &Path) -> Result<Self> {
        let models = std::fs::read_to_string(models_path)?;
        let prompts = std::fs::read_to_string(prompts_path)?;
        Self::from_json(&models, &prompts)
    }

    /// Check the manifest can drive a sequence
    ///
    /// # Errors
    /// Returns `Configuration` for an empty model or prompt list, or a blank prompt
    pub fn validate(&self) -> Result<()> {
        if self.models.is_empty() {
            return Err(MedidorError::config("models manifest is empty"));
        }
        if self.prompts.is_empty() {
            return Err(MedidorError::config("prompts manifest is empty"));
        }
        if let Some(index) = self.prompts.iter().position(|p| p.trim().is_empty()) {
            return Err(MedidorError::config(format!("prompt {index} is blank")));
        }
        Ok(())
    }
}

/// Render prompts in the bracketed wire form `[p1,p2]` passed to remote jobs
///
/// # Errors
/// Returns `Configuration` if a prompt is blank or contains a comma or bracket, which the
/// wire form cannot carry
pub fn format_prompt_list(prompts: &[String]) -> Result<String> {
    if prompts.iter().any(|p| p.trim().is_empty()) {
        return Err(MedidorError::config("blank prompt cannot be passed to a job"));
    }
    if let Some(bad) = prompts.iter().find(|p| p.contains([',', '[', ']'])) {
        return Err(MedidorError::config(format!(
            "prompt cannot be passed to a job (contains ',' or brackets): '{bad}'"
        )));
    }
    Ok(format!("[{}]", prompts.join(",")))
}

/// Parse the bracketed wire form back into prompts, trimming each and dropping empties
#[must_use]
pub fn parse_prompt_list(raw: &str) -> Vec<String> {
    let inner = raw.trim();
    let inner = inner.strip_prefix('[').unwrap_or(inner);
    let inner = inner.strip_suffix(']').unwrap_or(inner);
    inner
        .split(',')
        .map(str::trim)
        .filter(|p| !p.is_empty())
        .map(ToString::to_string)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_from_json_zips_models_and_weights() {
        let manifest = RunManifest::from_json(
            r#"{"models": ["llama2", "mistral"], "weights": ["7b", "7b-instruct"]}"#,
            r#"{"prompts": ["Why is the sky blue?"]}"#,
        )
        .expect("valid manifest");

        assert_eq!(
            manifest.models,
            vec![
                ModelSpec::new("llama2", "7b"),
                ModelSpec::new("mistral", "7b-instruct")
            ]
        );
        assert_eq!(manifest.prompts, vec!["Why is the sky blue?".to_string()]);
    }

    #[test]
    fn test_unequal_lengths_rejected() {
        let err = RunManifest::from_json(
            r#"{"models": ["llama2", "mistral"], "weights": ["7b"]}"#,
            r#"{"prompts": ["hi"]}"#,
        )
        .expect_err("unequal");
        assert!(err.is_fatal());
        assert!(err.to_string().contains("2 models but 1 weights"));
    }

    #[test]
    fn test_empty_and_invalid_rejected() {
        let one_prompt = r#"{"prompts": ["a"]}"#;
        let one_model = r#"{"models": ["a"], "weights": ["b"]}"#;
        assert!(RunManifest::from_json(r#"{"models": [], "weights": []}"#, one_prompt).is_err());
        assert!(RunManifest::from_json(one_model, r#"{"prompts": []}"#).is_err());
        assert!(RunManifest::from_json("not json", one_prompt).is_err());
    }

    #[test]
    fn test_load_from_files() {
        let dir = tempfile::tempdir().expect("tempdir");
        let models = dir.path().join("models.json");
        let prompts = dir.path().join("prompts.json");
        std::fs::write(&models, r#"{"models": ["llama2"], "weights": ["7b"]}"#).expect("write");
        std::fs::write(&prompts, r#"{"prompts": ["a", "b"]}"#).expect("write");

        let manifest = RunManifest::load(&models, &prompts).expect("load");
        assert_eq!(manifest.models.len(), 1);
        assert_eq!(manifest.prompts.len(), 2);

        let err = RunManifest::load(&dir.path().join("missing.json"), &prompts).expect_err("missing");
        assert!(matches!(err, MedidorError::Io(_)));
    }

    #[test]
    fn test_prompt_list_wire_form() {
        let prompts = vec!["Why is the sky blue?".to_string(), "Hello".to_string()];
        let wire = format_prompt_list(&prompts).expect("format");
        assert_eq!(wire, "[Why is the sky blue?,Hello]");
        assert_eq!(parse_prompt_list(&wire), prompts);
    }

    #[test]
    fn test_parse_prompt_list_trims_and_drops_empties() {
        assert_eq!(parse_prompt_list("[ a , ,b ]"), vec!["a".to_string(), "b".to_string()]);
        assert_eq!(parse_prompt_list("single"), vec!["single".to_string()]);
        assert!(parse_prompt_list("[]").is_empty());
    }

    #[test]
    fn test_format_rejects_commas() {
        let err = format_prompt_list(&["a, b".to_string()]).expect_err("comma");
        assert!(matches!(err, MedidorError::Configuration { .. }));
    }

    #[test]
    fn test_blank_prompts_rejected() {
        let one_model = r#"{"models": ["a"], "weights": ["b"]}"#;
        let err = RunManifest::from_json(one_model, r#"{"prompts": ["a", " ", "b"]}"#)
            .expect_err("blank prompt");
        assert!(matches!(err, MedidorError::Configuration { .. }));
        assert!(err.to_string().contains("prompt 1 is blank"));

        let prompts = vec!["a".to_string(), String::new()];
        let err = format_prompt_list(&prompts).expect_err("empty prompt");
        assert!(matches!(err, MedidorError::Configuration { .. }));
    }
}

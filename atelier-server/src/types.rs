//! Wire types for the HTTP surface.

use atelier_core::SeedMode;
use serde::{Deserialize, Serialize};

use crate::history::HistoryRecord;

fn default_steps() -> usize {
    9
}
fn default_dim() -> usize {
    1024
}
fn default_seed() -> i64 {
    -1
}
fn default_lora_enabled() -> bool {
    true
}
fn default_lora_scale() -> f64 {
    1.3
}
fn default_limit() -> i64 {
    20
}

#[derive(Debug, Clone, Deserialize)]
pub struct GenerateRequest {
    pub prompt: String,
    #[serde(default)]
    pub negative_prompt: String,
    #[serde(default = "default_steps")]
    pub steps: usize,
    #[serde(default)]
    pub cfg: f64,
    #[serde(default = "default_dim")]
    pub width: usize,
    #[serde(default = "default_dim")]
    pub height: usize,
    #[serde(default = "default_seed")]
    pub seed: i64,
    #[serde(default)]
    pub seed_mode: SeedMode,
    #[serde(default = "default_lora_enabled")]
    pub lora_enabled: bool,
    #[serde(default = "default_lora_scale")]
    pub lora_scale: f64,
}

#[derive(Debug, Serialize)]
pub struct GenerateResponse {
    pub id: i64,
    pub url: String,
    pub seed: u32,
    pub duration: f64,
    pub meta: HistoryRecord,
}

#[derive(Debug, Serialize)]
pub struct HistoryEntry {
    #[serde(flatten)]
    pub record: HistoryRecord,
    pub url: String,
}

#[derive(Debug, Deserialize)]
pub struct HistoryQuery {
    #[serde(default = "default_limit")]
    pub limit: i64,
    #[serde(default)]
    pub offset: i64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generate_request_defaults() {
        let req: GenerateRequest =
            serde_json::from_str(r#"{"prompt": "a quiet harbor"}"#).unwrap();
        assert_eq!(req.prompt, "a quiet harbor");
        assert_eq!(req.negative_prompt, "");
        assert_eq!(req.steps, 9);
        assert_eq!(req.cfg, 0.0);
        assert_eq!(req.width, 1024);
        assert_eq!(req.height, 1024);
        assert_eq!(req.seed, -1);
        assert_eq!(req.seed_mode, SeedMode::Fixed);
        assert!(req.lora_enabled);
        assert_eq!(req.lora_scale, 1.3);
    }

    #[test]
    fn seed_mode_parses_from_text() {
        let req: GenerateRequest =
            serde_json::from_str(r#"{"prompt": "x", "seed_mode": "random", "seed": 5}"#).unwrap();
        assert_eq!(req.seed_mode, SeedMode::Random);
        assert_eq!(req.seed, 5);
    }
}

//! Generation parameter model and wire encoding
//!
//! The gateway's `params` document uses field shapes that vary with the
//! configuration: `prompt` and `seed` are either a plain value or an
//! array of `[value, weight]` pairs, and disabled sections must be absent
//! rather than null. The encoder therefore builds the `serde_json::Value`
//! tree by hand instead of deriving `Serialize` on the wire shape.
//!
//! The orchestrator diffs successive encodings byte-for-byte to decide
//! whether a push is needed, so [`GenerationParams::encode`] must render
//! the same value identically on every call.

use serde_json::{json, Map, Value};

/// Prompt input: a single text or a weighted schedule.
#[derive(Debug, Clone, PartialEq)]
pub enum PromptInput {
    Text(String),
    Weighted(Vec<(String, f64)>),
}

/// Seed input: a single seed or a weighted schedule.
#[derive(Debug, Clone, PartialEq)]
pub enum SeedInput {
    Single(u64),
    Weighted(Vec<(u64, f64)>),
}

/// Interpolation used when blending a weighted prompt schedule.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InterpolationMethod {
    Slerp,
    Linear,
}

impl InterpolationMethod {
    fn as_str(&self) -> &'static str {
        match self {
            InterpolationMethod::Slerp => "slerp",
            InterpolationMethod::Linear => "linear",
        }
    }
}

/// Frame-similarity skip filter. Absent entirely when disabled.
#[derive(Debug, Clone, PartialEq)]
pub struct SimilarityFilter {
    pub threshold: f64,
    pub max_skip_frames: u32,
}

/// One ControlNet conditioning entry.
#[derive(Debug, Clone, PartialEq)]
pub struct ControlNet {
    pub model_id: String,
    pub conditioning_scale: f64,
    pub preprocessor: String,
    pub preprocessor_params: Map<String, Value>,
    pub enabled: bool,
}

/// Style-adapter (IP-Adapter) settings.
#[derive(Debug, Clone, PartialEq)]
pub struct IpAdapter {
    pub model_id: String,
    pub scale: f64,
    pub style_image_url: Option<String>,
}

/// One image pre/post-processing stage.
#[derive(Debug, Clone, PartialEq)]
pub struct ImageProcessor {
    pub id: String,
    pub params: Map<String, Value>,
}

/// The full set of user-adjustable generation parameters.
///
/// Mutated by the host's configuration surface; this crate only reads it.
#[derive(Debug, Clone, PartialEq)]
pub struct GenerationParams {
    pub model_id: String,
    pub prompt: PromptInput,
    pub prompt_interpolation_method: InterpolationMethod,
    pub normalize_prompt_weights: bool,
    pub negative_prompt: Option<String>,
    pub seed: SeedInput,
    pub normalize_seed_weights: bool,
    pub guidance_scale: f64,
    pub delta: f64,
    pub num_inference_steps: u32,
    pub t_index_list: Vec<u32>,
    pub similarity_filter: Option<SimilarityFilter>,
    pub controlnets: Vec<ControlNet>,
    pub ip_adapter: Option<IpAdapter>,
    pub image_preprocessing: Vec<ImageProcessor>,
    pub image_postprocessing: Vec<ImageProcessor>,
}

impl Default for GenerationParams {
    fn default() -> Self {
        Self {
            model_id: "stabilityai/sd-turbo".to_string(),
            prompt: PromptInput::Text(String::new()),
            prompt_interpolation_method: InterpolationMethod::Slerp,
            normalize_prompt_weights: true,
            negative_prompt: None,
            seed: SeedInput::Single(42),
            normalize_seed_weights: true,
            guidance_scale: 1.0,
            delta: 0.7,
            num_inference_steps: 50,
            t_index_list: vec![35, 45],
            similarity_filter: None,
            controlnets: Vec::new(),
            ip_adapter: None,
            image_preprocessing: Vec::new(),
            image_postprocessing: Vec::new(),
        }
    }
}

impl GenerationParams {
    /// Build the wire `params` object.
    pub fn to_value(&self) -> Value {
        let mut doc = Map::new();
        doc.insert("model_id".into(), json!(self.model_id));

        match &self.prompt {
            PromptInput::Text(text) => {
                doc.insert("prompt".into(), json!(text));
            }
            PromptInput::Weighted(entries) => {
                let pairs: Vec<Value> =
                    entries.iter().map(|(p, w)| json!([p, w])).collect();
                doc.insert("prompt".into(), Value::Array(pairs));
                doc.insert(
                    "prompt_interpolation_method".into(),
                    json!(self.prompt_interpolation_method.as_str()),
                );
                doc.insert(
                    "normalize_prompt_weights".into(),
                    json!(self.normalize_prompt_weights),
                );
            }
        }

        if let Some(neg) = &self.negative_prompt {
            doc.insert("negative_prompt".into(), json!(neg));
        }

        match &self.seed {
            SeedInput::Single(seed) => {
                doc.insert("seed".into(), json!(seed));
            }
            SeedInput::Weighted(entries) => {
                let pairs: Vec<Value> =
                    entries.iter().map(|(s, w)| json!([s, w])).collect();
                doc.insert("seed".into(), Value::Array(pairs));
                doc.insert(
                    "normalize_seed_weights".into(),
                    json!(self.normalize_seed_weights),
                );
            }
        }

        doc.insert("guidance_scale".into(), json!(self.guidance_scale));
        doc.insert("delta".into(), json!(self.delta));
        doc.insert(
            "num_inference_steps".into(),
            json!(self.num_inference_steps),
        );
        doc.insert("t_index_list".into(), json!(self.t_index_list));

        if let Some(filter) = &self.similarity_filter {
            doc.insert("enable_similar_image_filter".into(), json!(true));
            doc.insert(
                "similar_image_filter_threshold".into(),
                json!(filter.threshold),
            );
            doc.insert(
                "similar_image_filter_max_skip_frame".into(),
                json!(filter.max_skip_frames),
            );
        }

        if !self.controlnets.is_empty() {
            let entries: Vec<Value> = self
                .controlnets
                .iter()
                .map(|cn| {
                    let mut entry = Map::new();
                    entry.insert("model_id".into(), json!(cn.model_id));
                    entry.insert(
                        "conditioning_scale".into(),
                        json!(cn.conditioning_scale),
                    );
                    entry.insert("preprocessor".into(), json!(cn.preprocessor));
                    if !cn.preprocessor_params.is_empty() {
                        entry.insert(
                            "preprocessor_params".into(),
                            Value::Object(cn.preprocessor_params.clone()),
                        );
                    }
                    entry.insert("enabled".into(), json!(cn.enabled));
                    Value::Object(entry)
                })
                .collect();
            doc.insert("controlnets".into(), Value::Array(entries));
        }

        if let Some(adapter) = &self.ip_adapter {
            let mut entry = Map::new();
            entry.insert("model_id".into(), json!(adapter.model_id));
            entry.insert("scale".into(), json!(adapter.scale));
            if let Some(url) = &adapter.style_image_url {
                entry.insert("style_image_url".into(), json!(url));
            }
            doc.insert("ip_adapter".into(), Value::Object(entry));
        }

        if !self.image_preprocessing.is_empty() {
            doc.insert(
                "image_preprocessing".into(),
                encode_processors(&self.image_preprocessing),
            );
        }
        if !self.image_postprocessing.is_empty() {
            doc.insert(
                "image_postprocessing".into(),
                encode_processors(&self.image_postprocessing),
            );
        }

        Value::Object(doc)
    }

    /// Canonical serialization used for byte-for-byte change detection.
    pub fn encode(&self) -> String {
        // serde_json renders maps in sorted key order and floats via ryu,
        // so equal values always produce identical bytes.
        self.to_value().to_string()
    }
}

fn encode_processors(stages: &[ImageProcessor]) -> Value {
    let entries: Vec<Value> = stages
        .iter()
        .map(|stage| {
            let mut entry = Map::new();
            entry.insert("id".into(), json!(stage.id));
            if !stage.params.is_empty() {
                entry.insert("params".into(), Value::Object(stage.params.clone()));
            }
            Value::Object(entry)
        })
        .collect();
    Value::Array(entries)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn plain_prompt_has_no_schedule_fields() {
        let params = GenerationParams {
            prompt: PromptInput::Text("a watercolor fox".into()),
            ..Default::default()
        };
        let doc = params.to_value();
        assert_eq!(doc["prompt"], json!("a watercolor fox"));
        assert!(doc.get("prompt_interpolation_method").is_none());
        assert!(doc.get("normalize_prompt_weights").is_none());
    }

    #[test]
    fn weighted_prompt_replaces_plain_field() {
        let params = GenerationParams {
            prompt: PromptInput::Weighted(vec![
                ("a fox".into(), 0.7),
                ("a wolf".into(), 0.3),
            ]),
            ..Default::default()
        };
        let doc = params.to_value();
        assert_eq!(doc["prompt"], json!([["a fox", 0.7], ["a wolf", 0.3]]));
        assert_eq!(doc["prompt_interpolation_method"], json!("slerp"));
        assert_eq!(doc["normalize_prompt_weights"], json!(true));
    }

    #[test]
    fn seed_shapes_are_mutually_exclusive() {
        let single = GenerationParams::default().to_value();
        assert_eq!(single["seed"], json!(42));
        assert!(single.get("normalize_seed_weights").is_none());

        let weighted = GenerationParams {
            seed: SeedInput::Weighted(vec![(42, 0.5), (43, 0.5)]),
            ..Default::default()
        }
        .to_value();
        assert_eq!(weighted["seed"], json!([[42, 0.5], [43, 0.5]]));
        assert_eq!(weighted["normalize_seed_weights"], json!(true));
    }

    #[test]
    fn disabled_similarity_filter_emits_no_keys() {
        let doc = GenerationParams::default().to_value();
        let obj = doc.as_object().unwrap();
        assert!(!obj.keys().any(|k| k.contains("similar_image_filter")));
    }

    #[test]
    fn enabled_similarity_filter_emits_all_keys() {
        let params = GenerationParams {
            similarity_filter: Some(SimilarityFilter {
                threshold: 0.98,
                max_skip_frames: 10,
            }),
            ..Default::default()
        };
        let doc = params.to_value();
        assert_eq!(doc["enable_similar_image_filter"], json!(true));
        assert_eq!(doc["similar_image_filter_threshold"], json!(0.98));
        assert_eq!(doc["similar_image_filter_max_skip_frame"], json!(10));
    }

    #[test]
    fn empty_sections_are_omitted() {
        let doc = GenerationParams::default().to_value();
        let obj = doc.as_object().unwrap();
        assert!(obj.get("controlnets").is_none());
        assert!(obj.get("ip_adapter").is_none());
        assert!(obj.get("image_preprocessing").is_none());
        assert!(obj.get("image_postprocessing").is_none());
        assert!(obj.get("negative_prompt").is_none());
    }

    #[test]
    fn controlnet_entries_keep_their_shape() {
        let mut pp = Map::new();
        pp.insert("low_threshold".into(), json!(100));
        let params = GenerationParams {
            controlnets: vec![ControlNet {
                model_id: "lllyasviel/control_v11p_sd15_canny".into(),
                conditioning_scale: 0.5,
                preprocessor: "canny".into(),
                preprocessor_params: pp,
                enabled: true,
            }],
            ..Default::default()
        };
        let doc = params.to_value();
        let entry = &doc["controlnets"][0];
        assert_eq!(entry["preprocessor"], json!("canny"));
        assert_eq!(entry["preprocessor_params"]["low_threshold"], json!(100));
        assert_eq!(entry["enabled"], json!(true));
    }

    #[test]
    fn encoding_is_deterministic() {
        let params = GenerationParams {
            prompt: PromptInput::Weighted(vec![("a fox".into(), 0.333)]),
            guidance_scale: 1.1,
            delta: 0.5,
            similarity_filter: Some(SimilarityFilter {
                threshold: 0.97,
                max_skip_frames: 8,
            }),
            ..Default::default()
        };
        assert_eq!(params.encode(), params.encode());
        assert_eq!(params.encode(), params.clone().encode());
    }

    #[test]
    fn distinct_values_encode_differently() {
        let a = GenerationParams::default();
        let b = GenerationParams {
            guidance_scale: 1.5,
            ..Default::default()
        };
        assert_ne!(a.encode(), b.encode());
    }
}

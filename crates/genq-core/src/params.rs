use crate::{Result, TaskError, MAX_PROMPT_LEN};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

/// Caller-supplied generation parameters.
///
/// Everything except the prompt is optional; missing values are filled in
/// from [`GenerationDefaults`] when the prediction input is built.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct GenerationParams {
    pub prompt: String,

    #[serde(default, alias = "negative_prompt", skip_serializing_if = "Option::is_none")]
    pub negative_prompt: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub width: Option<u32>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub height: Option<u32>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub steps: Option<u32>,

    #[serde(default, alias = "batch_size", skip_serializing_if = "Option::is_none")]
    pub batch_size: Option<u32>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub seed: Option<i64>,
}

impl GenerationParams {
    pub fn new(prompt: impl Into<String>) -> Self {
        GenerationParams {
            prompt: prompt.into(),
            ..Default::default()
        }
    }

    /// Shape validation performed before anything is queued.
    pub fn validate(&self) -> Result<()> {
        let prompt = self.prompt.trim();
        if prompt.is_empty() {
            return Err(TaskError::invalid("prompt", "must not be empty"));
        }
        if self.prompt.chars().count() > MAX_PROMPT_LEN {
            return Err(TaskError::invalid(
                "prompt",
                format!("must be at most {} characters", MAX_PROMPT_LEN),
            ));
        }

        for (field, value) in [("width", self.width), ("height", self.height)] {
            if let Some(v) = value {
                if !(64..=2048).contains(&v) || v % 8 != 0 {
                    return Err(TaskError::invalid(
                        field,
                        "must be between 64 and 2048 and a multiple of 8",
                    ));
                }
            }
        }

        if let Some(steps) = self.steps {
            if !(1..=100).contains(&steps) {
                return Err(TaskError::invalid("steps", "must be between 1 and 100"));
            }
        }

        if let Some(batch) = self.batch_size {
            if !(1..=4).contains(&batch) {
                return Err(TaskError::invalid("batchSize", "must be between 1 and 4"));
            }
        }

        Ok(())
    }
}

/// Partial parameter replacement accepted on a manual retry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct ParamOverrides {
    #[serde(default)]
    pub prompt: Option<String>,
    #[serde(default, alias = "negative_prompt")]
    pub negative_prompt: Option<String>,
    #[serde(default)]
    pub width: Option<u32>,
    #[serde(default)]
    pub height: Option<u32>,
    #[serde(default)]
    pub steps: Option<u32>,
    #[serde(default, alias = "batch_size")]
    pub batch_size: Option<u32>,
    #[serde(default)]
    pub seed: Option<i64>,
}

impl ParamOverrides {
    pub fn is_empty(&self) -> bool {
        self == &ParamOverrides::default()
    }

    /// Returns a copy of `base` with every supplied override applied.
    pub fn apply(&self, base: &GenerationParams) -> GenerationParams {
        GenerationParams {
            prompt: self.prompt.clone().unwrap_or_else(|| base.prompt.clone()),
            negative_prompt: self
                .negative_prompt
                .clone()
                .or_else(|| base.negative_prompt.clone()),
            width: self.width.or(base.width),
            height: self.height.or(base.height),
            steps: self.steps.or(base.steps),
            batch_size: self.batch_size.or(base.batch_size),
            seed: self.seed.or(base.seed),
        }
    }
}

/// Model settings and fallbacks used to build the provider input.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GenerationDefaults {
    pub negative_prompt: String,
    pub steps: u32,
    pub width: u32,
    pub height: u32,
    pub batch_size: u32,
    pub seed: i64,
    pub model: String,
    pub vae: String,
    pub scheduler: String,
    pub prepend_preprompt: bool,
    pub cfg_scale: f64,
    pub pag_scale: f64,
    pub guidance_rescale: f64,
    pub clip_skip: u32,
}

impl Default for GenerationDefaults {
    fn default() -> Self {
        GenerationDefaults {
            negative_prompt: "nsfw, naked".to_string(),
            steps: 28,
            width: 1024,
            height: 1024,
            batch_size: 1,
            seed: -1,
            model: "Animagine-XL-4.0".to_string(),
            vae: "default".to_string(),
            scheduler: "Euler a".to_string(),
            prepend_preprompt: true,
            cfg_scale: 5.0,
            pag_scale: 3.0,
            guidance_rescale: 0.5,
            clip_skip: 1,
        }
    }
}

impl GenerationDefaults {
    /// Build the opaque provider input for `params`.
    pub fn prediction_input(&self, params: &GenerationParams) -> Value {
        json!({
            "prompt": params.prompt,
            "negative_prompt": params
                .negative_prompt
                .as_deref()
                .filter(|s| !s.is_empty())
                .unwrap_or(&self.negative_prompt),
            "steps": params.steps.unwrap_or(self.steps),
            "width": params.width.unwrap_or(self.width),
            "height": params.height.unwrap_or(self.height),
            "batch_size": params.batch_size.unwrap_or(self.batch_size),
            "model": self.model,
            "vae": self.vae,
            "scheduler": self.scheduler,
            "prepend_preprompt": self.prepend_preprompt,
            "cfg_scale": self.cfg_scale,
            "pag_scale": self.pag_scale,
            "guidance_rescale": self.guidance_rescale,
            "clip_skip": self.clip_skip,
            "seed": params.seed.unwrap_or(self.seed),
        })
    }
}

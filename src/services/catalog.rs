use crate::models::job::GenerationParams;

/// Fallback defaults for models referenced by their full repository path.
const GENERIC_STEPS: u32 = 25;
const GENERIC_GUIDANCE: f64 = 7.5;

/// How a model identifier maps onto the inference endpoint.
#[derive(Debug, Clone, PartialEq)]
pub struct ModelProfile {
    pub id: String,
    /// Path appended to the inference base URL.
    pub path: String,
    pub default_steps: u32,
    pub default_guidance: f64,
}

/// Parameters after model defaults have been applied.
#[derive(Debug, Clone, PartialEq)]
pub struct ResolvedParams {
    pub seed: i64,
    pub width: u32,
    pub height: u32,
    pub steps: u32,
    pub guidance_scale: f64,
}

impl From<&ResolvedParams> for GenerationParams {
    fn from(p: &ResolvedParams) -> Self {
        Self {
            seed: p.seed,
            width: p.width,
            height: p.height,
            steps: Some(p.steps),
            guidance_scale: Some(p.guidance_scale),
        }
    }
}

/// Known models and their per-model defaults.
#[derive(Debug, Clone)]
pub struct ModelCatalog {
    profiles: Vec<ModelProfile>,
}

impl Default for ModelCatalog {
    fn default() -> Self {
        let profile = |id: &str, path: &str, steps, guidance| ModelProfile {
            id: id.to_string(),
            path: path.to_string(),
            default_steps: steps,
            default_guidance: guidance,
        };

        Self {
            profiles: vec![
                profile("turbo", "stabilityai/sdxl-turbo", 4, 0.0),
                profile("sdxl", "stabilityai/stable-diffusion-xl-base-1.0", 30, 7.5),
                profile("sd15", "runwayml/stable-diffusion-v1-5", 25, 7.5),
                profile("flux-schnell", "black-forest-labs/FLUX.1-schnell", 4, 0.0),
                profile("flux-dev", "black-forest-labs/FLUX.1-dev", 28, 3.5),
            ],
        }
    }
}

impl ModelCatalog {
    pub fn new(profiles: Vec<ModelProfile>) -> Self {
        Self { profiles }
    }

    /// Look up a model by short id. Identifiers shaped like `owner/name` pass
    /// through as endpoint paths with generic defaults.
    pub fn resolve(&self, model: &str) -> Option<ModelProfile> {
        if let Some(p) = self.profiles.iter().find(|p| p.id == model || p.path == model) {
            return Some(p.clone());
        }

        let (owner, name) = model.split_once('/')?;
        if owner.is_empty() || name.is_empty() || name.contains('/') {
            return None;
        }
        Some(ModelProfile {
            id: model.to_string(),
            path: model.to_string(),
            default_steps: GENERIC_STEPS,
            default_guidance: GENERIC_GUIDANCE,
        })
    }

    pub fn normalize(profile: &ModelProfile, params: &GenerationParams) -> ResolvedParams {
        ResolvedParams {
            seed: params.seed,
            width: params.width,
            height: params.height,
            steps: params.steps.unwrap_or(profile.default_steps),
            guidance_scale: params.guidance_scale.unwrap_or(profile.default_guidance),
        }
    }
}

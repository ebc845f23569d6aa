//! The seam between the engine and the wrapped inference pipeline.

use std::path::Path;

use candle_core::{DType, Device};
use image::DynamicImage;

/// Fully resolved sampling parameters; the seed is already drawn.
#[derive(Clone, Debug, PartialEq)]
pub struct SampleParams {
    pub prompt: String,
    pub negative_prompt: String,
    pub steps: usize,
    pub guidance: f64,
    pub width: usize,
    pub height: usize,
    pub seed: u32,
}

/// A loaded text-to-image pipeline.
///
/// `run` is synchronous and blocks for the whole sampling pass. The
/// optimization hooks are called once per load, by the engine, in a fixed
/// order; implementations where a sub-model does not exist treat them as
/// no-ops.
pub trait Pipeline: Send {
    fn run(&mut self, params: &SampleParams) -> anyhow::Result<DynamicImage>;

    /// Run the image decoder at full precision regardless of the pipeline
    /// dtype. Reduced precision there produces black or blurred frames.
    fn force_vae_f32(&mut self) -> anyhow::Result<()>;

    /// Keep currently unused sub-models in host memory.
    fn enable_cpu_offload(&mut self) -> anyhow::Result<()>;

    /// Decode the final image in spatial tiles to bound peak memory.
    fn enable_vae_tiling(&mut self) -> anyhow::Result<()>;

    /// Merge a LoRA adapter at the given strength. Not reversible in place;
    /// undoing a merge requires a fresh load.
    fn merge_lora(&mut self, adapter: &Path, scale: f64) -> anyhow::Result<()>;

    /// Best-effort memory hygiene before a generation. Not correctness
    /// critical.
    fn reclaim_memory(&self) {}
}

/// Constructs a pipeline for a device and precision picked by the engine.
pub trait PipelineLoader: Send {
    fn load(&self, device: &Device, dtype: DType) -> anyhow::Result<Box<dyn Pipeline>>;
}

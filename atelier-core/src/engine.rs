//! Model lifecycle management.
//!
//! One `Engine` exists per process. It owns the loaded pipeline, applies the
//! fixed optimization policy after every load, and coordinates LoRA state
//! transitions. The caller is responsible for exclusive access; the server
//! keeps the engine behind a single mutex so generations and reloads are
//! single-flight.

use std::path::PathBuf;
use std::time::Instant;

use image::DynamicImage;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{info, warn};

use crate::device::{
    device_kind, dtype_kind, select_best_device, select_dtype, DeviceKind, DeviceMap, DtypeKind,
};
use crate::pipeline::{Pipeline, PipelineLoader, SampleParams};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum EngineState {
    Unloaded,
    Loading,
    Ready,
    Failed,
}

#[derive(Error, Debug)]
pub enum EngineError {
    #[error("model not loaded")]
    NotLoaded,
    #[error("model load failed: {0}")]
    Load(String),
    #[error("lora update failed: {0}")]
    Lora(String),
    #[error("generation failed: {0}")]
    Generation(String),
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SeedMode {
    #[default]
    Fixed,
    Random,
}

/// Caller-facing generation parameters; the seed is not yet resolved.
#[derive(Clone, Debug)]
pub struct GenerateParams {
    pub prompt: String,
    pub negative_prompt: String,
    pub steps: usize,
    pub guidance: f64,
    pub width: usize,
    pub height: usize,
    pub seed: i64,
    pub seed_mode: SeedMode,
}

/// A successful generation. The resolved seed is always echoed back so a
/// fixed rerun is reproducible from the result alone.
#[derive(Debug)]
pub struct Generation {
    pub image: DynamicImage,
    pub seed: u32,
    pub duration_secs: f64,
}

#[derive(Clone, Debug, Serialize)]
pub struct EngineSnapshot {
    pub loaded: bool,
    pub device: Option<DeviceKind>,
    pub dtype: Option<DtypeKind>,
    pub lora_enabled: bool,
}

/// Memory tactics per device class. New hardware adds a row, not a branch.
#[derive(Clone, Copy, Debug)]
struct OptimizationPlan {
    cpu_offload: bool,
    vae_tiling: bool,
}

const OPTIMIZATION_PLANS: &[(DeviceKind, OptimizationPlan)] = &[
    (
        DeviceKind::Cpu,
        OptimizationPlan { cpu_offload: false, vae_tiling: false },
    ),
    // Discrete VRAM is the constraint here; trade throughput for peak memory.
    (
        DeviceKind::Cuda,
        OptimizationPlan { cpu_offload: true, vae_tiling: true },
    ),
    // Unified memory is ample; keep full quality and speed.
    (
        DeviceKind::Mps,
        OptimizationPlan { cpu_offload: false, vae_tiling: false },
    ),
];

fn plan_for(kind: DeviceKind) -> OptimizationPlan {
    OPTIMIZATION_PLANS
        .iter()
        .find(|(k, _)| *k == kind)
        .map(|(_, plan)| *plan)
        .unwrap_or(OptimizationPlan { cpu_offload: false, vae_tiling: false })
}

pub struct Engine {
    loader: Box<dyn PipelineLoader>,
    device_map: DeviceMap,
    lora_path: PathBuf,
    pipeline: Option<Box<dyn Pipeline>>,
    state: EngineState,
    device: Option<DeviceKind>,
    dtype: Option<DtypeKind>,
    lora_applied: bool,
    lora_scale: Option<f64>,
    load_count: u64,
    last_error: Option<String>,
}

impl Engine {
    pub fn new(
        loader: Box<dyn PipelineLoader>,
        device_map: DeviceMap,
        lora_path: impl Into<PathBuf>,
    ) -> Self {
        Self {
            loader,
            device_map,
            lora_path: lora_path.into(),
            pipeline: None,
            state: EngineState::Unloaded,
            device: None,
            dtype: None,
            lora_applied: false,
            lora_scale: None,
            load_count: 0,
            last_error: None,
        }
    }

    /// Loads (or reloads) the pipeline and applies the optimization policy.
    ///
    /// The previous pipeline is released before the new one is constructed so
    /// the two never reside on the device at the same time. A failure leaves
    /// the engine unloaded but retryable.
    pub fn load(&mut self) -> Result<String, EngineError> {
        self.state = EngineState::Loading;
        self.pipeline = None;
        self.lora_applied = false;
        self.lora_scale = None;

        match self.try_load() {
            Ok(status) => {
                self.state = EngineState::Ready;
                self.load_count += 1;
                self.last_error = None;
                info!(%status, loads = self.load_count, "pipeline ready");
                Ok(status)
            }
            Err(e) => {
                let message = format!("{e:#}");
                warn!(error = %message, "pipeline load failed");
                self.pipeline = None;
                self.device = None;
                self.dtype = None;
                self.state = EngineState::Failed;
                self.last_error = Some(message.clone());
                Err(EngineError::Load(message))
            }
        }
    }

    fn try_load(&mut self) -> anyhow::Result<String> {
        let device = select_best_device(self.device_map)?;
        let dtype = select_dtype(&device);
        let kind = device_kind(&device);
        info!(device = %kind, dtype = %dtype_kind(dtype), "loading pipeline");

        let mut pipeline = self.loader.load(&device, dtype)?;
        Self::apply_optimizations(pipeline.as_mut(), kind)?;

        self.device = Some(kind);
        self.dtype = Some(dtype_kind(dtype));
        self.pipeline = Some(pipeline);
        Ok(format!("ready ({kind})"))
    }

    fn apply_optimizations(pipeline: &mut dyn Pipeline, kind: DeviceKind) -> anyhow::Result<()> {
        // The image decoder misbehaves under reduced precision (black or
        // blurred frames), so f32 there is a correctness override that
        // applies on every device.
        pipeline.force_vae_f32()?;

        let plan = plan_for(kind);
        if plan.cpu_offload {
            pipeline.enable_cpu_offload()?;
            info!("cpu offload enabled");
        }
        if plan.vae_tiling {
            pipeline.enable_vae_tiling()?;
            info!("vae tiling enabled");
        }
        Ok(())
    }

    pub fn is_loaded(&self) -> bool {
        self.state == EngineState::Ready
    }

    pub fn state(&self) -> EngineState {
        self.state
    }

    pub fn lora_applied(&self) -> bool {
        self.lora_applied
    }

    /// Strength of the currently merged adapter, if any.
    pub fn lora_scale(&self) -> Option<f64> {
        self.lora_scale
    }

    /// Number of successful loads since construction. Reload-heavy paths
    /// (LoRA transitions out of the applied state) are observable here.
    pub fn load_count(&self) -> u64 {
        self.load_count
    }

    pub fn last_error(&self) -> Option<&str> {
        self.last_error.as_deref()
    }

    pub fn snapshot(&self) -> EngineSnapshot {
        EngineSnapshot {
            loaded: self.is_loaded(),
            device: self.device,
            dtype: self.dtype,
            lora_enabled: self.lora_applied,
        }
    }

    /// Applies or removes the LoRA adapter.
    ///
    /// Merged weights cannot be unpicked in place, so any transition out of
    /// the applied state goes through a full reload first. Callers should
    /// only invoke this when the requested state differs from the current
    /// one. No-op while unloaded.
    pub fn set_lora(&mut self, enable: bool, scale: f64) -> Result<(), EngineError> {
        if !self.is_loaded() {
            return Ok(());
        }
        match (self.lora_applied, enable) {
            (false, false) => Ok(()),
            (false, true) => self.merge(scale),
            (true, _) => {
                info!(enable, scale, "lora change requires a fresh load");
                self.load()?;
                if enable {
                    self.merge(scale)
                } else {
                    Ok(())
                }
            }
        }
    }

    fn merge(&mut self, scale: f64) -> Result<(), EngineError> {
        let pipeline = self.pipeline.as_mut().ok_or(EngineError::NotLoaded)?;
        pipeline
            .merge_lora(&self.lora_path, scale)
            .map_err(|e| EngineError::Lora(format!("{e:#}")))?;
        self.lora_applied = true;
        self.lora_scale = Some(scale);
        info!(scale, "lora adapter applied");
        Ok(())
    }

    /// Runs one synchronous generation. A failure is reported per request
    /// and leaves the loaded/LoRA state untouched.
    pub fn generate(&mut self, params: &GenerateParams) -> Result<Generation, EngineError> {
        if !self.is_loaded() {
            return Err(EngineError::NotLoaded);
        }
        let pipeline = self.pipeline.as_mut().ok_or(EngineError::NotLoaded)?;
        pipeline.reclaim_memory();

        let seed = resolve_seed(params.seed, params.seed_mode)?;
        let sample = SampleParams {
            prompt: params.prompt.clone(),
            negative_prompt: params.negative_prompt.clone(),
            steps: params.steps,
            guidance: params.guidance,
            width: params.width,
            height: params.height,
            seed,
        };
        info!(
            seed,
            steps = params.steps,
            width = params.width,
            height = params.height,
            "generating"
        );

        let start = Instant::now();
        let image = pipeline
            .run(&sample)
            .map_err(|e| EngineError::Generation(format!("{e:#}")))?;
        let duration_secs = round2(start.elapsed().as_secs_f64());

        Ok(Generation { image, seed, duration_secs })
    }
}

/// `random` mode and the `-1` sentinel both draw a fresh 32-bit seed;
/// anything else is passed through verbatim.
fn resolve_seed(seed: i64, mode: SeedMode) -> Result<u32, EngineError> {
    if mode == SeedMode::Random || seed == -1 {
        return Ok(rand::random::<u32>());
    }
    u32::try_from(seed)
        .map_err(|_| EngineError::Generation(format!("seed {seed} does not fit in 32 bits")))
}

fn round2(secs: f64) -> f64 {
    (secs * 100.0).round() / 100.0
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::Path;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::{Arc, Mutex};

    use candle_core::{DType, Device};

    #[derive(Default)]
    struct Calls {
        vae_f32: usize,
        offload: usize,
        tiling: usize,
        merges: Vec<f64>,
    }

    struct MockPipeline {
        alive: Arc<AtomicUsize>,
        calls: Arc<Mutex<Calls>>,
        fail_run: bool,
    }

    impl Drop for MockPipeline {
        fn drop(&mut self) {
            self.alive.fetch_sub(1, Ordering::SeqCst);
        }
    }

    impl Pipeline for MockPipeline {
        fn run(&mut self, _params: &SampleParams) -> anyhow::Result<DynamicImage> {
            if self.fail_run {
                anyhow::bail!("sampler exploded");
            }
            Ok(DynamicImage::new_rgb8(8, 8))
        }

        fn force_vae_f32(&mut self) -> anyhow::Result<()> {
            self.calls.lock().unwrap().vae_f32 += 1;
            Ok(())
        }

        fn enable_cpu_offload(&mut self) -> anyhow::Result<()> {
            self.calls.lock().unwrap().offload += 1;
            Ok(())
        }

        fn enable_vae_tiling(&mut self) -> anyhow::Result<()> {
            self.calls.lock().unwrap().tiling += 1;
            Ok(())
        }

        fn merge_lora(&mut self, _adapter: &Path, scale: f64) -> anyhow::Result<()> {
            self.calls.lock().unwrap().merges.push(scale);
            Ok(())
        }
    }

    #[derive(Default)]
    struct MockLoader {
        alive: Arc<AtomicUsize>,
        calls: Arc<Mutex<Calls>>,
        fail_loads: AtomicUsize,
        fail_run: bool,
    }

    impl PipelineLoader for MockLoader {
        fn load(&self, _device: &Device, _dtype: DType) -> anyhow::Result<Box<dyn Pipeline>> {
            if self.fail_loads.load(Ordering::SeqCst) > 0 {
                self.fail_loads.fetch_sub(1, Ordering::SeqCst);
                anyhow::bail!("weights missing");
            }
            anyhow::ensure!(
                self.alive.load(Ordering::SeqCst) == 0,
                "previous pipeline still alive during load"
            );
            self.alive.fetch_add(1, Ordering::SeqCst);
            Ok(Box::new(MockPipeline {
                alive: self.alive.clone(),
                calls: self.calls.clone(),
                fail_run: self.fail_run,
            }))
        }
    }

    fn engine_with(loader: MockLoader) -> (Engine, Arc<Mutex<Calls>>) {
        let calls = loader.calls.clone();
        let engine = Engine::new(Box::new(loader), DeviceMap::ForceCpu, "adapter.safetensors");
        (engine, calls)
    }

    fn params(seed: i64, seed_mode: SeedMode) -> GenerateParams {
        GenerateParams {
            prompt: "a lighthouse at dusk".into(),
            negative_prompt: String::new(),
            steps: 4,
            guidance: 0.0,
            width: 64,
            height: 64,
            seed,
            seed_mode,
        }
    }

    #[test]
    fn load_applies_policy_for_cpu() {
        let (mut engine, calls) = engine_with(MockLoader::default());
        assert_eq!(engine.state(), EngineState::Unloaded);
        engine.load().unwrap();
        assert!(engine.is_loaded());
        assert_eq!(engine.load_count(), 1);

        let calls = calls.lock().unwrap();
        // The decoder override is unconditional; offload and tiling are
        // reserved for constrained accelerators.
        assert_eq!(calls.vae_f32, 1);
        assert_eq!(calls.offload, 0);
        assert_eq!(calls.tiling, 0);
    }

    #[test]
    fn device_tactics_follow_the_plan_table() {
        let cuda = plan_for(DeviceKind::Cuda);
        assert!(cuda.cpu_offload);
        assert!(cuda.vae_tiling);

        let mps = plan_for(DeviceKind::Mps);
        assert!(!mps.cpu_offload);
        assert!(!mps.vae_tiling);

        let cpu = plan_for(DeviceKind::Cpu);
        assert!(!cpu.cpu_offload);
        assert!(!cpu.vae_tiling);
    }

    #[test]
    fn reload_releases_previous_pipeline_first() {
        // MockLoader::load errors out if a pipeline is still alive when a
        // new one is constructed.
        let (mut engine, _) = engine_with(MockLoader::default());
        engine.load().unwrap();
        engine.load().unwrap();
        assert_eq!(engine.load_count(), 2);
        assert!(engine.is_loaded());
    }

    #[test]
    fn failed_load_is_retryable() {
        let loader = MockLoader {
            fail_loads: AtomicUsize::new(1),
            ..Default::default()
        };
        let (mut engine, _) = engine_with(loader);

        let err = engine.load().unwrap_err();
        assert!(matches!(err, EngineError::Load(_)));
        assert!(!engine.is_loaded());
        assert_eq!(engine.state(), EngineState::Failed);
        assert!(engine.last_error().unwrap().contains("weights missing"));

        engine.load().unwrap();
        assert!(engine.is_loaded());
        assert!(engine.last_error().is_none());
    }

    #[test]
    fn lora_disable_when_unapplied_is_noop() {
        let (mut engine, calls) = engine_with(MockLoader::default());
        engine.load().unwrap();
        engine.set_lora(false, 1.0).unwrap();
        assert_eq!(engine.load_count(), 1);
        assert!(!engine.lora_applied());
        assert!(calls.lock().unwrap().merges.is_empty());
    }

    #[test]
    fn lora_enable_when_unapplied_merges_without_reload() {
        let (mut engine, calls) = engine_with(MockLoader::default());
        engine.load().unwrap();
        engine.set_lora(true, 1.3).unwrap();
        assert!(engine.lora_applied());
        assert_eq!(engine.load_count(), 1);
        assert_eq!(calls.lock().unwrap().merges, vec![1.3]);
    }

    #[test]
    fn lora_rescale_reloads_then_merges() {
        let (mut engine, calls) = engine_with(MockLoader::default());
        engine.load().unwrap();
        engine.set_lora(true, 1.3).unwrap();
        assert_eq!(engine.lora_scale(), Some(1.3));
        engine.set_lora(true, 0.8).unwrap();
        assert!(engine.lora_applied());
        assert_eq!(engine.lora_scale(), Some(0.8));
        assert_eq!(engine.load_count(), 2);
        assert_eq!(calls.lock().unwrap().merges, vec![1.3, 0.8]);
    }

    #[test]
    fn lora_disable_when_applied_reloads() {
        let (mut engine, _) = engine_with(MockLoader::default());
        engine.load().unwrap();
        engine.set_lora(true, 1.3).unwrap();
        engine.set_lora(false, 1.3).unwrap();
        assert!(!engine.lora_applied());
        assert_eq!(engine.lora_scale(), None);
        assert_eq!(engine.load_count(), 2);
    }

    #[test]
    fn rapid_lora_toggling_ends_consistent() {
        let (mut engine, _) = engine_with(MockLoader::default());
        engine.load().unwrap();
        for _ in 0..3 {
            engine.set_lora(true, 1.0).unwrap();
            assert!(engine.lora_applied());
            engine.set_lora(false, 1.0).unwrap();
            assert!(!engine.lora_applied());
        }
        assert!(engine.is_loaded());
    }

    #[test]
    fn lora_while_unloaded_is_noop() {
        let (mut engine, calls) = engine_with(MockLoader::default());
        engine.set_lora(true, 1.0).unwrap();
        assert!(!engine.lora_applied());
        assert_eq!(engine.load_count(), 0);
        assert!(calls.lock().unwrap().merges.is_empty());
    }

    #[test]
    fn generate_while_unloaded_fails_distinguishably() {
        let (mut engine, _) = engine_with(MockLoader::default());
        let err = engine.generate(&params(42, SeedMode::Fixed)).unwrap_err();
        assert!(matches!(err, EngineError::NotLoaded));
    }

    #[test]
    fn fixed_seed_is_passed_through() {
        let (mut engine, _) = engine_with(MockLoader::default());
        engine.load().unwrap();
        let first = engine.generate(&params(42, SeedMode::Fixed)).unwrap();
        let second = engine.generate(&params(42, SeedMode::Fixed)).unwrap();
        assert_eq!(first.seed, 42);
        assert_eq!(second.seed, 42);
    }

    #[test]
    fn sentinel_seed_draws_fresh() {
        let (mut engine, _) = engine_with(MockLoader::default());
        engine.load().unwrap();
        // -1 means "pick randomly"; the drawn u32 must be echoed back.
        let generation = engine.generate(&params(-1, SeedMode::Fixed)).unwrap();
        let _echoed: u32 = generation.seed;
        assert!(generation.duration_secs >= 0.0);
    }

    #[test]
    fn negative_seed_other_than_sentinel_is_rejected() {
        let (mut engine, _) = engine_with(MockLoader::default());
        engine.load().unwrap();
        let err = engine.generate(&params(-5, SeedMode::Fixed)).unwrap_err();
        assert!(matches!(err, EngineError::Generation(_)));
    }

    #[test]
    fn failed_generation_preserves_engine_state() {
        let loader = MockLoader { fail_run: true, ..Default::default() };
        let (mut engine, _) = engine_with(loader);
        engine.load().unwrap();
        engine.set_lora(true, 1.0).unwrap();

        let err = engine.generate(&params(42, SeedMode::Fixed)).unwrap_err();
        assert!(matches!(err, EngineError::Generation(_)));
        assert!(engine.is_loaded());
        assert!(engine.lora_applied());
    }

    #[test]
    fn snapshot_reflects_state() {
        let (mut engine, _) = engine_with(MockLoader::default());
        let unloaded = engine.snapshot();
        assert!(!unloaded.loaded);
        assert!(unloaded.device.is_none());

        engine.load().unwrap();
        let loaded = engine.snapshot();
        assert!(loaded.loaded);
        assert_eq!(loaded.device, Some(DeviceKind::Cpu));
        assert_eq!(loaded.dtype, Some(DtypeKind::Fp32));
        assert!(!loaded.lora_enabled);
    }

    #[test]
    fn resolve_seed_rules() {
        assert_eq!(resolve_seed(42, SeedMode::Fixed).unwrap(), 42);
        assert_eq!(resolve_seed(0, SeedMode::Fixed).unwrap(), 0);
        assert!(resolve_seed(-7, SeedMode::Fixed).is_err());
        assert!(resolve_seed(i64::from(u32::MAX) + 1, SeedMode::Fixed).is_err());
        // Random mode always succeeds, whatever the supplied seed.
        resolve_seed(42, SeedMode::Random).unwrap();
        resolve_seed(-1, SeedMode::Random).unwrap();
    }

    #[test]
    fn durations_round_to_two_decimals() {
        assert_eq!(round2(1.23456), 1.23);
        assert_eq!(round2(0.005), 0.01);
        assert_eq!(round2(12.0), 12.0);
    }
}

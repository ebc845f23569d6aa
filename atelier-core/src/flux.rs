//! Candle-backed Flux pipeline.
//!
//! T5 and CLIP text encoders, the Flux transformer and its autoencoder,
//! fetched through the hf-hub api. The engine drives this type through the
//! `Pipeline` trait; the optimization hooks rebuild the affected sub-model
//! rather than mutate it, since candle models are immutable once built.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use anyhow::{Context, Error, Result};
use candle_core::{DType, Device, IndexOp, Tensor};
use candle_nn::{Module, VarBuilder};
use candle_transformers::models::clip::text_model::{self, ClipTextTransformer};
use candle_transformers::models::flux::{
    self,
    autoencoder::{self, AutoEncoder},
    model::{self, Flux},
};
use candle_transformers::models::t5::{self, T5EncoderModel};
use hf_hub::api::sync::Api;
use image::DynamicImage;
use tokenizers::Tokenizer;
use tracing::{debug, info};

use crate::lora::LoraAdapter;
use crate::pipeline::{Pipeline, PipelineLoader, SampleParams};
use crate::util::tensor_to_image;

// 64 latent rows decode to a 512-pixel band.
const VAE_TILE_ROWS: usize = 64;
// Extra latent rows read on each side of a band. The decoder is
// convolutional, so a band cut hard at the boundary loses its neighbors'
// receptive field and seams; decoding the overlap and cropping it away
// keeps boundary pixels identical to a full decode.
const VAE_TILE_OVERLAP: usize = 8;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FluxVariant {
    Schnell,
    Dev,
}

impl FluxVariant {
    /// Detect the variant from a model name; schnell when unspecified.
    pub fn from_name(name: &str) -> Self {
        if name.to_uppercase().contains("DEV") {
            Self::Dev
        } else {
            Self::Schnell
        }
    }

    fn weight_file(self) -> &'static str {
        match self {
            Self::Schnell => "flux1-schnell.safetensors",
            Self::Dev => "flux1-dev.safetensors",
        }
    }

    fn t5_token_budget(self) -> usize {
        match self {
            Self::Schnell => 256,
            Self::Dev => 512,
        }
    }
}

/// Loads a Flux pipeline from a hub repo (or a local snapshot of one).
pub struct FluxLoader {
    repo: String,
    variant: FluxVariant,
}

impl FluxLoader {
    pub fn new(repo: impl Into<String>) -> Self {
        let repo = repo.into();
        let variant = FluxVariant::from_name(&repo);
        Self { repo, variant }
    }
}

impl PipelineLoader for FluxLoader {
    fn load(&self, device: &Device, dtype: DType) -> Result<Box<dyn Pipeline>> {
        let api = Api::new().context("failed to create hf hub api")?;
        info!(repo = %self.repo, variant = ?self.variant, "fetching pipeline weights");

        // --- T5 encoder, config and tokenizer ---
        let t5_repo = api.repo(hf_hub::Repo::with_revision(
            "google/t5-v1_1-xxl".to_string(),
            hf_hub::RepoType::Model,
            "refs/pr/2".to_string(),
        ));
        let t5_file = t5_repo
            .get("model.safetensors")
            .context("failed to get T5 model file")?;
        let t5_config_file = t5_repo
            .get("config.json")
            .context("failed to get T5 config")?;
        let t5_config: t5::Config = serde_json::from_str(
            &std::fs::read_to_string(&t5_config_file).context("failed to read T5 config")?,
        )
        .context("failed to parse T5 config")?;
        let t5_tokenizer_file = api
            .model("lmz/mt5-tokenizers".to_string())
            .get("t5-v1_1-xxl.tokenizer.json")
            .context("failed to get T5 tokenizer")?;
        let t5_tokenizer = Tokenizer::from_file(t5_tokenizer_file)
            .map_err(Error::msg)
            .context("failed to load T5 tokenizer")?;

        // --- CLIP encoder and tokenizer ---
        let clip_repo = api.repo(hf_hub::Repo::model(
            "openai/clip-vit-large-patch14".to_string(),
        ));
        let clip_file = clip_repo
            .get("model.safetensors")
            .context("failed to get CLIP model file")?;
        let clip_tokenizer_file = clip_repo
            .get("tokenizer.json")
            .context("failed to get CLIP tokenizer")?;
        let clip_tokenizer = Tokenizer::from_file(clip_tokenizer_file)
            .map_err(Error::msg)
            .context("failed to load CLIP tokenizer")?;

        // --- Flux transformer and autoencoder ---
        let base_repo = api.repo(hf_hub::Repo::model(self.repo.clone()));
        let ae_file = base_repo
            .get("ae.safetensors")
            .context("failed to get autoencoder file")?;
        let flux_file = base_repo
            .get(self.variant.weight_file())
            .context("failed to get flux transformer file")?;

        let files = FluxFiles { t5: t5_file, t5_config, clip: clip_file, ae: ae_file, flux: flux_file };
        let pipeline = FluxPipeline::assemble(
            files,
            t5_tokenizer,
            clip_tokenizer,
            self.variant,
            device.clone(),
            dtype,
        )?;
        Ok(Box::new(pipeline))
    }
}

/// Resolved weight files; kept so sub-models can be rebuilt after load
/// (precision override, offload, LoRA fusion).
struct FluxFiles {
    t5: PathBuf,
    t5_config: t5::Config,
    clip: PathBuf,
    ae: PathBuf,
    flux: PathBuf,
}

pub struct FluxPipeline {
    device: Device,
    dtype: DType,
    variant: FluxVariant,
    files: FluxFiles,
    t5: T5EncoderModel,
    t5_tokenizer: Tokenizer,
    clip: ClipTextTransformer,
    clip_tokenizer: Tokenizer,
    autoencoder: AutoEncoder,
    ae_dtype: DType,
    flux_model: Flux,
    encoder_device: Device,
    vae_tiling: bool,
}

impl FluxPipeline {
    fn assemble(
        files: FluxFiles,
        t5_tokenizer: Tokenizer,
        clip_tokenizer: Tokenizer,
        variant: FluxVariant,
        device: Device,
        dtype: DType,
    ) -> Result<Self> {
        let t5 = Self::build_t5(&files, dtype, &device)?;
        let clip = Self::build_clip(&files.clip, dtype, &device)?;
        let autoencoder = Self::build_autoencoder(&files.ae, dtype, &device, variant)?;
        let flux_model = Self::build_flux(&files.flux, dtype, &device, variant, None)?;
        info!(dtype = ?dtype, "flux pipeline assembled");
        Ok(Self {
            encoder_device: device.clone(),
            device,
            dtype,
            variant,
            files,
            t5,
            t5_tokenizer,
            clip,
            clip_tokenizer,
            autoencoder,
            ae_dtype: dtype,
            flux_model,
            vae_tiling: false,
        })
    }

    fn build_t5(files: &FluxFiles, dtype: DType, device: &Device) -> Result<T5EncoderModel> {
        let vb = unsafe {
            VarBuilder::from_mmaped_safetensors(&[files.t5.clone()], dtype, device)
                .context("failed to build T5 var builder")?
        };
        T5EncoderModel::load(vb, &files.t5_config).context("failed to load T5 encoder")
    }

    fn build_clip(file: &Path, dtype: DType, device: &Device) -> Result<ClipTextTransformer> {
        let vb = unsafe {
            VarBuilder::from_mmaped_safetensors(&[file.to_path_buf()], dtype, device)
                .context("failed to build CLIP var builder")?
        };
        let config = text_model::ClipTextConfig {
            vocab_size: 49408,
            projection_dim: 768,
            activation: text_model::Activation::QuickGelu,
            intermediate_size: 3072,
            embed_dim: 768,
            max_position_embeddings: 77,
            pad_with: None,
            num_hidden_layers: 12,
            num_attention_heads: 12,
        };
        ClipTextTransformer::new(vb.pp("text_model"), &config).context("failed to load CLIP encoder")
    }

    fn build_autoencoder(
        file: &Path,
        dtype: DType,
        device: &Device,
        variant: FluxVariant,
    ) -> Result<AutoEncoder> {
        let vb = unsafe {
            VarBuilder::from_mmaped_safetensors(&[file.to_path_buf()], dtype, device)
                .context("failed to build autoencoder var builder")?
        };
        let config = match variant {
            FluxVariant::Schnell => autoencoder::Config::schnell(),
            FluxVariant::Dev => autoencoder::Config::dev(),
        };
        AutoEncoder::new(&config, vb).context("failed to load autoencoder")
    }

    fn build_flux(
        file: &Path,
        dtype: DType,
        device: &Device,
        variant: FluxVariant,
        adapter: Option<(&LoraAdapter, f64)>,
    ) -> Result<Flux> {
        let config = match variant {
            FluxVariant::Schnell => model::Config::schnell(),
            FluxVariant::Dev => model::Config::dev(),
        };
        let vb = match adapter {
            None => unsafe {
                VarBuilder::from_mmaped_safetensors(&[file.to_path_buf()], dtype, device)
                    .context("failed to build flux var builder")?
            },
            Some((adapter, scale)) => {
                // Fuse the adapter into the raw weight map before the model
                // is constructed; built models cannot be edited in place.
                let mut tensors = candle_core::safetensors::load(file, device)
                    .context("failed to read flux weights")?;
                adapter.fuse_into(&mut tensors, scale)?;
                let tensors = tensors
                    .into_iter()
                    .map(|(name, tensor)| Ok((name, tensor.to_dtype(dtype)?)))
                    .collect::<candle_core::Result<HashMap<_, _>>>()?;
                VarBuilder::from_tensors(tensors, dtype, device)
            }
        };
        Flux::new(&config, vb).context("failed to load flux transformer")
    }

    /// Draws the initial noise bound to the resolved seed. Backends without
    /// a seedable generator fall back to host-side noise moved to the
    /// device; everything else still runs on the target device.
    fn seeded_noise(&self, params: &SampleParams) -> Result<Tensor> {
        match self.device.set_seed(u64::from(params.seed)) {
            Ok(()) => Ok(
                flux::sampling::get_noise(1, params.height, params.width, &self.device)?
                    .to_dtype(self.dtype)?,
            ),
            Err(e) => {
                debug!(error = %e, "device generator unavailable, seeding on host");
                let cpu = Device::Cpu;
                cpu.set_seed(u64::from(params.seed))?;
                Ok(flux::sampling::get_noise(1, params.height, params.width, &cpu)?
                    .to_device(&self.device)?
                    .to_dtype(self.dtype)?)
            }
        }
    }

    fn encode_t5(&mut self, prompt: &str) -> Result<Tensor> {
        let mut tokens = self
            .t5_tokenizer
            .encode(prompt, true)
            .map_err(Error::msg)?
            .get_ids()
            .to_vec();
        tokens.resize(self.variant.t5_token_budget(), 0);
        let ids = Tensor::new(&*tokens, &self.encoder_device)?.unsqueeze(0)?;
        let emb = self.t5.forward(&ids)?;
        Ok(emb.to_device(&self.device)?.to_dtype(self.dtype)?)
    }

    fn encode_clip(&mut self, prompt: &str) -> Result<Tensor> {
        let tokens = self
            .clip_tokenizer
            .encode(prompt, true)
            .map_err(Error::msg)?
            .get_ids()
            .to_vec();
        let ids = Tensor::new(&*tokens, &self.encoder_device)?.unsqueeze(0)?;
        let emb = self.clip.forward(&ids)?;
        Ok(emb.to_device(&self.device)?.to_dtype(self.dtype)?)
    }

    fn decode(&self, latent: &Tensor) -> Result<Tensor> {
        let latent = latent.to_dtype(self.ae_dtype)?;
        if !self.vae_tiling {
            return Ok(self.autoencoder.decode(&latent)?);
        }
        let (_b, _c, height, _w) = latent.dims4()?;
        let mut bands = Vec::new();
        for (start, len) in tile_ranges(height, VAE_TILE_ROWS) {
            let (read_start, read_len, pad_before) =
                padded_range(start, len, height, VAE_TILE_OVERLAP);
            let band = latent.narrow(2, read_start, read_len)?;
            let decoded = self.autoencoder.decode(&band)?;
            let upscale = decoded.dims4()?.2 / read_len;
            bands.push(decoded.narrow(2, pad_before * upscale, len * upscale)?);
        }
        if bands.len() == 1 {
            return Ok(bands.remove(0));
        }
        Ok(Tensor::cat(&bands, 2)?)
    }
}

impl Pipeline for FluxPipeline {
    fn run(&mut self, params: &SampleParams) -> Result<DynamicImage> {
        if !params.negative_prompt.is_empty() {
            // Flux has no negative-prompt conditioning slot.
            debug!("negative prompt ignored by this pipeline");
        }

        let noise = self.seeded_noise(params)?;
        let t5_emb = self.encode_t5(&params.prompt)?;
        let clip_emb = self.encode_clip(&params.prompt)?;

        let state = flux::sampling::State::new(&t5_emb, &clip_emb, &noise)?;
        let timesteps = match self.variant {
            FluxVariant::Dev => {
                flux::sampling::get_schedule(params.steps, Some((state.img.dims()[1], 0.5, 1.15)))
            }
            FluxVariant::Schnell => flux::sampling::get_schedule(params.steps, None),
        };

        let latent = flux::sampling::denoise(
            &self.flux_model,
            &state.img,
            &state.img_ids,
            &state.txt,
            &state.txt_ids,
            &state.vec,
            &timesteps,
            params.guidance,
        )?;
        let unpacked = flux::sampling::unpack(&latent, params.height, params.width)?;
        debug!(shape = ?unpacked.dims(), "latent image sampled");

        let decoded = self.decode(&unpacked)?;
        let img = ((decoded.clamp(-1f32, 1f32)? + 1.0)? * 127.5)?.to_dtype(DType::U8)?;
        tensor_to_image(&img.i(0)?)
    }

    fn force_vae_f32(&mut self) -> Result<()> {
        if self.ae_dtype != DType::F32 {
            self.autoencoder =
                Self::build_autoencoder(&self.files.ae, DType::F32, &self.device, self.variant)?;
            self.ae_dtype = DType::F32;
            info!("autoencoder rebuilt at f32");
        }
        Ok(())
    }

    fn enable_cpu_offload(&mut self) -> Result<()> {
        if matches!(self.encoder_device, Device::Cpu) {
            return Ok(());
        }
        // The text encoders are the largest sub-models that sit idle during
        // denoising; keep them in host memory and copy embeddings over.
        self.encoder_device = Device::Cpu;
        self.t5 = Self::build_t5(&self.files, DType::F32, &Device::Cpu)?;
        self.clip = Self::build_clip(&self.files.clip, DType::F32, &Device::Cpu)?;
        Ok(())
    }

    fn enable_vae_tiling(&mut self) -> Result<()> {
        self.vae_tiling = true;
        Ok(())
    }

    fn merge_lora(&mut self, adapter: &Path, scale: f64) -> Result<()> {
        let adapter = LoraAdapter::load(adapter, &self.device)?;
        self.flux_model =
            Self::build_flux(&self.files.flux, self.dtype, &self.device, self.variant, Some((&adapter, scale)))?;
        Ok(())
    }

    fn reclaim_memory(&self) {
        // Flushing queued work lets freed buffers actually be reused.
        if let Err(e) = self.device.synchronize() {
            debug!(error = %e, "device synchronize failed");
        }
    }
}

fn tile_ranges(len: usize, tile: usize) -> Vec<(usize, usize)> {
    let mut ranges = Vec::new();
    let mut start = 0;
    while start < len {
        let n = tile.min(len - start);
        ranges.push((start, n));
        start += n;
    }
    ranges
}

/// Widens a band by up to `overlap` rows on each side, clamped to the
/// tensor. Returns the widened start and length plus how much padding
/// actually landed before the band (the decoded crop offset).
fn padded_range(start: usize, len: usize, total: usize, overlap: usize) -> (usize, usize, usize) {
    let pad_before = start.min(overlap);
    let pad_after = (total - start - len).min(overlap);
    (start - pad_before, pad_before + len + pad_after, pad_before)
}

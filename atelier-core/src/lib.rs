pub mod device;
pub mod engine;
pub mod flux;
pub mod lora;
pub mod pipeline;
mod util;

pub use device::{
    device_kind, dtype_kind, select_best_device, select_dtype, DeviceKind, DeviceMap, DtypeKind,
};
pub use engine::{
    Engine, EngineError, EngineSnapshot, EngineState, GenerateParams, Generation, SeedMode,
};
pub use flux::{FluxLoader, FluxVariant};
pub use lora::LoraAdapter;
pub use pipeline::{Pipeline, PipelineLoader, SampleParams};

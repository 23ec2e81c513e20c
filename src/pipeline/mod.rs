pub mod consolidate;
pub mod detector;
pub mod embedder;
#[cfg(feature = "facial-recognition")]
pub mod face;
pub mod index;
pub mod ingest;
pub mod sampler;
pub mod search;
pub mod tracker;

pub use detector::FaceDetector;
pub use embedder::FaceEmbedder;
pub use index::{FaceIndex, IndexStore};
pub use ingest::{Backends, IngestJob, IngestionPipeline, PipelineConfig};
pub use sampler::{FrameDecoder, SamplerConfig};
pub use search::{SearchConfig, SearchEngine};

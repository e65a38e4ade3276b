pub mod attention;
pub mod blocks;
pub mod embeddings;
pub mod layers;
pub mod network;
pub mod time_resblock;
pub mod unet;

// Re-export key types
pub use attention::{AttentionBlock, AttentionBlockConfig};
pub use blocks::{DownBlock, MidBlock, SkipConnections, StageConfig, UpBlock};
pub use embeddings::{SinusoidalTimesteps, TimestepEmbedding};
pub use layers::VarBuilder;
pub use network::DenoisingNetwork;
pub use time_resblock::{TimeInjection, TimeResidualBlock, TimeResidualBlockConfig};
pub use unet::{TimeUnet, TimeUnetConfig};

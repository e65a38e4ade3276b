pub mod diffusion;
pub mod error;
pub mod models;

// Re-export common types
pub use diffusion::{
    load_config, timestep_pairs, BetaSchedule, Config, DiffusionConfig, DiffusionProcess, FinalStep, NoiseSchedule,
    SamplingConfig, Transition,
};
pub use error::{DiffusionError, Result};
pub use models::{
    AttentionBlock, DenoisingNetwork, DownBlock, MidBlock, TimeInjection, TimeResidualBlock, TimeUnet,
    TimeUnetConfig, UpBlock,
};

pub mod logging {
    use env_logger::Builder;
    use log::LevelFilter;
    use std::io::Write;

    /// Timestamped stderr logger at `info`, overridable through `RUST_LOG`.
    /// Safe to call more than once.
    pub fn init_logger() {
        // A logger may already be installed; keep it.
        Builder::new()
            .format(|buf, record| {
                writeln!(
                    buf,
                    "{} [{}] - {}",
                    chrono::Local::now().format("%Y-%m-%d %H:%M:%S"),
                    record.level(),
                    record.args()
                )
            })
            .filter(None, LevelFilter::Info)
            .parse_default_env()
            .try_init()
            .ok();
    }

    #[cfg(test)]
    mod tests {
        #[test]
        fn test_init_logger_twice() {
            super::init_logger();
            super::init_logger();
            log::info!("logger initialised");
        }
    }
}

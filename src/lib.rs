pub mod conditioning;
pub mod config;
pub mod error;
pub mod instances;
pub mod models;
pub mod noise;
pub mod output;
pub mod pipeline;
pub mod postprocess;
pub mod preprocess;
pub mod sampler;

// Re-export common types
pub use config::{load_config, GenModel, GenerateConfig};
pub use error::RunError;
pub use pipeline::Session;
pub use sampler::{Candidate, RankedSelection, SampleParams};

pub mod logging {
    use env_logger::Builder;
    use log::LevelFilter;
    use std::io::Write;

    pub fn init_logger() {
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
            .init();
    }
}

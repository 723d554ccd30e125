pub mod config;
pub mod logging;
pub mod media;

pub use config::MurmurConfig;

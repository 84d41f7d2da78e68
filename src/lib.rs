pub mod config;
pub mod error;
pub mod index;
pub mod pointer;
pub mod seeder;
pub mod stats;
pub mod storage;
pub mod transport;
pub mod watcher;

pub use config::SeederConfig;
pub use error::{Result, SeedError};

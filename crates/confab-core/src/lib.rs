pub mod config;
pub mod engine;
pub mod generator;
pub mod history;
pub mod prompt;

pub use config::*;
pub use engine::*;
pub use generator::*;
pub use history::*;
pub use prompt::*;

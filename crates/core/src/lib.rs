pub mod config;
pub mod error;
pub mod slug;

pub use config::Config;
pub use error::ConfigError;
pub use slug::slugify;

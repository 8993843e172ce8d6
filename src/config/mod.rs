pub mod app_config;
pub mod model;

pub use app_config::{AppConfig, AuthSource, CompartmentSource, ConfigError, load_config};

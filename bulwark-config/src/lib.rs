//! Configuration for Bulwark dependencies.
//!
//! Settings come from a JSON or TOML file (or a `.env` file of overrides),
//! are overlaid with `BULWARK_<SECTION>__<FIELD>` environment variables,
//! validated, and turned into [`bulwark_core::DependencyConfig`]s.
//!
//! ```rust
//! use bulwark_config::{ConfigLoader, FileFormat, ResilienceSettings};
//!
//! let document = ConfigLoader::new(FileFormat::Toml)
//!     .parse(
//!         r#"
//!         [defaults]
//!         timeout_ms = 2000
//!
//!         [dependencies.amqp]
//!         max_concurrent = 8
//!         "#,
//!     )
//!     .unwrap();
//!
//! let settings = ResilienceSettings::from_value(document).unwrap();
//! let amqp = settings.dependency_config("amqp").unwrap();
//! assert_eq!(amqp.bulkhead.max_concurrent, 8);
//! ```

pub mod env;
pub mod error;
pub mod loader;
pub mod settings;
pub mod validation;

pub use env::{apply_overrides, EnvLoader};
pub use error::{ConfigError, Result};
pub use loader::{ConfigLoader, FileFormat};
pub use settings::{PolicySettings, ResilienceSettings};
pub use validation::{ConfigValidator, Validate};

/// Load a `.env` file into the process environment.
///
/// With no path, a missing `.env` in the working directory is not an error.
pub fn load_dotenv(path: Option<&str>) -> Result<()> {
    if let Some(path) = path {
        dotenvy::from_path(path).map_err(|e| ConfigError::LoadError(e.to_string()))?;
    } else {
        dotenvy::dotenv().ok();
    }
    Ok(())
}

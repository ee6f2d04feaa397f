//! Configuration for the batch engine.
//!
//! Reuses `shared::config::Settings` (environment-driven, via the `config`
//! crate) rather than re-inventing a second loader.

pub use shared::config::Settings;

impl Default for Settings {
    fn default() -> Self {
        Settings::new().unwrap_or_else(|_| {
            serde_json::from_value(serde_json::json!({}))
                .expect("Settings must deserialize from an empty object via field defaults")
        })
    }
}

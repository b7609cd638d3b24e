//! # Settings Resolution Engine
//!
//! Modulo che risolve la configurazione gerarchica di ottimizzazione:
//! - `schema`: albero tipizzato con default documentati
//! - `resolver`: merge foglia-per-foglia, validazione, diff
//! - `pattern`: matcher URL per gli override per-asset
//! - `store`: cache esplicita, history e rollback

pub mod pattern;
pub mod resolver;
pub mod schema;
pub mod store;

pub use pattern::UrlPattern;
pub use resolver::{diff, diff_revisions, resolve, resolve_for_url, validate, AssetOverride, SettingsDiff};
pub use schema::{
    CssSettings, DeadScriptToggles, FontDisplay, FontSettings, ImageSettings, JsSettings, LoadingStrategy,
    PurgeAggressiveness, ResolvedSettings, ResourceHintSettings, SeoSettings, VideoSettings, WidgetSettings,
};
pub use store::{SettingsRepository, SettingsRevision, SettingsSnapshot, SettingsStore, SiteSettingsRecord};

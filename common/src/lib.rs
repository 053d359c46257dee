pub mod config;
pub mod types;

pub use config::{Config, FailureMode, RuleSourceKind, RulesConfig, EnforcerConfig, NotifyConfig, ProviderConfig};
pub use types::*;

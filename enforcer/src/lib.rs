//! Cloud cost policy enforcement: periodic billing collection, rule
//! evaluation, violation dedup, capped remediation and webhook fan-out.

pub mod error;
pub mod ipc;
pub mod ledger;
pub mod notify;
pub mod orchestrator;
pub mod providers;
pub mod remediation;
pub mod rulegen;
pub mod rules;
pub mod storage;

pub use error::EnforceError;
pub use ledger::ViolationLedger;
pub use notify::{DeliveryReport, NotificationFanout};
pub use orchestrator::{Enforcer, TickSummary};
pub use providers::{CloudProvider, ProviderRegistry};
pub use remediation::RemediationDispatcher;
pub use rules::{RuleDirectory, RuleEvaluator, RuleStore};
pub use storage::Storage;

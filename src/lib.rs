//! dfasim core library: scenario model, episode engine, policies and traces.

#[path = "platform/config.rs"]
mod config;
#[path = "runtime/dfa.rs"]
mod dfa;
#[path = "runtime/engine.rs"]
mod engine;
#[path = "platform/envinfo.rs"]
mod envinfo;
#[path = "platform/error.rs"]
mod error;
#[path = "runtime/executor.rs"]
mod executor;
#[path = "platform/fsutil.rs"]
mod fsutil;
#[path = "runtime/ledger.rs"]
mod ledger;
#[path = "runtime/policy.rs"]
mod policy;
#[path = "model/reporting.rs"]
mod reporting;
#[path = "runtime/resolver.rs"]
mod resolver;
#[path = "runtime/runner.rs"]
mod runner;
#[path = "model/scenario.rs"]
mod scenario;
#[path = "runtime/state.rs"]
mod state;
#[path = "runtime/tracefile.rs"]
mod tracefile;
#[path = "model/triggers.rs"]
mod triggers;

pub use config::*;
pub use dfa::*;
pub use engine::*;
pub use envinfo::*;
pub use error::*;
pub use executor::*;
pub use fsutil::*;
pub use ledger::*;
pub use policy::*;
pub use reporting::*;
pub use resolver::*;
pub use runner::*;
pub use scenario::*;
pub use state::*;
pub use tracefile::*;
pub use triggers::*;

/*
[INPUT]:  Public API exports for the giftsnipe-launcher crate
[OUTPUT]: Module declarations and public re-exports
[POS]:    Crate root - library entry point
[UPDATE]: When adding new modules or public exports
*/

pub mod config;
pub mod policy;
pub mod state_machine;
pub mod supervisor;

pub use config::{LauncherConfig, LauncherConfigError, MarketDescriptor};
pub use policy::{Backoff, RestartDecision, RestartPolicy, RestartTracker};
pub use state_machine::{MarketAction, MarketState, MarketStateMachine, StateError, StopReason};
pub use supervisor::{ProcessHandle, Supervisor, SupervisorSettings};

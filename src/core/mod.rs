pub mod activity;
pub mod gadget;
pub mod harvest;
pub mod models;
pub mod orchestrator;
pub mod progress;

pub use activity::{ActivityMonitor, ActivitySource, ControllerState, HarvestTrigger, HostState};
pub use gadget::{GadgetBackend, GadgetController, GadgetMode};
pub use models::{HarvestCandidate, HarvestReport};
pub use orchestrator::Orchestrator;
pub use progress::{ProgressStore, TransferProgress};

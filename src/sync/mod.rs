//! Mirror of the remote device record and the intents that write to it.

mod controller;
mod simulation;
mod subscription;

pub use controller::DeviceSyncController;
pub use simulation::SimulationScenario;
pub use subscription::Subscription;

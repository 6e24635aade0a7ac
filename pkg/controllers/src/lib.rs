//! Lease coordination for one API instance: the reconciliation loop, the
//! poller supervisor and the external seams they drive.

pub mod coordinator;
pub mod poller;
pub mod reconciler;
pub mod registry;
pub mod shutdown;
pub mod supervisor;

pub use coordinator::LeaseCoordinator;
pub use poller::{HttpPoller, Poller};
pub use reconciler::{Reconciler, TickOutcome};
pub use registry::{SessionRegistry, StaticRegistry, StoreSessionRegistry};
pub use shutdown::ShutdownReport;
pub use supervisor::PollerSupervisor;

#[cfg(test)]
mod scenarios;
#[cfg(test)]
mod test_support;

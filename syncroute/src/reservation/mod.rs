mod gate;
mod manager;

pub use gate::{Admission, SyncGate, SyncStatus};
pub use manager::{ReservationGuard, ReservationKind, ReservationManager};

//! Availability bookkeeping: who can serve which block, and how busy they are.
//!
//! ```text
//! durable index --+
//!                 +--> AvailabilityResolver --> DeviceActivity::least_busy
//! temp index -----+
//! ```

pub mod activity;
pub mod availability;
pub mod durable;
pub mod progress;
pub mod temp;

pub use activity::{Busy, DeviceActivity};
pub use availability::{Availability, AvailabilityResolver, ConnectionRegistry, FolderSharing};
pub use durable::{DurableIndex, MemoryIndex};
pub use progress::{ProgressRegistry, PulledFileState};
pub use temp::TempIndex;

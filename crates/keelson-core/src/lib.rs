// ABOUTME: Core library for keelson: memento model, topology aggregate, and plane sync records.
// ABOUTME: Also defines the live-object contract and reference lookup shared by the store and rebind crates.

pub mod clock;
pub mod lookup;
pub mod memento;
pub mod object;
pub mod plane;
pub mod topology;

pub use clock::{Clock, ManualClock, SystemClock};
pub use lookup::{Handle, LookupContext, Placeholder, PlaceholderLookup};
pub use memento::{ManifestEntry, Memento, MementoKind, MementoValue, ObjectRef, Relations};
pub use object::{ManagedObject, ReconstructionError};
pub use plane::{
    ElectionAmbiguity, HighAvailabilityMode, ManagementNodeRecord, NodeState, PlaneSyncRecord,
    SyncRecordDelta,
};
pub use topology::{Delta, DeltaBuilder, TopologyMemento, TopologyMementoBuilder};

/// Version stamped into node records and topology mementos.
pub const PLATFORM_VERSION: &str = env!("CARGO_PKG_VERSION");

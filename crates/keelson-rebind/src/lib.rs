// ABOUTME: Rebind layer for keelson: type registry, live objects and graph, and the RebindManager.
// ABOUTME: Also provides the periodic delta writer that persists live changes while a node is master.

pub mod context;
pub mod graph;
pub mod manager;
pub mod object;
pub mod registry;
pub mod writer;

pub use context::RebindContext;
pub use graph::{ChangeListener, GraphError, ManagedGraph};
pub use manager::{
    DEFAULT_PERSIST_PERIOD, RebindError, RebindFailureMode, RebindManager, RebindOptions,
    RebindReport,
};
pub use object::BasicObject;
pub use registry::{Constructor, RegistryError, ShellSpec, TypeRegistry};
pub use writer::PeriodicDeltaWriter;

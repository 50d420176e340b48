pub mod atomic;
pub mod dispatch;
pub mod engine;
pub mod events;
pub mod propagate;
pub mod record;
pub mod registry;
pub mod scan;
pub mod validate;

pub use dispatch::{ChangeDispatcher, DEBOUNCE_WINDOW};
pub use engine::{Engine, EngineError};
pub use events::{EngineEvent, ErrorKind, EventBus};
pub use propagate::PropagateError;
pub use record::{RecordError, RecordStore};
pub use registry::{RECORD_FILE, REGISTRY_FILE, RegistryError, RegistryStore};
pub use scan::scan_records;
pub use validate::{Check, Diagnostic, Severity};

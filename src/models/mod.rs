pub mod judgment;
pub mod loaders;
pub mod log_entry;
pub mod progress;
pub mod term;

pub use judgment::Judgment;
pub use loaders::{DirectoryLoader, GlossaryData, GlossaryLoader};
pub use log_entry::{ModificationEntry, ModificationSheet, ReviewAction};
pub use progress::{compute_percent, ActivityLog, TaskPhase, TaskProgress, TaskStatus};
pub use term::{TermRow, TermSheet};

// Spot - declarative multi-host deployment runner
//
// A playbook names targets (groups of hosts) and tasks (ordered commands);
// spot runs one task against one target with bounded concurrency.

pub mod executor;
pub mod inventory;
pub mod modules;
pub mod output;
pub mod parser;

pub use executor::{Connector, Executor, RunError, RunStats, Scheduler, SchedulerConfig};
pub use output::{HostPrinter, SpotError};
pub use parser::{load_playbook, parse_playbook, Destination, Overrides, Playbook, Task};

/// Version of the spot tool
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Re-export commonly used types
pub mod prelude {
    pub use crate::executor::{
        Connector, Executor, LocalExecutor, RunStats, Scheduler, SchedulerConfig, SshConfig,
        SshConnector,
    };
    pub use crate::output::SpotError;
    pub use crate::parser::{load_playbook, Overrides, Playbook};
}

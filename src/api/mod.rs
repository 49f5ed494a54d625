pub mod handoff;
pub mod orchestrator;
pub mod records;
pub mod scheduler;
pub mod shutdown;
pub mod traits;
pub mod transport;
pub mod utils;

pub use handoff::{run_publisher, PublishQueue};
pub use orchestrator::{CycleReport, Orchestrator, OrchestratorSettings, PackFailure};
pub use records::{PackRecord, PackState};
pub use scheduler::{BusScheduler, ExchangeSettings, PollError};
pub use shutdown::ShutdownSignal;
pub use traits::{PublishError, PublishSink};
pub use transport::{open_transport, Transport, TransportError};

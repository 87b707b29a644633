//! Device node: clock bootstrap, session orchestration and the concrete
//! transport used by the `cloudlink-node` binary.

pub mod dry_run;
pub mod net;
pub mod orchestrator;

pub use dry_run::DryRunBroker;
pub use net::{LinkProbe, TcpTransportProvider};
pub use orchestrator::{Orchestrator, ReconnectBackoff, SetupError};

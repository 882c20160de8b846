pub mod cancellation;
pub mod error_handling;
pub mod executor;
pub mod persister;
pub mod processor;
pub mod question;
pub mod scheduler;
pub mod stats;
pub mod types;

pub use cancellation::*;
pub use error_handling::*;
pub use executor::*;
pub use persister::*;
pub use processor::*;
pub use question::*;
pub use scheduler::*;
pub use stats::*;
pub use types::*;

//! Service lifecycle management and the named-call dispatcher.
//!
//! - [`worker`]: periodic background ticking ([`BackgroundWorker`]), used to
//!   drive the session-expiry sweep.
//! - [`dispatcher`]: routes `call:<service>/<callName>` wire commands to
//!   registered [`HubService`]s (spec §4.10).

pub mod dispatcher;
pub mod worker;

pub use dispatcher::{HubService, ServiceCallError, ServiceDispatcher};
pub use worker::{BackgroundRunnable, BackgroundWorker};

//! Server-side resource engine: registry, live instances, subscriptions,
//! and command dispatch (spec §4.4-§4.8).

pub mod dispatch;
pub mod instance;
pub mod registry;
pub mod subscription;

pub use dispatch::{dispatch, DispatchContext};
pub use instance::{ResourceInstance, ResourceKind, Subscription};
pub use registry::{ResourceFactory, ResourceRegistry};
pub use subscription::{broadcast_delta, dump_message};

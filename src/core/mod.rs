pub mod backoff;
pub mod bounded;
pub mod cache;
pub mod clock;
pub mod coalesce;
pub mod event;
pub mod frame;
pub mod health;
pub mod key;
pub mod lifecycle;
pub mod liveness;
pub mod mutation;
pub mod router;
pub mod types;

pub use backoff::*;
pub use bounded::*;
pub use cache::*;
pub use clock::*;
pub use coalesce::*;
pub use event::*;
pub use frame::*;
pub use health::*;
pub use key::*;
pub use lifecycle::*;
pub use liveness::*;
pub use mutation::*;
pub use router::*;
pub use types::*;

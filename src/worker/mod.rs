//! The decode worker: one actor per file, owning the GOP table and every
//! GOP's decode state. Consumers talk to it only through [`Request`]s and
//! hear back through [`WorkerEvent`]s.

mod actor;
mod decode;
mod protocol;
mod state;

pub use actor::{spawn_worker, WorkerHandle, WorkerSettings};
pub use protocol::{
    ConsumerId, DecodedGop, EventSender, GopSnapshot, MediaMeta, Request, WorkerEvent,
    WorkerStats,
};
pub use state::GopState;

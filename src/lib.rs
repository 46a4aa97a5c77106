//! Asynchronous directory watching over a dedicated watcher thread.
//!
//! A [`WatchServer`] owns every OS watch resource and confines it to one
//! thread; callers register and unregister directories with blocking,
//! acknowledged requests and receive changes through an [`EventSink`].

pub mod backend;
pub mod config;
pub mod error;
pub mod event;
pub mod logging;
pub mod record;
pub mod server;

mod point;
mod runloop;

pub use config::{LoggingConfig, WatchConfig};
pub use error::WatchError;
pub use event::{ChangeType, ChannelSink, EventSink, Notification};
pub use record::{ChangeRecord, change_type_for, records, resolve_path};
pub use server::{BackendFactory, RegisterOutcome, UnregisterOutcome, WatchServer};

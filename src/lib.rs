//! # Ripple
//!
//! A live-query notification engine for a version-snapshotted embedded
//! object store.
//!
//! Each thread opens its own [`Connection`] to a shared store. Writers
//! commit new versions; every other connection observes the new version
//! through its event queue and, if it registered interest, is notified:
//!
//! - a listener on the whole connection fires once per delivered version
//!   advance,
//! - a listener on a [`LiveObject`] fires when that row changes or is
//!   deleted,
//! - a listener on a [`LiveResults`] fires when the result set changes or
//!   its source is invalidated.
//!
//! Queries can also be evaluated on background workers with
//! [`Connection::find_async`]; the result is handed back to the owning
//! thread through the same event queue.
//!
//! ## Example
//!
//! ```ignore
//! use ripple::{Connection, Query, StoreConfig};
//!
//! let config = StoreConfig::at("./my-store");
//! let conn = Connection::open(&config)?;
//!
//! conn.begin_write()?;
//! let dog = conn.create_object("Dog")?;
//! dog.set("name", "Akamaru")?;
//! conn.commit_write()?;
//!
//! let dogs = conn.find(Query::table("Dog"))?;
//! dogs.add_change_listener(|| println!("dogs changed"))?;
//!
//! // The owning thread drains its event queue to receive notifications
//! // for commits made on other connections.
//! conn.pump_events(std::time::Duration::from_millis(100))?;
//! ```

pub mod connection;
pub mod error;
pub mod live;
pub mod query;
pub mod types;

mod dispatch;
mod engine;
mod version;

// Re-exports
pub use connection::Connection;
pub use error::{Result, StoreError};
pub use live::{LiveObject, LiveResults};
pub use query::{Predicate, Query, QuerySource};
pub use types::{FieldValue, ListenerToken, ObjectData, ObjectId, StoreConfig, Version};

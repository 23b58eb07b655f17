//! Client core for the Duet couples app: persisted session, authenticated
//! request gateway, and the sync engines behind the coach and lounge views.

pub mod api;
pub mod gateway;
pub mod session;
pub mod sync;

pub use gateway::{Notice, RequestGateway};
pub use session::SessionStore;
pub use sync::{CoachChat, LoungeSync, SyncState};

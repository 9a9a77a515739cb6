//! # Presence
//!
//! Channel membership: the [`PresenceMap`] kept by each channel machine and
//! the [`Presence`] handle used to enter, leave and observe members.

mod handle;
pub mod map;

pub use handle::Presence;
pub use map::{sync_has_more, PresenceMap};

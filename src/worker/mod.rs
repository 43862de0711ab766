//! Scheduled background jobs: inbox drain and abandonment reaper.

pub mod inbox;
pub mod reaper;

pub use inbox::spawn_inbox_drain;
pub use reaper::spawn_reaper;

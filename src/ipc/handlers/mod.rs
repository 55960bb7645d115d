pub mod attendance;
pub mod calendar;
pub mod core;
pub mod groups;
pub mod scores;
pub mod sessions;
pub mod stats;

mod shared;

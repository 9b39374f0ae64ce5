/// Session store backends and the trait they implement.
pub mod game_store;
/// Stored session record.
pub mod models;
/// Backend-agnostic storage errors.
pub mod storage;

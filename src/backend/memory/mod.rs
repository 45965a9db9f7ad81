pub mod reaper;
pub mod storage;

pub use reaper::ClaimReaper;
pub use storage::MemoryBackend;

pub mod events;
pub mod job_store;
pub mod producer;
pub mod queue;
pub mod reaper;
pub mod scorer;
pub mod submissions;
pub mod worker;

use nimbus_state::StateError;
use thiserror::Error;

pub type SchedulerResult<T> = Result<T, SchedulerError>;

#[derive(Debug, Error)]
pub enum SchedulerError {
    /// No eligible node can fit the request. Carries the largest
    /// request each dimension could still satisfy so callers can
    /// suggest a smaller shape.
    #[error(
        "insufficient capacity for {requested_cpu} cpu / {requested_memory} GiB \
         (max available: {max_cpu_available} cpu, {max_memory_available} GiB)"
    )]
    InsufficientCapacity {
        requested_cpu: u32,
        requested_memory: u32,
        max_cpu_available: u32,
        max_memory_available: u32,
    },

    #[error(transparent)]
    State(#[from] StateError),
}

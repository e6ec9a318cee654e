pub mod coordinator;
pub mod engine;

pub use coordinator::{NotRunning, RunEvent, RunState, StartRefused, TaskCoordinator};
pub use engine::{
    EngineEvent, ExecutionEngine, LocalSpawner, RunHandle, RunOutcome, RunRequest, SpawnedTask,
    Spawner,
};

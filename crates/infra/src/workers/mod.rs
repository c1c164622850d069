pub mod catch_up_worker;

pub use catch_up_worker::{
    CatchUpWorker, MalformedRowPolicy, StartFrom, WorkerHandle, WorkerOptions,
};

//! Actor implementations

pub mod scheduler;

pub use scheduler::{NoReboot, RebootHook, SchedulerActor, SchedulerActorArgs};

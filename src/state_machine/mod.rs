mod job;
mod lesson;

pub use job::{Boundary, Job, JobMachine, JobStatus};
pub use lesson::{
    ControlState, DefinitionOfDone, LessonMachine, LessonStatus, TransitionError, WorkItem,
};

pub mod executor;
pub mod refine;
pub mod spec;

pub use executor::{Output, PipelineExecutor, Refinement, RunContext};
pub use refine::{Artifact, RefineError, Refiner, RefinerRegistry};
pub use spec::{PipelinePolicy, PipelineSpec, Step, StepKind};

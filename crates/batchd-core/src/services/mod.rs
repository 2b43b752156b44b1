//! Services module

pub mod admission;
pub mod builder;
pub mod delivery;
pub mod dispatcher;
pub mod reconciler;
pub mod recovery;
pub mod scheduler;
pub mod workflow;

pub use admission::{
    AdmissionDecision, CapacityProvider, ConfigCapacityProvider, HeuristicTokenEstimator,
    TokenEstimator,
};
pub use builder::BatchBuilder;
pub use delivery::{AmqpSink, DeliverySinks, WebhookSink};
pub use dispatcher::{dispatch_all, dispatch_model};
pub use reconciler::{apply_result_file, FileKind, ReconcileStats};
pub use recovery::recover;
pub use scheduler::SchedulerService;
pub use workflow::{start_upload, Workflow};

pub mod cli;
pub mod features;

pub use features::termination_watch::controller::TerminationWatchController;
pub use features::termination_watch::repo::{
    InstanceIdentity, InstanceMetadataSource, MetadataRepoError, ReqwestMetadataSource,
    TerminationSemaphore,
};
pub use features::termination_watch::service::{
    ExitStrategy, PollOutcome, PollState, TerminationWatchError, TerminationWatchResult,
    TerminationWatchService,
};

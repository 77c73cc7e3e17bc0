//! The Script Set (component S): every atomic state transition the queue
//! relies on, one file per script. Each script is compiled once via
//! `lazy_static` and invoked by SHA through `redis::Script`, exactly as the
//! rest of this codebase's Redis-backed tooling loads its Lua.

mod add_job;
mod complete_job;
mod extend_lock;
mod fail_job;
mod move_job;
mod move_to_active;
mod move_waiting_to_delayed;
mod promote_delayed_jobs;
mod recover_stalled_jobs;
mod sliding_window;
mod token_bucket;
mod update_progress;

pub(crate) use add_job::AddJobScript;
pub(crate) use complete_job::{CompleteJobScript, CompleteOutcome};
pub(crate) use extend_lock::ExtendLockScript;
pub(crate) use fail_job::{FailJobScript, FailOutcome};
pub(crate) use move_job::MoveJobScript;
pub(crate) use move_to_active::MoveToActiveScript;
pub(crate) use move_waiting_to_delayed::MoveWaitingToDelayedScript;
pub(crate) use promote_delayed_jobs::PromoteDelayedJobsScript;
pub(crate) use recover_stalled_jobs::RecoverStalledJobsScript;
pub(crate) use sliding_window::SlidingWindowScript;
pub(crate) use token_bucket::TokenBucketScript;
pub(crate) use update_progress::UpdateProgressScript;

pub(crate) struct ScriptSet {
    pub add_job: AddJobScript,
    pub move_job: MoveJobScript,
    pub move_to_active: MoveToActiveScript,
    pub complete_job: CompleteJobScript,
    pub fail_job: FailJobScript,
    pub promote_delayed_jobs: PromoteDelayedJobsScript,
    pub recover_stalled_jobs: RecoverStalledJobsScript,
    pub extend_lock: ExtendLockScript,
    pub update_progress: UpdateProgressScript,
    pub token_bucket: TokenBucketScript,
    pub sliding_window: SlidingWindowScript,
    pub move_waiting_to_delayed: MoveWaitingToDelayedScript,
}

impl ScriptSet {
    pub fn new() -> Self {
        ScriptSet {
            add_job: AddJobScript::new(),
            move_job: MoveJobScript::new(),
            move_to_active: MoveToActiveScript::new(),
            complete_job: CompleteJobScript::new(),
            fail_job: FailJobScript::new(),
            promote_delayed_jobs: PromoteDelayedJobsScript::new(),
            recover_stalled_jobs: RecoverStalledJobsScript::new(),
            extend_lock: ExtendLockScript::new(),
            update_progress: UpdateProgressScript::new(),
            token_bucket: TokenBucketScript::new(),
            sliding_window: SlidingWindowScript::new(),
            move_waiting_to_delayed: MoveWaitingToDelayedScript::new(),
        }
    }
}

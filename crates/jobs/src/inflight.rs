use std::{
    collections::HashSet,
    sync::{Arc, Mutex, PoisonError},
};

/// Job ids currently being provisioned.
///
/// Guards against at-least-once webhook delivery starting two workers for the
/// same queued job. Critical sections never span an await.
#[derive(Default)]
pub struct InFlightJobs {
    jobs: Mutex<HashSet<u64>>,
}

impl InFlightJobs {
    pub fn new() -> Arc<Self> { Arc::new(Self::default()) }

    /// Claim `job_id`, or return `None` if it is already claimed.
    /// The claim is released when the guard is dropped.
    pub fn try_claim(self: &Arc<Self>, job_id: u64) -> Option<InFlightGuard> {
        let mut jobs = self.jobs.lock().unwrap_or_else(PoisonError::into_inner);
        jobs.insert(job_id).then(|| InFlightGuard { jobs: self.clone(), job_id })
    }

    pub fn contains(&self, job_id: u64) -> bool {
        self.jobs.lock().unwrap_or_else(PoisonError::into_inner).contains(&job_id)
    }

    pub fn len(&self) -> usize { self.jobs.lock().unwrap_or_else(PoisonError::into_inner).len() }

    pub fn is_empty(&self) -> bool { self.len() == 0 }
}

#[must_use]
pub struct InFlightGuard {
    jobs: Arc<InFlightJobs>,
    job_id: u64,
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        self.jobs.jobs.lock().unwrap_or_else(PoisonError::into_inner).remove(&self.job_id);
    }
}

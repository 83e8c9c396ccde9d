//! Deferred teardown of mounts and temporary state.
//!
//! Jobs run in LIFO order exactly once, whether the operation that
//! registered them succeeded or not.

use std::fmt;

use anyhow::Result;

use osdeploy_utils::ResultExt;

type Job<'a> = Box<dyn FnOnce() -> Result<()> + 'a>;

/// A stack of teardown jobs.
pub(crate) struct CleanupStack<'a> {
    jobs: Vec<(String, Job<'a>)>,
}

impl fmt::Debug for CleanupStack<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list()
            .entries(self.jobs.iter().map(|(name, _)| name))
            .finish()
    }
}

impl<'a> CleanupStack<'a> {
    pub(crate) fn new() -> Self {
        Self { jobs: Vec::new() }
    }

    /// Register a job to run on [`CleanupStack::cleanup`].
    pub(crate) fn push(&mut self, name: impl Into<String>, job: impl FnOnce() -> Result<()> + 'a) {
        self.jobs.push((name.into(), Box::new(job)));
    }

    #[cfg(test)]
    pub(crate) fn len(&self) -> usize {
        self.jobs.len()
    }

    /// Run every registered job, most recent first. A failing job does not
    /// stop the others. If `result` is an error it is returned unchanged;
    /// otherwise the first job error is.
    pub(crate) fn cleanup<T>(&mut self, result: Result<T>) -> Result<T> {
        let mut first_err = None;
        while let Some((name, job)) = self.jobs.pop() {
            tracing::debug!("Cleanup: {name}");
            if let Err(e) = job() {
                let e = e.context(format!("Cleanup: {name}"));
                if result.is_err() || first_err.is_some() {
                    tracing::warn!("{e:#}");
                } else {
                    first_err = Some(e);
                }
            }
        }
        match (result, first_err) {
            (Err(e), _) => Err(e),
            (Ok(_), Some(e)) => Err(e),
            (Ok(v), None) => Ok(v),
        }
    }
}

impl Drop for CleanupStack<'_> {
    fn drop(&mut self) {
        if !self.jobs.is_empty() {
            self.cleanup(Ok(())).log_err_default();
        }
    }
}

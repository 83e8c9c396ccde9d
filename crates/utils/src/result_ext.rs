use std::fmt::Display;

/// Extension methods for results whose failure is tolerated.
pub trait ResultExt<T, E: Display> {
    /// Return the Ok value unchanged. In the err case, log it as a
    /// warning, and then return None.
    fn log_err(self) -> Option<T>;

    /// Like [`ResultExt::log_err`], prefixing the message with `msg`.
    fn log_err_with(self, msg: &str) -> Option<T>;

    /// Return the Ok value unchanged, or log the error and return the
    /// default value.
    fn log_err_default(self) -> T
    where
        T: Default;
}

impl<T, E: Display> ResultExt<T, E> for Result<T, E> {
    #[track_caller]
    fn log_err(self) -> Option<T> {
        match self {
            Ok(v) => Some(v),
            Err(e) => {
                tracing::warn!("{e:#}");
                None
            }
        }
    }

    #[track_caller]
    fn log_err_with(self, msg: &str) -> Option<T> {
        match self {
            Ok(v) => Some(v),
            Err(e) => {
                tracing::warn!("{msg}: {e:#}");
                None
            }
        }
    }

    #[track_caller]
    fn log_err_default(self) -> T
    where
        T: Default,
    {
        self.log_err().unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_log_err() {
        let r: Result<u32, anyhow::Error> = Err(anyhow::anyhow!("relabel failed"));
        assert_eq!(r.log_err_with("Relabeling"), None);
        let r: Result<u32, anyhow::Error> = Ok(5);
        assert_eq!(r.log_err_default(), 5);
        let r: Result<String, anyhow::Error> = Err(anyhow::anyhow!("nope"));
        assert_eq!(r.log_err_default(), "");
    }
}

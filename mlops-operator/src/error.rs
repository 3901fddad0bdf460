use std::time::Duration;

/// How the event loop reacts to a failed handler
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub(crate) enum Severity {
    /// Re-dispatch with exponential backoff
    Retry,
    /// Stop retrying this revision and record the failure on the object
    Permanent,
    /// Drop the event; a later revision supplies what was missing
    Ignore,
}

/// All possible errors
#[derive(thiserror::Error, Debug)]
pub(crate) enum Error {
    /// Missing an object key
    #[error("Missing object key {0}")]
    MissingObject(&'static str),
    /// An object the handler needs does not exist yet
    #[error("Referenced object {0} does not exist")]
    AbsentReferent(String),
    /// Kube error
    #[error("Kubernetes api error: {0}")]
    Kube(#[from] kube::Error),
    /// Cluster api call exceeded its deadline
    #[error("Cluster api call timed out")]
    Timeout,
    /// Spec failed validation
    #[error("Invalid spec: {0}")]
    Validation(String),
    /// A size is not a parsable resource quantity
    #[error("Invalid quantity {0:?}")]
    Quantity(String),
    /// A rollout did not become ready in time
    #[error("Deployment {0} was not ready within {1:?}")]
    NotReady(String, Duration),
}

/// Handler result
pub(crate) type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// Classify this failure for the event loop
    pub(crate) fn severity(&self) -> Severity {
        match *self {
            Error::Kube(kube::Error::Api(ref response)) => match response.code {
                // version conflicts resolve on re-read
                409 => Severity::Retry,
                // expired watch revision, the restarted watch supersedes it
                410 => Severity::Ignore,
                code if code >= 500 => Severity::Retry,
                // a 404 surfacing here means a write against a hard-required
                // object; reads already translate 404 into absence
                _ => Severity::Permanent,
            },
            Error::Kube(_) | Error::Timeout | Error::NotReady(..) => Severity::Retry,
            // the referent may simply not have been applied yet
            Error::AbsentReferent(_) => Severity::Retry,
            Error::MissingObject(_) | Error::Validation(_) | Error::Quantity(_) => {
                Severity::Permanent
            }
        }
    }
}

#[cfg(test)]
mod test {
    use kube::core::ErrorResponse;

    use super::{Error, Severity};

    fn api_error(code: u16) -> Error {
        Error::Kube(kube::Error::Api(ErrorResponse {
            status: "Failure".to_owned(),
            message: String::new(),
            reason: String::new(),
            code,
        }))
    }

    #[test]
    fn test_severity_of_api_errors() {
        assert_eq!(api_error(409).severity(), Severity::Retry);
        assert_eq!(api_error(500).severity(), Severity::Retry);
        assert_eq!(api_error(503).severity(), Severity::Retry);
        assert_eq!(api_error(410).severity(), Severity::Ignore);
        assert_eq!(api_error(404).severity(), Severity::Permanent);
        assert_eq!(api_error(403).severity(), Severity::Permanent);
        assert_eq!(api_error(422).severity(), Severity::Permanent);
    }

    #[test]
    fn test_severity_of_local_errors() {
        assert_eq!(Error::Timeout.severity(), Severity::Retry);
        assert_eq!(
            Error::NotReady("m".to_owned(), std::time::Duration::from_secs(1)).severity(),
            Severity::Retry
        );
        assert_eq!(
            Error::AbsentReferent("m".to_owned()).severity(),
            Severity::Retry
        );
        assert_eq!(
            Error::Validation("bad".to_owned()).severity(),
            Severity::Permanent
        );
        assert_eq!(
            Error::MissingObject(".metadata.name").severity(),
            Severity::Permanent
        );
    }
}

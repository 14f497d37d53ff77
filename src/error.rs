use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("codec error: {0}")]
    Codec(#[from] serde_json::Error),
    #[error("node does not exist: {0}")]
    NoNode(String),
    #[error("node already exists: {0}")]
    NodeExists(String),
    #[error("node has children: {0}")]
    NotEmpty(String),
    #[error("version mismatch at {path}: expected {expected}, found {actual}")]
    BadVersion {
        path: String,
        expected: i32,
        actual: i32,
    },
    #[error("connection lost: {0}")]
    ConnectionLoss(String),
    #[error("invalid path: {0}")]
    InvalidPath(String),
    #[error("invalid config: {0}")]
    InvalidConfig(String),
    #[error("listener failed: {0}")]
    Listener(String),
    #[error("lock poisoned: {0}")]
    Poisoned(&'static str),
    #[error("registry is shut down")]
    Closed,
    #[error("{op} failed: {source}")]
    Runtime {
        op: &'static str,
        #[source]
        source: Box<Error>,
    },
}

impl Error {
    /// Wraps an unexpected failure with the operation that surfaced it.
    pub fn runtime(op: &'static str, source: Error) -> Self {
        Error::Runtime {
            op,
            source: Box::new(source),
        }
    }

    pub fn listener(msg: impl Into<String>) -> Self {
        Error::Listener(msg.into())
    }

    pub fn is_no_node(&self) -> bool {
        matches!(self, Error::NoNode(_))
    }

    pub fn is_node_exists(&self) -> bool {
        matches!(self, Error::NodeExists(_))
    }
}

pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn runtime_wraps_source() {
        let err = Error::runtime("reset", Error::ConnectionLoss("zk-1".into()));
        assert_eq!(err.to_string(), "reset failed: connection lost: zk-1");
        let source = std::error::Error::source(&err).expect("source");
        assert_eq!(source.to_string(), "connection lost: zk-1");
    }

    #[test]
    fn classifies_expected_conditions() {
        assert!(Error::NoNode("/a".into()).is_no_node());
        assert!(Error::NodeExists("/a".into()).is_node_exists());
        assert!(!Error::Closed.is_no_node());
    }
}

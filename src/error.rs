// Error categories
//
// Everything fallible returns anyhow::Result. Precondition violations are
// raised as LogicError so the top level can tell them apart from device or
// environment failures, which are all "runtime".

use std::fmt;
use thiserror::Error;

/// Programming / precondition violations.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum LogicError {
    #[error("image-available token for frame {frame} was already taken")]
    ImageTokenTaken { frame: u64 },
    #[error("no image has been acquired for frame {frame}")]
    NoImageAcquired { frame: u64 },
    #[error("unknown {kind} handle {id}")]
    UnknownHandle { kind: &'static str, id: u64 },
    #[error("signal token {id} was not issued by this backend")]
    ForeignToken { id: u64 },
    #[error("{count} active lights exceed the capacity of {capacity}")]
    LightCapacityExceeded { count: usize, capacity: usize },
    #[error("write of {len} bytes does not fit buffer of {size} bytes")]
    BufferOverflow { len: usize, size: usize },
    #[error("buffer {id} is not host visible")]
    NotHostVisible { id: u64 },
    #[error("buffer {id} is not device local")]
    NotDeviceLocal { id: u64 },
    #[error("pipeline {pipeline} declares no descriptor at set {set}, binding {binding}")]
    UndeclaredBinding { pipeline: u64, set: u32, binding: u32 },
    #[error("command buffer {id} was submitted without being recorded")]
    NotRecorded { id: u64 },
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
}

/// The two coarse categories recognised at the outermost scope.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    Logic,
    Runtime,
}

impl fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ErrorCategory::Logic => f.write_str("logic"),
            ErrorCategory::Runtime => f.write_str("runtime"),
        }
    }
}

/// Classify an error by walking its source chain.
pub fn categorize(err: &anyhow::Error) -> ErrorCategory {
    if err.downcast_ref::<LogicError>().is_some()
        || err.chain().any(|cause| cause.is::<LogicError>())
    {
        ErrorCategory::Logic
    } else {
        ErrorCategory::Runtime
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::Context;

    #[test]
    fn logic_errors_survive_added_context() {
        let err: anyhow::Result<()> = Err(LogicError::ImageTokenTaken { frame: 4 }.into());
        let err = err.context("rendering frame").unwrap_err();
        assert_eq!(categorize(&err), ErrorCategory::Logic);
    }

    #[test]
    fn everything_else_is_runtime() {
        let err = anyhow::anyhow!("device lost");
        assert_eq!(categorize(&err), ErrorCategory::Runtime);

        let io = std::io::Error::new(std::io::ErrorKind::NotFound, "missing");
        assert_eq!(categorize(&anyhow::Error::new(io)), ErrorCategory::Runtime);
    }
}

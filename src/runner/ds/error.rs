use crate::runner::ds::value::Value;

/// Raised by runtime operations once the thrown value has been parked in
/// the engine. Carries no payload; see `ExecutionEngine::catch_exception`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("JavaScript exception pending")]
pub struct ExceptionSignal;

/// Result of every runtime operation that may throw.
pub type ReturnedValue = Result<Value, ExceptionSignal>;

/// Subtype tag carried by error objects.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum ErrorType {
    Error = 0,
    EvalError,
    RangeError,
    ReferenceError,
    SyntaxError,
    TypeError,
    URIError,
}

impl ErrorType {
    pub const ALL: [ErrorType; 7] = [
        ErrorType::Error,
        ErrorType::EvalError,
        ErrorType::RangeError,
        ErrorType::ReferenceError,
        ErrorType::SyntaxError,
        ErrorType::TypeError,
        ErrorType::URIError,
    ];

    pub fn from_u8(subtype: u8) -> ErrorType {
        ErrorType::ALL
            .get(subtype as usize)
            .copied()
            .unwrap_or(ErrorType::Error)
    }

    pub fn name(self) -> &'static str {
        match self {
            ErrorType::Error => "Error",
            ErrorType::EvalError => "EvalError",
            ErrorType::RangeError => "RangeError",
            ErrorType::ReferenceError => "ReferenceError",
            ErrorType::SyntaxError => "SyntaxError",
            ErrorType::TypeError => "TypeError",
            ErrorType::URIError => "URIError",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum HeapError {
    #[error("heap limit of {limit} cells reached")]
    OutOfMemory { limit: usize },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_type_round_trip() {
        for t in ErrorType::ALL {
            assert_eq!(ErrorType::from_u8(t as u8), t);
        }
        assert_eq!(ErrorType::from_u8(200), ErrorType::Error);
        assert_eq!(ErrorType::URIError.name(), "URIError");
    }
}

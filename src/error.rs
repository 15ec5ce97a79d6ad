use std::fmt::Display;

/// mapkv errors.
#[derive(Clone, Debug, PartialEq)]
pub enum Error {
    /// Invalid persisted data: a corrupt heap header, an out-of-bounds list
    /// offset, or an unparseable blob.
    InvalidData(String),
    /// Invalid user input, typically a malformed key or value.
    InvalidInput(String),
    /// An IO error.
    IO(String),
}

impl std::error::Error for Error {}

impl Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        match self {
            Error::InvalidData(msg) => write!(f, "invalid data: {msg}"),
            Error::InvalidInput(msg) => write!(f, "invalid input: {msg}"),
            Error::IO(msg) => write!(f, "io error: {msg}"),
        }
    }
}

/// Constructs an Error::InvalidData for the given format string.
#[macro_export]
macro_rules! errdata {
    ($($args:tt)*) => { $crate::error::Error::InvalidData(format!($($args)*)).into() };
}

/// Constructs an Error::InvalidInput for the given format string.
#[macro_export]
macro_rules! errinput {
    ($($args:tt)*) => { $crate::error::Error::InvalidInput(format!($($args)*)).into() };
}

/// A mapkv Result returning Error.
pub type Result<T> = std::result::Result<T, Error>;

impl<T> From<Error> for Result<T> {
    fn from(error: Error) -> Self {
        Err(error)
    }
}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Error::IO(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display() {
        assert_eq!(
            Error::InvalidData("bad header".to_string()).to_string(),
            "invalid data: bad header"
        );
        assert_eq!(
            Error::InvalidInput("empty key".to_string()).to_string(),
            "invalid input: empty key"
        );
        assert_eq!(Error::IO("denied".to_string()).to_string(), "io error: denied");
    }

    #[test]
    fn test_from_io_error() {
        let io = std::io::Error::new(std::io::ErrorKind::NotFound, "missing");
        match Error::from(io) {
            Error::IO(msg) => assert!(msg.contains("missing")),
            other => panic!("Expected IO error, got {other:?}"),
        }
    }

    #[test]
    fn test_error_macros() {
        let err: Result<()> = errdata!("block at {} out of bounds", 42);
        assert_eq!(
            err,
            Err(Error::InvalidData("block at 42 out of bounds".to_string()))
        );

        let err: Result<()> = errinput!("key contains NUL");
        assert_eq!(err, Err(Error::InvalidInput("key contains NUL".to_string())));
    }
}

use std::error::Error;
use std::fmt;
use std::io;

pub type RulevarkResult<T> = Result<T, RulevarkError>;

/// wrap any result into a RulevarkError and add the given msg
#[macro_export]
macro_rules! wrap {
    ($result:expr, $msg:expr) => {
        $result.map_err(|err| RulevarkError::wrap($msg, err.into()))
    };
}

pub trait ErrorWrap<T> {
    /// wrap RulevarkResult error into a RulevarkError and add the given msg
    fn wrap<S>(self, msg: S) -> RulevarkResult<T>
    where
        S: Into<String>;
}

impl<T> ErrorWrap<T> for RulevarkResult<T> {
    fn wrap<S>(self, msg: S) -> RulevarkResult<T>
    where
        S: Into<String>,
    {
        self.map_err(|err| RulevarkError::wrap(msg, err))
    }
}

// The main rulevark error type
#[derive(Debug)]
pub enum RulevarkError {
    // A string message
    Message(String),
    // A chain of multiple errors
    Chain(String, Box<RulevarkError>),

    Io(io::Error),

    Regex(regex::Error),

    // A helper process exited non-zero, stderr is kept for the log.
    Command { program: String, stderr: String },
}

impl RulevarkError {
    pub fn msg<S>(msg: S) -> RulevarkError
    where
        S: Into<String>,
    {
        RulevarkError::Message(msg.into())
    }

    pub fn wrap<S>(msg: S, chained: RulevarkError) -> RulevarkError
    where
        S: Into<String>,
    {
        RulevarkError::Chain(msg.into(), Box::new(chained))
    }

    /// unwrap the chain error recursively until we get a non chain type error
    pub fn unwrap(&self) -> &RulevarkError {
        match self {
            RulevarkError::Chain(_, inner) => inner.unwrap(),
            _ => self,
        }
    }
}

impl fmt::Display for RulevarkError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RulevarkError::Message(s) => write!(f, "{}", s),
            RulevarkError::Chain(s, e) => write!(f, "{}: {}", s, e),
            RulevarkError::Io(e) => write!(f, "IO error: {}", e),
            RulevarkError::Regex(e) => write!(f, "regex error: {}", e),
            RulevarkError::Command { program, stderr } => {
                write!(f, "{} exited with an error: {}", program, stderr.trim_end())
            }
        }
    }
}

impl Error for RulevarkError {}

impl From<io::Error> for RulevarkError {
    fn from(err: io::Error) -> RulevarkError {
        RulevarkError::Io(err)
    }
}

impl From<regex::Error> for RulevarkError {
    fn from(err: regex::Error) -> RulevarkError {
        RulevarkError::Regex(err)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_chain_display() {
        let err = RulevarkError::wrap(
            "apply failed",
            RulevarkError::wrap("restore failed", RulevarkError::msg("exit status 2")),
        );
        assert_eq!(
            err.to_string(),
            "apply failed: restore failed: exit status 2"
        );
    }

    #[test]
    fn test_unwrap_returns_root_cause() {
        let err = RulevarkError::wrap("outer", RulevarkError::msg("root"));
        match err.unwrap() {
            RulevarkError::Message(s) => assert_eq!(s, "root"),
            other => panic!("unexpected root error: {}", other),
        }
    }
}

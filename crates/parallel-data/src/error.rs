use std::fmt;

#[derive(Debug)]
pub enum DataError {
    MissingData(String),
    Io(std::io::Error),
    Format(String),
    Runtime(String),
}

impl DataError {
    pub fn missing(message: impl Into<String>) -> Self {
        Self::MissingData(message.into())
    }

    pub fn runtime(message: impl Into<String>) -> Self {
        Self::Runtime(message.into())
    }
}

impl fmt::Display for DataError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DataError::MissingData(msg) => write!(f, "missing data: {}", msg),
            DataError::Io(err) => write!(f, "data io error: {}", err),
            DataError::Format(msg) => write!(f, "malformed data file: {}", msg),
            DataError::Runtime(msg) => write!(f, "data pipeline error: {}", msg),
        }
    }
}

impl std::error::Error for DataError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            DataError::Io(err) => Some(err),
            _ => None,
        }
    }
}

impl From<std::io::Error> for DataError {
    fn from(value: std::io::Error) -> Self {
        DataError::Io(value)
    }
}

impl From<serde_json::Error> for DataError {
    fn from(value: serde_json::Error) -> Self {
        DataError::Format(value.to_string())
    }
}

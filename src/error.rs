use std::fmt;

pub type EResult<T> = Result<T, Error>;

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum ErrorKind {
    /// the device can not be opened
    Connection,
    /// timeout, broken frame or exception code during a register transaction
    Communication,
    /// write to a read-only register, no step covering the run start etc.
    InvalidOperation,
    /// missing or invalid parameter
    Configuration,
    /// local file errors (log file, checkpoint)
    Io,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            ErrorKind::Connection => "connection",
            ErrorKind::Communication => "communication",
            ErrorKind::InvalidOperation => "invalid_operation",
            ErrorKind::Configuration => "configuration",
            ErrorKind::Io => "io",
        })
    }
}

impl ErrorKind {
    /// Process exit status for fatal errors of this kind
    pub fn exit_code(self) -> i32 {
        match self {
            ErrorKind::InvalidOperation => 2,
            _ => 1,
        }
    }
}

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("connection error: {0}")]
    Connection(String),
    #[error("connection error: {0}")]
    Serial(#[from] serial::Error),
    #[error("communication error: {0}")]
    Communication(String),
    #[error("communication error: {0}")]
    Modbus(#[from] rmodbus::ErrorKind),
    #[error("invalid_operation error: {0}")]
    InvalidOperation(String),
    #[error("configuration error: {0}")]
    Configuration(String),
    #[error("configuration error: {0}")]
    Yaml(#[from] serde_yaml::Error),
    #[error("configuration error: {0}")]
    Template(#[from] tera::Error),
    #[error("configuration error: {0}")]
    ParseInt(#[from] std::num::ParseIntError),
    #[error("configuration error: {0}")]
    ParseFloat(#[from] std::num::ParseFloatError),
    #[error("io error: {0}")]
    Io(String),
    /// io errors outside of register transactions are local file errors, transactions map
    /// their errors explicitly
    #[error("io error: {0}")]
    File(#[from] std::io::Error),
}

impl Error {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::Connection(_) | Error::Serial(_) => ErrorKind::Connection,
            Error::Communication(_) | Error::Modbus(_) => ErrorKind::Communication,
            Error::InvalidOperation(_) => ErrorKind::InvalidOperation,
            Error::Configuration(_)
            | Error::Yaml(_)
            | Error::Template(_)
            | Error::ParseInt(_)
            | Error::ParseFloat(_) => ErrorKind::Configuration,
            Error::Io(_) | Error::File(_) => ErrorKind::Io,
        }
    }
    /// The error text without the kind prefix
    pub fn message(&self) -> String {
        match self {
            Error::Connection(m)
            | Error::Communication(m)
            | Error::InvalidOperation(m)
            | Error::Configuration(m)
            | Error::Io(m) => m.clone(),
            Error::Serial(e) => e.to_string(),
            Error::Modbus(e) => e.to_string(),
            Error::Yaml(e) => e.to_string(),
            Error::Template(e) => e.to_string(),
            Error::ParseInt(e) => e.to_string(),
            Error::ParseFloat(e) => e.to_string(),
            Error::File(e) => e.to_string(),
        }
    }
    pub fn connection<T: fmt::Display>(message: T) -> Self {
        Error::Connection(message.to_string())
    }
    pub fn communication<T: fmt::Display>(message: T) -> Self {
        Error::Communication(message.to_string())
    }
    pub fn invalid_operation<T: fmt::Display>(message: T) -> Self {
        Error::InvalidOperation(message.to_string())
    }
    pub fn configuration<T: fmt::Display>(message: T) -> Self {
        Error::Configuration(message.to_string())
    }
    pub fn io<T: fmt::Display>(message: T) -> Self {
        Error::Io(message.to_string())
    }
}

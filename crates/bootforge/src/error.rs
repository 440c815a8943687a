use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Malformed or inconsistent build specification.
    Config,
    /// Image-definition template failed to render.
    Template,
    /// A required executable was not found on PATH.
    Discovery,
    /// Network failure or non-success HTTP status.
    Transfer,
    /// Content digest mismatch or missing pin.
    Integrity,
    /// External tool exited non-zero or could not be spawned.
    Subprocess,
    /// Missing file, inaccessible path, failed directory creation.
    Filesystem,
}

impl ErrorKind {
    pub fn as_str(self) -> &'static str {
        match self {
            ErrorKind::Config => "config",
            ErrorKind::Template => "template",
            ErrorKind::Discovery => "discovery",
            ErrorKind::Transfer => "transfer",
            ErrorKind::Integrity => "integrity",
            ErrorKind::Subprocess => "subprocess",
            ErrorKind::Filesystem => "filesystem",
        }
    }

    pub fn exit_code(self) -> u8 {
        match self {
            ErrorKind::Config => 2,
            ErrorKind::Template => 3,
            ErrorKind::Discovery => 4,
            ErrorKind::Transfer => 5,
            ErrorKind::Integrity => 6,
            ErrorKind::Subprocess => 7,
            ErrorKind::Filesystem => 8,
        }
    }
}

#[derive(Debug)]
pub struct Error {
    kind: ErrorKind,
    msg: String,
}

impl Error {
    pub fn new<M: Into<String>>(kind: ErrorKind, msg: M) -> Self {
        Self {
            kind,
            msg: msg.into(),
        }
    }

    pub fn config<M: Into<String>>(msg: M) -> Self {
        Self::new(ErrorKind::Config, msg)
    }

    pub fn template<M: Into<String>>(msg: M) -> Self {
        Self::new(ErrorKind::Template, msg)
    }

    pub fn discovery<M: Into<String>>(msg: M) -> Self {
        Self::new(ErrorKind::Discovery, msg)
    }

    pub fn transfer<M: Into<String>>(msg: M) -> Self {
        Self::new(ErrorKind::Transfer, msg)
    }

    pub fn integrity<M: Into<String>>(msg: M) -> Self {
        Self::new(ErrorKind::Integrity, msg)
    }

    pub fn subprocess<M: Into<String>>(msg: M) -> Self {
        Self::new(ErrorKind::Subprocess, msg)
    }

    pub fn fs<M: Into<String>>(msg: M) -> Self {
        Self::new(ErrorKind::Filesystem, msg)
    }

    pub fn kind(&self) -> ErrorKind {
        self.kind
    }

    pub fn message(&self) -> &str {
        &self.msg
    }

    /// Prefix the message with outer context, keeping the kind.
    pub fn context<C: fmt::Display>(self, ctx: C) -> Self {
        Self {
            kind: self.kind,
            msg: format!("{ctx}: {}", self.msg),
        }
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.msg)
    }
}

impl std::error::Error for Error {}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Self::fs(err.to_string())
    }
}

impl From<toml::de::Error> for Error {
    fn from(err: toml::de::Error) -> Self {
        Self::config(err.to_string())
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Self::config(format!("json error: {err}"))
    }
}

impl From<reqwest::Error> for Error {
    fn from(err: reqwest::Error) -> Self {
        match err.url() {
            Some(url) => Self::transfer(format!("request to {url} failed: {err}")),
            None => Self::transfer(err.to_string()),
        }
    }
}

impl From<which::Error> for Error {
    fn from(err: which::Error) -> Self {
        Self::discovery(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, Error>;

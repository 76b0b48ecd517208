use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Malformed manifest, bad attribute, missing defconfig or fragment.
    Config,
    /// Non-zero exit (or spawn failure) of an external tool.
    Tool { code: Option<i32> },
    /// Container runtime / daemon failure.
    Container,
    /// SIGINT arrived while a command was blocking.
    Interrupted,
    Io,
}

#[derive(Debug)]
pub struct Error {
    kind: ErrorKind,
    msg: String,
}

impl Error {
    pub fn msg<M: Into<String>>(msg: M) -> Self {
        Self {
            kind: ErrorKind::Io,
            msg: msg.into(),
        }
    }

    pub fn config<M: Into<String>>(msg: M) -> Self {
        Self {
            kind: ErrorKind::Config,
            msg: msg.into(),
        }
    }

    pub fn tool<M: Into<String>>(code: Option<i32>, msg: M) -> Self {
        Self {
            kind: ErrorKind::Tool { code },
            msg: msg.into(),
        }
    }

    pub fn container<M: Into<String>>(msg: M) -> Self {
        Self {
            kind: ErrorKind::Container,
            msg: msg.into(),
        }
    }

    pub fn interrupted() -> Self {
        Self {
            kind: ErrorKind::Interrupted,
            msg: "interrupted".into(),
        }
    }

    /// Prefix the message, keeping the kind (and so the exit code).
    pub fn context(self, what: impl fmt::Display) -> Self {
        Self {
            kind: self.kind,
            msg: format!("{what}: {}", self.msg),
        }
    }

    pub fn kind(&self) -> ErrorKind {
        self.kind
    }

    pub fn is_config(&self) -> bool {
        self.kind == ErrorKind::Config
    }

    pub fn is_interrupted(&self) -> bool {
        self.kind == ErrorKind::Interrupted
    }

    // Process exit code for this failure. Interrupts are a clean exit.
    pub fn exit_code(&self) -> i32 {
        match self.kind {
            ErrorKind::Interrupted => 0,
            ErrorKind::Tool { code: Some(c) } => c.clamp(1, 255),
            _ => 1,
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
        Self::msg(err.to_string())
    }
}

impl From<toml::de::Error> for Error {
    fn from(err: toml::de::Error) -> Self {
        Self::config(err.to_string())
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Self::config(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exit_codes_follow_kind() {
        assert_eq!(Error::config("bad").exit_code(), 1);
        assert_eq!(Error::tool(Some(2), "make").exit_code(), 2);
        assert_eq!(Error::tool(Some(-9), "make").exit_code(), 1);
        assert_eq!(Error::tool(Some(300), "make").exit_code(), 255);
        assert_eq!(Error::tool(None, "spawn").exit_code(), 1);
        assert_eq!(Error::interrupted().exit_code(), 0);
    }
}

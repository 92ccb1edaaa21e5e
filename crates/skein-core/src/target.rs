use serde::{Deserialize, Serialize};

/// What an intercepted call targets. Resolved once, at rewrite time.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum CallTarget {
    Function { name: String },
    Method { receiver: String, method: String },
    /// SDK call (`skein.*`, `console.*`) answered by a handler RPC.
    Syscall { name: String },
}

impl CallTarget {
    pub fn function(name: impl Into<String>) -> Self {
        CallTarget::Function { name: name.into() }
    }

    pub fn method(receiver: impl Into<String>, method: impl Into<String>) -> Self {
        CallTarget::Method {
            receiver: receiver.into(),
            method: method.into(),
        }
    }

    pub fn syscall(name: impl Into<String>) -> Self {
        CallTarget::Syscall { name: name.into() }
    }

    pub fn is_syscall(&self) -> bool {
        matches!(self, CallTarget::Syscall { .. })
    }
}

impl std::fmt::Display for CallTarget {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CallTarget::Function { name } => write!(f, "{name}"),
            CallTarget::Method { receiver, method } => write!(f, "{receiver}.{method}"),
            CallTarget::Syscall { name } => write!(f, "skein.{name}"),
        }
    }
}

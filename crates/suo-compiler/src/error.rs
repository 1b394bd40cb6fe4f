use thiserror::Error;

#[derive(Error, Debug)]
pub enum CompileError {
    #[error("the program must be a single :lambda form")]
    TopLevelNotLambda,

    #[error("assignment to immutable variable '{0}'")]
    ImmutableAssignment(String),

    #[error("malformed {0} form")]
    Malformed(&'static str),

    #[error("unknown primitive '{0}'")]
    UnknownPrimitive(String),

    #[error("mutually recursive fix captures cannot be closed")]
    CyclicFix,

    #[error("reference to code label '{0}' before its function is generated")]
    UnboundCodeLabel(String),
}

pub type Result<T, E = CompileError> = std::result::Result<T, E>;

//! Error types

use thiserror::Error;

#[derive(Debug, Error)]
pub enum VerifyError {
    #[error("function {function} has an unterminated block {block}")]
    UnterminatedBlock { function: String, block: String },

    #[error("function {function} block {block} has a phi after a non-phi instruction")]
    PhiNotAPrefix { function: String, block: String },

    #[error("function {function} block {block} branches to unknown block {target}")]
    UnknownBranchTarget {
        function: String,
        block: String,
        target: String,
    },

    #[error(
        "function {function} block {block} phi is missing an incoming value for predecessor {predecessor}"
    )]
    PhiMissingIncoming {
        function: String,
        block: String,
        predecessor: String,
    },

    #[error("function {function} block {block} phi lists incoming edge from non-predecessor {from}")]
    PhiSpuriousIncoming {
        function: String,
        block: String,
        from: String,
    },

    #[error("function {function} has no blocks but is not a declaration")]
    EmptyDefinition { function: String },

    #[error("function {function} block {block} is unreachable from the entry")]
    UnreachableBlock { function: String, block: String },
}

#[derive(Debug, Error)]
pub enum IrError {
    #[error(transparent)]
    Verify(#[from] VerifyError),

    #[error("module has no function named {0}")]
    NoSuchFunction(String),

    #[error("module has no global named {0}")]
    NoSuchGlobal(String),

    #[error("type mismatch: expected {expected}, found {found}")]
    TypeMismatch { expected: String, found: String },
}

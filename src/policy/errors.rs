use miette::Diagnostic;
use thiserror::Error;

/// Failure to turn expression source into a program. Always fatal at startup.
#[derive(Debug, Clone, PartialEq, Eq, Error, Diagnostic)]
pub enum CompileError {
    #[error("syntax error at column {column}: {message}")]
    #[diagnostic(
        code(policy_gate::policy::syntax),
        help("Supported operators: ==, !=, <, <=, >, >=, &&, ||, !, in, [index], .field, size(), has(), startsWith(), endsWith(), contains()")
    )]
    SyntaxError { column: usize, message: String },

    #[error("undeclared reference to `{name}` at column {column}")]
    #[diagnostic(
        code(policy_gate::policy::undeclared_identifier),
        help("Declared variables are url.path, url.params, url.query and req.header")
    )]
    UndeclaredIdentifier { column: usize, name: String },

    #[error("type mismatch at column {column}: {message}")]
    #[diagnostic(code(policy_gate::policy::type_mismatch))]
    TypeMismatch { column: usize, message: String },

    #[error("expression must evaluate to bool, found {found}")]
    #[diagnostic(
        code(policy_gate::policy::non_boolean_output),
        help("Policies decide allow/deny, e.g. url.path == \"/admin\"")
    )]
    NonBooleanOutput { found: String },
}

/// Failure while evaluating a compiled program against one request.
/// Always resolves to a rejection.
#[derive(Debug, Clone, PartialEq, Eq, Error, Diagnostic)]
pub enum EvalError {
    #[error("policy program is not compiled")]
    #[diagnostic(code(policy_gate::policy::not_compiled))]
    NotCompiled,

    #[error("evaluation failed: {cause}")]
    #[diagnostic(code(policy_gate::policy::evaluation_failed))]
    EvaluationFailed { cause: String },

    #[error("evaluation cancelled")]
    #[diagnostic(code(policy_gate::policy::cancelled))]
    Cancelled,
}

impl EvalError {
    pub(crate) fn failed(cause: impl Into<String>) -> Self {
        EvalError::EvaluationFailed {
            cause: cause.into(),
        }
    }
}

#[derive(Debug, Error, Diagnostic)]
pub enum PolicyError {
    #[error("Failed to read policies file `{path}`")]
    #[diagnostic(
        code(policy_gate::policy::read),
        help("Check that --policies-file points to a readable file")
    )]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to decode policies file `{path}`: {message}")]
    #[diagnostic(
        code(policy_gate::policy::decode),
        help("The file must hold a JSON array of {{\"path\": ..., \"expr\": ...}} objects; comments and trailing commas are allowed")
    )]
    Decode { path: String, message: String },

    #[error("Failed to compile policy #{index} (`{path}`)")]
    #[diagnostic(code(policy_gate::policy::compile))]
    Compile {
        index: usize,
        path: String,
        #[source]
        #[diagnostic_source]
        source: CompileError,
    },

    #[error("Policy #{index} has invalid path `{path}`")]
    #[diagnostic(
        code(policy_gate::policy::invalid_path),
        help("Route paths must start with `/`, e.g. \"/users/{{id}}\"")
    )]
    InvalidPath { index: usize, path: String },

    #[error("Policy #{index} binds path `{path}` already bound by policy #{first}")]
    #[diagnostic(
        code(policy_gate::policy::duplicate_path),
        help("Combine both expressions with && or || into a single policy")
    )]
    DuplicatePath {
        index: usize,
        first: usize,
        path: String,
    },

    #[error("Policy #{index} has unroutable path `{path}`: {reason}")]
    #[diagnostic(
        code(policy_gate::policy::invalid_route),
        help("Captures are written `{{name}}` or `{{*rest}}`, and no two patterns may match the same requests")
    )]
    InvalidRoute {
        index: usize,
        path: String,
        reason: String,
    },
}

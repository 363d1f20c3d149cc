pub mod checker;
pub mod condition;
pub mod context;
pub mod errors;
pub mod eval;
pub mod loader;
pub mod types;

use std::collections::HashMap;
use std::sync::Arc;

use serde::Deserialize;
use tokio_util::sync::CancellationToken;

use checker::Program;
use context::RequestContext;
use errors::{CompileError, EvalError, PolicyError};

/// One entry of the policies file.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PolicyDefinition {
    /// Route pattern, e.g. `/users/{id}`
    pub path: String,
    /// Boolean expression guarding the route
    pub expr: String,
}

/// A route bound to its policy expression and, once compiled, its program.
#[derive(Debug)]
pub struct Policy {
    path: String,
    expr: String,
    program: Option<Program>,
}

/// Outcome of evaluating one request against one policy.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Decision {
    Allow,
    Deny,
    Error(EvalError),
}

impl From<Result<bool, EvalError>> for Decision {
    fn from(result: Result<bool, EvalError>) -> Self {
        match result {
            Ok(true) => Decision::Allow,
            Ok(false) => Decision::Deny,
            Err(e) => Decision::Error(e),
        }
    }
}

impl Policy {
    /// An uncompiled policy; call [`Policy::compile`] before evaluating it.
    pub fn new(path: impl Into<String>, expr: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            expr: expr.into(),
            program: None,
        }
    }

    pub fn compile(&mut self) -> Result<(), CompileError> {
        self.program = Some(checker::compile(&self.expr)?);
        Ok(())
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn expr(&self) -> &str {
        &self.expr
    }

    pub fn is_compiled(&self) -> bool {
        self.program.is_some()
    }

    pub fn evaluate(
        &self,
        context: &RequestContext,
        cancel: &CancellationToken,
    ) -> Result<bool, EvalError> {
        let program = self.program.as_ref().ok_or(EvalError::NotCompiled)?;
        eval::evaluate(program, context, cancel)
    }

    pub fn decide(&self, context: &RequestContext, cancel: &CancellationToken) -> Decision {
        self.evaluate(context, cancel).into()
    }
}

impl From<PolicyDefinition> for Policy {
    fn from(def: PolicyDefinition) -> Self {
        Policy::new(def.path, def.expr)
    }
}

/// Ordered set of compiled policies, one per route.
/// Immutable after construction; changing policies requires a restart.
#[derive(Debug, Default)]
pub struct PolicySet {
    policies: Vec<Arc<Policy>>,
}

impl PolicySet {
    /// Compile every definition in order. Any failure rejects the whole set.
    ///
    /// Paths are also registered on a scratch route table so that patterns the
    /// router would refuse are reported here instead of at route registration.
    pub fn compile(definitions: Vec<PolicyDefinition>) -> Result<Self, PolicyError> {
        let mut seen: HashMap<String, usize> = HashMap::new();
        let mut routes: matchit::Router<usize> = matchit::Router::new();
        let mut policies = Vec::with_capacity(definitions.len());

        for (index, def) in definitions.into_iter().enumerate() {
            if !def.path.starts_with('/') {
                return Err(PolicyError::InvalidPath {
                    index,
                    path: def.path,
                });
            }
            if let Some(&first) = seen.get(&def.path) {
                return Err(PolicyError::DuplicatePath {
                    index,
                    first,
                    path: def.path,
                });
            }
            seen.insert(def.path.clone(), index);
            if let Err(reason) = check_route(&mut routes, &def.path, index) {
                return Err(PolicyError::InvalidRoute {
                    index,
                    path: def.path,
                    reason,
                });
            }

            let mut policy = Policy::from(def);
            policy.compile().map_err(|source| PolicyError::Compile {
                index,
                path: policy.path.clone(),
                source,
            })?;
            policies.push(Arc::new(policy));
        }

        Ok(Self { policies })
    }

    pub fn iter(&self) -> impl Iterator<Item = &Arc<Policy>> {
        self.policies.iter()
    }

    pub fn len(&self) -> usize {
        self.policies.len()
    }

    pub fn is_empty(&self) -> bool {
        self.policies.is_empty()
    }
}

/// Segments starting with `:` or `*` are the pre-0.8 capture syntax, which the
/// router refuses rather than matching literally.
fn check_route(
    routes: &mut matchit::Router<usize>,
    path: &str,
    index: usize,
) -> Result<(), String> {
    if let Some(segment) = path
        .split('/')
        .find(|segment| segment.starts_with(':') || segment.starts_with('*'))
    {
        return Err(format!(
            "segment `{segment}` uses the old capture syntax, write `{{name}}` or `{{*name}}`"
        ));
    }
    routes.insert(path, index).map_err(|e| e.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    fn def(path: &str, expr: &str) -> PolicyDefinition {
        PolicyDefinition {
            path: path.into(),
            expr: expr.into(),
        }
    }

    fn request(path: &str) -> RequestContext {
        RequestContext::new(path, BTreeMap::new(), BTreeMap::new(), BTreeMap::new())
    }

    #[test]
    fn test_compile_preserves_order() {
        let set = PolicySet::compile(vec![
            def("/b", "true"),
            def("/a", r#"url.path == "/a""#),
            def("/c/{id}", r#"url.params.id != """#),
        ])
        .unwrap();
        let paths: Vec<&str> = set.iter().map(|p| p.path()).collect();
        assert_eq!(paths, ["/b", "/a", "/c/{id}"]);
        assert!(set.iter().all(|p| p.is_compiled()));
    }

    #[test]
    fn test_single_failure_rejects_whole_set() {
        let err = PolicySet::compile(vec![
            def("/ok", "true"),
            def("/bad", "url.path"),
            def("/also-ok", "false"),
        ])
        .unwrap_err();
        match err {
            PolicyError::Compile {
                index,
                path,
                source,
            } => {
                assert_eq!(index, 1);
                assert_eq!(path, "/bad");
                assert!(matches!(source, CompileError::NonBooleanOutput { .. }));
            }
            other => panic!("expected compile error, got {other:?}"),
        }
    }

    #[test]
    fn test_undeclared_variable_fails() {
        let err = PolicySet::compile(vec![def("/x", r#"user.role == "admin""#)]).unwrap_err();
        assert!(matches!(
            err,
            PolicyError::Compile {
                source: CompileError::UndeclaredIdentifier { .. },
                ..
            }
        ));
    }

    #[test]
    fn test_invalid_and_duplicate_paths() {
        assert!(matches!(
            PolicySet::compile(vec![def("admin", "true")]).unwrap_err(),
            PolicyError::InvalidPath { index: 0, .. }
        ));
        assert!(matches!(
            PolicySet::compile(vec![def("/a", "true"), def("/a", "false")]).unwrap_err(),
            PolicyError::DuplicatePath {
                index: 1,
                first: 0,
                ..
            }
        ));
    }

    #[test]
    fn test_conflicting_captures_rejected() {
        let err = PolicySet::compile(vec![def("/a/{x}", "true"), def("/a/{y}", "true")])
            .unwrap_err();
        match err {
            PolicyError::InvalidRoute { index, path, reason } => {
                assert_eq!(index, 1);
                assert_eq!(path, "/a/{y}");
                assert!(reason.contains("/a/{x}"), "{reason}");
            }
            other => panic!("expected route error, got {other:?}"),
        }
    }

    #[test]
    fn test_old_capture_syntax_rejected() {
        for path in ["/api/*", "/users/:id", "/files/*rest"] {
            assert!(
                matches!(
                    PolicySet::compile(vec![def("/ok", "true"), def(path, "true")]).unwrap_err(),
                    PolicyError::InvalidRoute { index: 1, .. }
                ),
                "{path} should be rejected"
            );
        }
    }

    #[test]
    fn test_distinct_routes_accepted() {
        let set = PolicySet::compile(vec![
            def("/users/{id}", "true"),
            def("/users/{id}/posts", "true"),
            def("/users/me", "true"),
            def("/static/{*rest}", "true"),
        ])
        .unwrap();
        assert_eq!(set.len(), 4);
    }

    #[test]
    fn test_uncompiled_policy_fails_closed() {
        let policy = Policy::new("/admin", "true");
        let cancel = CancellationToken::new();
        assert_eq!(
            policy.evaluate(&request("/admin"), &cancel),
            Err(EvalError::NotCompiled)
        );
        assert_eq!(
            policy.decide(&request("/admin"), &cancel),
            Decision::Error(EvalError::NotCompiled)
        );
    }

    #[test]
    fn test_decide() {
        let mut policy = Policy::new("/admin", r#"url.path == "/admin""#);
        policy.compile().unwrap();
        let cancel = CancellationToken::new();
        assert_eq!(policy.decide(&request("/admin"), &cancel), Decision::Allow);
        assert_eq!(policy.decide(&request("/other"), &cancel), Decision::Deny);
    }
}

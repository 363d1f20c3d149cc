use std::path::Path;

use crate::policy::errors::PolicyError;
use crate::policy::{PolicyDefinition, PolicySet};

/// Load the policies file and compile it into an immutable `PolicySet`.
///
/// The file is a JSON array of `{ "path": ..., "expr": ... }` objects;
/// comments and trailing commas are accepted.
pub fn load_policies(path: &Path) -> Result<PolicySet, PolicyError> {
    let contents = std::fs::read_to_string(path).map_err(|source| PolicyError::Read {
        path: path.display().to_string(),
        source,
    })?;

    let definitions = parse_policies(&contents).map_err(|e| PolicyError::Decode {
        path: path.display().to_string(),
        message: e.to_string(),
    })?;

    let set = PolicySet::compile(definitions)?;

    if set.is_empty() {
        tracing::warn!(file = %path.display(), "Policies file is empty; every request will be rejected by the router");
    }
    tracing::info!(
        file = %path.display(),
        policies = set.len(),
        "Loaded policies"
    );

    Ok(set)
}

pub fn parse_policies(source: &str) -> Result<Vec<PolicyDefinition>, json5::Error> {
    json5::from_str(source)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::policy::errors::CompileError;

    #[test]
    fn test_parse_with_comments_and_trailing_commas() {
        let defs = parse_policies(
            r#"
// public health check
[
    { "path": "/healthz", "expr": "true" },
    /* admin area */
    {
        "path": "/admin",
        "expr": "\"X-Api-Key\" in req.header && req.header[\"X-Api-Key\"][0] == \"secret\"",
    },
]
"#,
        )
        .unwrap();
        assert_eq!(defs.len(), 2);
        assert_eq!(defs[0].path, "/healthz");
        assert_eq!(
            defs[1].expr,
            r#""X-Api-Key" in req.header && req.header["X-Api-Key"][0] == "secret""#
        );
    }

    #[test]
    fn test_unknown_fields_rejected() {
        assert!(parse_policies(r#"[{ "path": "/", "expr": "true", "mode": "audit" }]"#).is_err());
        assert!(parse_policies(r#"[{ "path": "/" }]"#).is_err());
        assert!(parse_policies(r#"{ "path": "/", "expr": "true" }"#).is_err());
    }

    #[test]
    fn test_load_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("policies.hujson");
        std::fs::write(
            &file,
            r#"[
                { "path": "/admin", "expr": "url.path == \"/admin\"" },
                { "path": "/users/{id}", "expr": "url.params.id == \"42\"" }, // trailing
            ]"#,
        )
        .unwrap();

        let set = load_policies(&file).unwrap();
        assert_eq!(set.len(), 2);
        assert_eq!(set.iter().nth(1).unwrap().path(), "/users/{id}");
    }

    #[test]
    fn test_load_missing_file() {
        let err = load_policies(Path::new("/nonexistent/policies.json")).unwrap_err();
        assert!(matches!(err, PolicyError::Read { .. }));
    }

    #[test]
    fn test_load_malformed_file() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("policies.json");
        std::fs::write(&file, "[{ \"path\": ").unwrap();
        assert!(matches!(
            load_policies(&file).unwrap_err(),
            PolicyError::Decode { .. }
        ));
    }

    #[test]
    fn test_load_reports_failing_policy_index() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("policies.json");
        std::fs::write(
            &file,
            r#"[{ "path": "/a", "expr": "true" }, { "path": "/b", "expr": "url.path" }]"#,
        )
        .unwrap();
        match load_policies(&file).unwrap_err() {
            PolicyError::Compile { index, source, .. } => {
                assert_eq!(index, 1);
                assert_eq!(
                    source,
                    CompileError::NonBooleanOutput {
                        found: "string".into()
                    }
                );
            }
            other => panic!("expected compile error, got {other:?}"),
        }
    }
}

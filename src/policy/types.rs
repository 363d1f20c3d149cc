use std::collections::BTreeMap;
use std::fmt;

/// Static type of an expression.
///
/// Maps are always keyed by strings, so only the value type is carried.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Type {
    Bool,
    Int,
    String,
    List(Box<Type>),
    Map(Box<Type>),
}

impl Type {
    pub fn list(elem: Type) -> Self {
        Type::List(Box::new(elem))
    }

    pub fn map(value: Type) -> Self {
        Type::Map(Box::new(value))
    }
}

impl fmt::Display for Type {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Type::Bool => write!(f, "bool"),
            Type::Int => write!(f, "int"),
            Type::String => write!(f, "string"),
            Type::List(elem) => write!(f, "list({elem})"),
            Type::Map(value) => write!(f, "map(string, {value})"),
        }
    }
}

/// The closed set of variables a policy expression may reference.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Variable {
    UrlPath,
    UrlParams,
    UrlQuery,
    ReqHeader,
}

impl Variable {
    pub const ALL: [Variable; 4] = [
        Variable::UrlPath,
        Variable::UrlParams,
        Variable::UrlQuery,
        Variable::ReqHeader,
    ];

    pub fn name(self) -> &'static str {
        match self {
            Variable::UrlPath => "url.path",
            Variable::UrlParams => "url.params",
            Variable::UrlQuery => "url.query",
            Variable::ReqHeader => "req.header",
        }
    }

    pub fn ty(self) -> Type {
        match self {
            Variable::UrlPath => Type::String,
            Variable::UrlParams => Type::map(Type::String),
            Variable::UrlQuery | Variable::ReqHeader => Type::map(Type::list(Type::String)),
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|v| v.name() == name)
    }
}

impl fmt::Display for Variable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Runtime value produced while evaluating a program.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Value {
    Bool(bool),
    Int(i64),
    String(String),
    List(Vec<Value>),
    Map(BTreeMap<String, Value>),
}

impl Value {
    pub fn type_name(&self) -> &'static str {
        match self {
            Value::Bool(_) => "bool",
            Value::Int(_) => "int",
            Value::String(_) => "string",
            Value::List(_) => "list",
            Value::Map(_) => "map",
        }
    }

    /// Build a `list(string)` value.
    pub fn strings<I, S>(items: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Value::List(items.into_iter().map(|s| Value::String(s.into())).collect())
    }
}

impl From<&str> for Value {
    fn from(value: &str) -> Self {
        Value::String(value.to_string())
    }
}

impl From<String> for Value {
    fn from(value: String) -> Self {
        Value::String(value)
    }
}

impl From<bool> for Value {
    fn from(value: bool) -> Self {
        Value::Bool(value)
    }
}

impl From<i64> for Value {
    fn from(value: i64) -> Self {
        Value::Int(value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_variable_lookup_by_name() {
        for var in Variable::ALL {
            assert_eq!(Variable::from_name(var.name()), Some(var));
        }
        assert_eq!(Variable::from_name("url"), None);
        assert_eq!(Variable::from_name("user.role"), None);
    }

    #[test]
    fn test_variable_types() {
        assert_eq!(Variable::UrlPath.ty(), Type::String);
        assert_eq!(Variable::UrlParams.ty().to_string(), "map(string, string)");
        assert_eq!(
            Variable::ReqHeader.ty().to_string(),
            "map(string, list(string))"
        );
    }
}

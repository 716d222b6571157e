use std::fmt;

use thiserror::Error;

use crate::{meta_ops::MetaOperatorError, ThreadMode};

#[derive(Debug, Copy, Clone, Error)]
#[error("bad thread mode: {found:?}{}", if let Some(expected) = *.expected {
        format!(", expected {:?}", expected)
    } else {
        String::new()
    })]
pub struct BadThreadMode {
    pub found: ThreadMode,
    pub expected: Option<ThreadMode>,
}

/// How a value involved in a failing operation was named in the source.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VariableName {
    /// `local`, `global`, `field`, `upvalue`, `constant`, `method`, `for iterator`, ...
    pub kind: &'static str,
    pub name: String,
}

impl fmt::Display for VariableName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, " ({} '{}')", self.kind, self.name)
    }
}

fn variable_info(variable: &Option<VariableName>) -> String {
    variable.as_ref().map(|v| v.to_string()).unwrap_or_default()
}

fn operator_message(error: &MetaOperatorError, variable: &Option<VariableName>) -> String {
    match error {
        MetaOperatorError::NoIntegerRepresentation { .. } => {
            format!(
                "number{} has no integer representation",
                variable_info(variable)
            )
        }
        error => format!("{}{}", error, variable_info(variable)),
    }
}

/// Errors raised by the dispatch loop itself.
///
/// These are turned into script errors carrying the `chunk:line:` position of the instruction
/// that raised them.
#[derive(Debug, Clone, Error)]
pub enum VMError {
    #[error("{}", operator_message(.error, .variable))]
    Operator {
        error: MetaOperatorError,
        variable: Option<VariableName>,
    },
    #[error("'for' {0} must be a number")]
    ForType(&'static str),
    #[error("'for' step is zero")]
    ForZeroStep,
    #[error("variable '{0}' got a non-closable value")]
    NonClosable(String),
    #[error("stack overflow")]
    StackOverflow,
    #[error("cannot tail call out of a function with pending to-be-closed variables")]
    TailCallTbc,
}

impl From<MetaOperatorError> for VMError {
    fn from(error: MetaOperatorError) -> Self {
        VMError::Operator {
            error,
            variable: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_messages() {
        let err = VMError::Operator {
            error: MetaOperatorError::BadType {
                action: "perform arithmetic on",
                type_name: "nil",
                operand: 0,
            },
            variable: Some(VariableName {
                kind: "local",
                name: "x".to_owned(),
            }),
        };
        assert_eq!(
            err.to_string(),
            "attempt to perform arithmetic on a nil value (local 'x')"
        );

        let err = VMError::Operator {
            error: MetaOperatorError::NoIntegerRepresentation { operand: 1 },
            variable: Some(VariableName {
                kind: "constant",
                name: "1.5".to_owned(),
            }),
        };
        assert_eq!(
            err.to_string(),
            "number (constant '1.5') has no integer representation"
        );

        assert_eq!(
            VMError::ForType("initial value").to_string(),
            "'for' initial value must be a number"
        );
        assert_eq!(
            VMError::NonClosable("x".to_owned()).to_string(),
            "variable 'x' got a non-closable value"
        );
    }
}

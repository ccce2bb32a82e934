use std::fmt::Display;

use crate::error::{HarnessError, HarnessResult};

/// Result of a comparison made by a test body.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AssertionOutcome {
    Pass,
    Fail(String),
}

impl AssertionOutcome {
    pub fn is_pass(&self) -> bool {
        matches!(self, AssertionOutcome::Pass)
    }
}

/// Compares `expected` with `actual`, describing a mismatch with `message`.
pub fn check_eq<T>(expected: T, actual: T, message: &str) -> AssertionOutcome
where
    T: PartialEq + Display,
{
    if expected == actual {
        AssertionOutcome::Pass
    } else {
        AssertionOutcome::Fail(format!("{}: expected `{}`, got `{}`", message, expected, actual))
    }
}

/// [`check_eq`] as a `Result`, for use with `?` inside a test body.
pub fn ensure_eq<T>(expected: T, actual: T, message: &str) -> HarnessResult<()>
where
    T: PartialEq + Display,
{
    if expected == actual {
        Ok(())
    } else {
        Err(HarnessError::AssertionFailed {
            message: message.to_string(),
            expected: expected.to_string(),
            actual: actual.to_string(),
        })
    }
}

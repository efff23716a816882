use snafu::{whatever, ResultExt, Whatever};
use std::error::Error;
use std::str::FromStr;

/// Reads an environment variable for the current process.
///
/// Compared to [std::env::var] there are a couple of differences:
///
/// - [var] uses [dotenvy] which loads the `.env` file from the current or
///   parent directories before returning the value.
///
/// - [var] returns `Ok(None)` (instead of `Err`) if an environment variable
///   wasn't set.
#[track_caller]
pub fn var(key: &str) -> Result<Option<String>, Whatever> {
    match dotenvy::var(key) {
        Ok(content) => Ok(Some(content)),
        Err(dotenvy::Error::EnvVar(std::env::VarError::NotPresent)) => Ok(None),
        Err(error) => whatever!(Err(error), "Failed to read {key} environment variable"),
    }
}

/// Reads an environment variable for the current process, and parses it if
/// it is set.
#[track_caller]
pub fn var_parsed<R>(key: &str) -> Result<Option<R>, Whatever>
where
    R: FromStr,
    R::Err: Error + Send + Sync + 'static,
{
    match var(key)? {
        Some(content) => Ok(Some(content.trim().parse().with_whatever_context(|e| {
            format!("Failed to parse {key} environment variable; {e}")
        })?)),
        None => Ok(None),
    }
}

/// Like [var_parsed], falling back to `default` when the variable is unset.
#[track_caller]
pub fn var_or<R>(key: &str, default: R) -> Result<R, Whatever>
where
    R: FromStr,
    R::Err: Error + Send + Sync + 'static,
{
    Ok(var_parsed(key)?.unwrap_or(default))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_and_default() {
        std::env::set_var("DEDUPE_TEST_ENV_ZONES", " 4 ");
        let zones: Option<usize> = var_parsed("DEDUPE_TEST_ENV_ZONES").unwrap();
        assert_eq!(zones, Some(4));

        let missing: usize = var_or("DEDUPE_TEST_ENV_MISSING", 7).unwrap();
        assert_eq!(missing, 7);

        std::env::set_var("DEDUPE_TEST_ENV_BAD", "four");
        assert!(var_parsed::<usize>("DEDUPE_TEST_ENV_BAD").is_err());
    }
}

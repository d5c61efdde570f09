use std::str::FromStr;

use anyhow::{Context as _, Result};

/// Reads a required environment variable set by the supervising parent.
pub(crate) fn required(name: &str) -> Result<String> {
    std::env::var(name).with_context(|| format!("Required environment variable `{name}` is not set"))
}

pub(crate) fn required_parse<T>(name: &str) -> Result<T>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    required(name)?
        .parse()
        .with_context(|| format!("Environment variable `{name}` is malformed"))
}

/// `true`/`false`/`1`/`0`, as written by the parent for boolean settings.
pub(crate) fn required_flag(name: &str) -> Result<bool> {
    match required(name)?.as_str() {
        "true" | "1" => Ok(true),
        "false" | "0" | "" => Ok(false),
        other => anyhow::bail!("Environment variable `{name}` has non-boolean value `{other}`"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_variables_name_themselves() {
        let err = required("SPLITGATE_TEST_DOES_NOT_EXIST").unwrap_err();

        assert!(format!("{err}").contains("SPLITGATE_TEST_DOES_NOT_EXIST"));
    }

    #[test]
    fn parses_numbers_and_flags() {
        // SAFETY: Test-only; no other thread touches these names.
        unsafe {
            std::env::set_var("SPLITGATE_TEST_PORT", "60053");
            std::env::set_var("SPLITGATE_TEST_FLAG", "true");
        }

        assert_eq!(required_parse::<u16>("SPLITGATE_TEST_PORT").unwrap(), 60053);
        assert!(required_flag("SPLITGATE_TEST_FLAG").unwrap());
    }
}

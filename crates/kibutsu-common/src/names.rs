use crate::{ComposeError, Result};

/// Longest project or service name accepted; keeps derived container names under engine limits.
pub const MAX_NAME_LEN: usize = 63;

/// Checks `name` against the engine-safe charset `[a-z0-9][a-z0-9_-]*`.
pub fn validate_name(name: &str) -> Result<()> {
    let invalid = |reason: &str| {
        Err(ComposeError::InvalidName {
            name: name.to_string(),
            reason: reason.to_string(),
        })
    };

    let Some(first) = name.chars().next() else {
        return invalid("name is empty");
    };
    if name.len() > MAX_NAME_LEN {
        return invalid("name is longer than 63 bytes");
    }
    if !(first.is_ascii_lowercase() || first.is_ascii_digit()) {
        return invalid("must start with a lowercase letter or digit");
    }
    if let Some(bad) = name
        .chars()
        .find(|c| !(c.is_ascii_lowercase() || c.is_ascii_digit() || *c == '-' || *c == '_'))
    {
        return invalid(&format!("character {bad:?} is not allowed"));
    }
    Ok(())
}

/// Project names additionally exclude `_`, which separates the project from the rest of every
/// derived resource name.
pub fn validate_project_name(name: &str) -> Result<()> {
    validate_name(name)?;
    if name.contains('_') {
        return Err(ComposeError::InvalidName {
            name: name.to_string(),
            reason: "project names may not contain '_'".to_string(),
        });
    }
    Ok(())
}

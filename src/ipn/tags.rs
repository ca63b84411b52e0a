//! ACL tag names

use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TagError {
    #[error("tags must start with 'tag:'")]
    MissingPrefix,
    #[error("tag names must not be empty")]
    Empty,
    #[error("tag names must only contain ASCII")]
    NonAscii,
    #[error("tag names must start with a letter, after 'tag:'")]
    BadFirstChar,
    #[error("tag names can only contain numbers, letters, or dashes")]
    BadChar,
}

/// Validate a `tag:name` string
pub fn check_tag(tag: &str) -> Result<(), TagError> {
    let name = tag.strip_prefix("tag:").ok_or(TagError::MissingPrefix)?;
    if name.is_empty() {
        return Err(TagError::Empty);
    }
    if !name.is_ascii() {
        return Err(TagError::NonAscii);
    }
    let bytes = name.as_bytes();
    if !bytes[0].is_ascii_alphabetic() {
        return Err(TagError::BadFirstChar);
    }
    if !bytes.iter().all(|b| b.is_ascii_alphanumeric() || *b == b'-') {
        return Err(TagError::BadChar);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_valid_tags() {
        assert_eq!(check_tag("tag:eng"), Ok(()));
        assert_eq!(check_tag("tag:ssh-servers2"), Ok(()));
    }

    #[test]
    fn test_invalid_tags() {
        assert_eq!(check_tag("eng"), Err(TagError::MissingPrefix));
        assert_eq!(check_tag("tag:"), Err(TagError::Empty));
        assert_eq!(check_tag("tag:ünï"), Err(TagError::NonAscii));
        assert_eq!(check_tag("tag:1eng"), Err(TagError::BadFirstChar));
        assert_eq!(check_tag("tag:eng_team"), Err(TagError::BadChar));
    }
}

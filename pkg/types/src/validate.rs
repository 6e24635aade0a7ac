use anyhow::{Result, bail};

/// Validate an instance or session identifier before it is embedded in a
/// store key.
/// Rules: non-empty, max 128 chars, printable ASCII, no whitespace.
pub fn validate_id(id: &str) -> Result<()> {
    if id.is_empty() {
        bail!("id must not be empty");
    }
    if id.len() > 128 {
        bail!("id '{}' exceeds 128 characters (got {})", id, id.len());
    }
    if !id.chars().all(|c| c.is_ascii_graphic()) {
        bail!(
            "id '{}' must contain only printable ASCII characters without whitespace",
            id
        );
    }
    Ok(())
}

//! Literal success/error markers exchanged with expense collaborators.

use crate::core::error::{Error, Result};

pub const SUCCEED: &str = "SUCCEED";
pub const ERROR_PREFIX: &str = "ERROR:";

pub fn render(result: &Result<()>) -> String {
    match result {
        Ok(()) => SUCCEED.to_string(),
        Err(err) => render_error(err),
    }
}

pub fn render_error(err: &Error) -> String {
    format!("{ERROR_PREFIX}{}", err.marker_reason())
}

/// Decodes a collaborator's response body. Anything that is neither the
/// success marker nor an `ERROR:` marker is a generic failure.
pub fn parse(body: &str) -> Result<()> {
    let body = body.trim();
    if body == SUCCEED {
        return Ok(());
    }
    let Some(reason) = body.strip_prefix(ERROR_PREFIX) else {
        return Err(Error::System(format!("unrecognized response body '{body}'")));
    };
    Err(match reason {
        "INVALID_ID" => Error::NotFound(reason.to_string()),
        "DUPLICATE_ID" => Error::Duplicate(reason.to_string()),
        "INVALID_STATE" => Error::InvalidState(reason.to_string()),
        "INVALID_FORM_DATA" => Error::InvalidInput(reason.to_string()),
        other => Error::Remote {
            reason: other.to_string(),
        },
    })
}

//! Copies the server command line to the system clipboard.

use anyhow::{Context, Result};

use crate::command::build_command;
use crate::settings::Profile;

/// Builds the preview for `profile`, puts it on the clipboard and returns it.
pub fn copy_command(profile: &Profile) -> Result<String> {
    let preview = build_command(&profile.settings, &profile.custom_args)?.preview();
    let mut clipboard = arboard::Clipboard::new().context("failed to access clipboard")?;
    clipboard
        .set_text(preview.clone())
        .context("failed to set clipboard text")?;
    Ok(preview)
}

//! Small helpers shared by the writer, the browser session and the CLI

use anyhow::{Context, Result};

/// Lowercase ASCII slug of at most `max` characters
pub fn slugify(value: &str, max: usize) -> String {
    let mut slug = String::with_capacity(value.len());
    let mut pending_dash = false;
    for ch in value.chars().flat_map(char::to_lowercase) {
        if ch.is_ascii_alphanumeric() {
            if pending_dash && !slug.is_empty() {
                slug.push('-');
            }
            pending_dash = false;
            slug.push(ch);
        } else {
            pending_dash = true;
        }
    }
    let mut truncated: String = slug.chars().take(max).collect();
    while truncated.ends_with('-') {
        truncated.pop();
    }
    truncated
}

/// Opens `url` with the platform's default handler
pub fn open_in_browser(url: &str) -> Result<()> {
    let mut command = if cfg!(target_os = "macos") {
        std::process::Command::new("open")
    } else if cfg!(target_os = "windows") {
        let mut c = std::process::Command::new("cmd");
        c.args(["/C", "start", ""]);
        c
    } else {
        std::process::Command::new("xdg-open")
    };
    command
        .arg(url)
        .stdin(std::process::Stdio::null())
        .stdout(std::process::Stdio::null())
        .stderr(std::process::Stdio::null())
        .spawn()
        .with_context(|| format!("Failed to open {url}"))?;
    Ok(())
}

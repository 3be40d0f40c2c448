use std::{
    env,
    path::{Path, PathBuf},
};

use time::{OffsetDateTime, format_description::well_known::Rfc3339};

/// `~/...` form of `directory` when it lives under `$HOME`.
pub fn relative_to_home(directory: &Path) -> String {
    let Some(home) = env::var_os("HOME").map(PathBuf::from) else {
        return directory.display().to_string();
    };
    match directory.strip_prefix(&home) {
        Ok(stripped) if stripped.components().next().is_none() => "~".to_string(),
        Ok(stripped) => format!("~/{}", stripped.display()),
        Err(_) => directory.display().to_string(),
    }
}

/// Coarse "how long ago" text; dates older than a week are printed as is.
pub fn format_last_active(value: Option<OffsetDateTime>, now: OffsetDateTime) -> String {
    let Some(timestamp) = value else {
        return "-".to_string();
    };
    let seconds = (now - timestamp).whole_seconds().max(0);
    const MINUTE: i64 = 60;
    const HOUR: i64 = 60 * MINUTE;
    const DAY: i64 = 24 * HOUR;

    if seconds >= 7 * DAY {
        return timestamp
            .format(&Rfc3339)
            .unwrap_or_else(|_| timestamp.to_string());
    }
    let (count, unit) = match seconds {
        s if s < MINUTE => return "just now".to_string(),
        s if s < HOUR => (s / MINUTE, "min"),
        s if s < DAY => (s / HOUR, "hour"),
        s => (s / DAY, "day"),
    };
    format!("{count} {unit}{} ago", if count == 1 { "" } else { "s" })
}

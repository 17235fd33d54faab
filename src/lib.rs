pub mod app;
pub mod auth;
pub mod client;
pub mod config;
pub mod console;
pub mod errors;
pub mod messages;
pub mod router;
pub mod server;
pub mod stats;

/// Render a session or connection lifetime as `Nd HH:MM:SS.mmm` for log
/// lines.
pub fn format_duration(duration: &chrono::Duration) -> String {
    let total_ms = duration.num_milliseconds().max(0);

    let ms = total_ms % 1000;
    let seconds = (total_ms / 1000) % 60;
    let minutes = (total_ms / 60_000) % 60;
    let hours = (total_ms / 3_600_000) % 24;
    let days = total_ms / 86_400_000;

    format!("{days}d {hours:02}:{minutes:02}:{seconds:02}.{ms:03}")
}

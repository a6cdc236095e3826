//! Console presentation of the current track.

use crate::track::TrackSnapshot;

const FIELD_WIDTH: usize = 60;

/// Shortens `text` to at most `max` characters, ending in "…" when cut.
pub fn truncate(text: &str, max: usize) -> String {
    if text.chars().count() <= max {
        return text.to_string();
    }
    let mut out: String = text.chars().take(max.saturating_sub(1)).collect();
    out.push('…');
    out
}

fn or_unknown(text: &str) -> &str {
    if text.trim().is_empty() {
        "Unknown"
    } else {
        text
    }
}

/// Multi-line block for a track, or the "nothing playing" view.
pub fn render_track(track: Option<&TrackSnapshot>) -> String {
    let Some(info) = track else {
        return "\n⏹  Nothing playing. Waiting for media...".to_string();
    };

    let art = match &info.artwork {
        Some(bytes) => format!("[Image data: {} bytes]", bytes.len()),
        None => "[No image]".to_string(),
    };

    let mut lines = vec![
        "\n🎵 NOW PLAYING 🎵".to_string(),
        format!("   Track:    {}", truncate(&info.title, FIELD_WIDTH)),
        format!("   Artist:   {}", truncate(or_unknown(&info.artist), FIELD_WIDTH)),
        format!("   Album:    {}", truncate(or_unknown(&info.album), FIELD_WIDTH)),
        format!("   Length:   {}", info.formatted_duration()),
        format!("   Position: {}", info.track_position()),
        format!("   Art:      {}", art),
    ];
    if !info.source_app.is_empty() {
        lines.insert(1, format!("   App:      {}", info.source_app));
    }
    lines.join("\n")
}

pub fn print_track(track: Option<&TrackSnapshot>) {
    println!("{}", render_track(track));
}

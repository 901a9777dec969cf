/// Sanitizes a filename by replacing characters that are invalid on
/// common filesystems.
pub fn sanitize_filename(filename: &str) -> String {
    filename
        .chars()
        .map(|c| match c {
            '<' | '>' | ':' | '"' | '/' | '\\' | '|' | '?' | '*' => '_',
            c if c.is_control() => '_',
            c => c,
        })
        .collect::<String>()
        .trim()
        .to_string()
}

/// Sanitizes a track filename in "Artist - Title" format.
pub fn sanitize_track_filename(artist: &str, title: &str) -> String {
    let sanitized_artist = sanitize_filename(artist);
    let sanitized_title = sanitize_filename(title);
    format!("{} - {}", sanitized_artist, sanitized_title)
}

/// Generates a unique ID for downloads.
pub fn generate_download_id() -> String {
    uuid::Uuid::new_v4().to_string()
}

/// Formats a millisecond duration as m:ss.
pub fn format_duration_ms(duration_ms: u64) -> String {
    format!("{}:{:02}", duration_ms / 60_000, (duration_ms / 1000) % 60)
}

/// Formats a byte count as a human-readable size.
pub fn format_file_size(bytes: u64) -> String {
    if bytes >= 1024 * 1024 {
        format!("{:.1} MB", bytes as f64 / (1024.0 * 1024.0))
    } else {
        format!("{:.1} KB", bytes as f64 / 1024.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sanitize_strips_invalid_characters() {
        assert_eq!(sanitize_filename("AC/DC: Live?"), "AC_DC_ Live_");
        assert_eq!(sanitize_filename("plain name"), "plain name");
    }

    #[test]
    fn track_filename_format() {
        assert_eq!(
            sanitize_track_filename("Daft Punk", "One More Time"),
            "Daft Punk - One More Time"
        );
        assert_eq!(
            sanitize_track_filename("a/b", "c*d"),
            "a_b - c_d"
        );
    }

    #[test]
    fn duration_formatting() {
        assert_eq!(format_duration_ms(245_000), "4:05");
        assert_eq!(format_duration_ms(59_999), "0:59");
    }

    #[test]
    fn file_size_formatting() {
        assert_eq!(format_file_size(5 * 1024 * 1024), "5.0 MB");
        assert_eq!(format_file_size(512), "0.5 KB");
    }
}

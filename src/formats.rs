use serde::Deserialize;

pub const BEST_FORMAT: &str = "best";

/// The subset of an engine format entry the negotiator looks at.
#[derive(Debug, Clone, Deserialize)]
pub struct FormatDescriptor {
    pub format_id: String,
    #[serde(default)]
    pub height: Option<u32>,
}

/// Maps a caller quality token onto a format the engine reported.
///
/// An exact identifier match wins. A `<height>p` token picks the tallest
/// format not exceeding that height. Everything else becomes `"best"`.
pub fn resolve(requested: &str, available: &[FormatDescriptor]) -> String {
    if available.iter().any(|format| format.format_id == requested) {
        return requested.to_string();
    }

    let Some(limit) = parse_height_token(requested) else {
        return BEST_FORMAT.to_string();
    };

    // Reversed so the first listed format wins ties.
    available
        .iter()
        .rev()
        .filter_map(|format| {
            format
                .height
                .filter(|height| *height <= limit)
                .map(|height| (height, format))
        })
        .max_by_key(|(height, _)| *height)
        .map(|(_, format)| format.format_id.clone())
        .unwrap_or_else(|| BEST_FORMAT.to_string())
}

fn parse_height_token(token: &str) -> Option<u32> {
    token.trim().strip_suffix('p')?.parse::<u32>().ok()
}

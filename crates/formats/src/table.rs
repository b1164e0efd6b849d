// Plain-text format listing, eight left-justified columns.

use crate::{Format, human_size_format};

const HEADERS: [&str; 8] = [
    "id",
    "container",
    "resolution",
    "vcodec",
    "vbitrate",
    "acodec",
    "abitrate",
    "size(estimate)",
];

/// Renders the listing table shown to users.
///
/// Formats are sorted ascending by total bitrate; every column is padded to
/// its widest cell.
pub fn render_table(formats: &[Format]) -> String {
    let mut formats: Vec<&Format> = formats.iter().collect();
    formats.sort_by_key(|f| f.total_bitrate());

    let mut widths: [usize; 8] = HEADERS.map(str::len);
    let mut rows = Vec::with_capacity(formats.len());

    for f in formats {
        let row = [
            f.id.clone(),
            f.container.to_string(),
            format!("{}x{}", f.video.width, f.video.height),
            f.video.codec.to_string(),
            format!("{}k", f.video.bitrate / 1024),
            f.audio.codec.to_string(),
            format!("{}k", f.audio.bitrate / 1024),
            human_size_format(f.size_estimate() as f64),
        ];

        for (w, cell) in widths.iter_mut().zip(&row) {
            *w = (*w).max(cell.len());
        }

        rows.push(row);
    }

    let mut out = String::new();

    for (w, h) in widths.iter().zip(HEADERS) {
        out.push_str(h);
        out.extend(std::iter::repeat_n(' ', w - h.len() + 1));
    }
    out.push('\n');

    for row in rows {
        for (w, cell) in widths.iter().zip(&row) {
            out.push_str(cell);
            out.extend(std::iter::repeat_n(' ', w - cell.len() + 1));
        }
        out.push('\n');
    }

    out
}

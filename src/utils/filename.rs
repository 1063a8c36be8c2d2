//! Output file names from templates
//!
//! Templates use `{placeholder}` fields, for example
//! `[{date_custom="M-d-yy"}] {channel} - {title}`. Unknown fields are kept
//! verbatim.

use crate::utils::timecode::format_duration;
use chrono::{DateTime, Utc};

/// Values available to a file name template
#[derive(Debug, Clone, Default)]
pub struct FilenameFields {
    pub title: String,
    pub id: String,
    pub channel: String,
    pub created_at: Option<DateTime<Utc>>,
    pub trim_start: f64,
    /// End of the kept window; `{trim_end}` and `{length}` are blank when unset
    pub trim_end: Option<f64>,
}

/// Expand `template` and strip characters that are invalid in file names
pub fn render_filename(template: &str, fields: &FilenameFields) -> String {
    let mut out = String::with_capacity(template.len());
    let mut rest = template;

    while let Some(open) = rest.find('{') {
        out.push_str(&rest[..open]);
        let after = &rest[open + 1..];
        let Some(close) = after.find('}') else {
            out.push_str(&rest[open..]);
            rest = "";
            break;
        };
        let field = &after[..close];
        match expand_field(field, fields) {
            Some(value) => out.push_str(&value),
            None => {
                out.push('{');
                out.push_str(field);
                out.push('}');
            }
        }
        rest = &after[close + 1..];
    }
    out.push_str(rest);

    sanitize(&out)
}

fn expand_field(field: &str, fields: &FilenameFields) -> Option<String> {
    let value = match field {
        "title" => fields.title.clone(),
        "id" => fields.id.clone(),
        "channel" => fields.channel.clone(),
        "date" => fields
            .created_at
            .map(|d| d.format("%-m-%-d-%y").to_string())
            .unwrap_or_default(),
        "trim_start" => format_duration(fields.trim_start),
        "trim_end" => fields.trim_end.map(format_duration).unwrap_or_default(),
        "length" => fields
            .trim_end
            .map(|end| format_duration((end - fields.trim_start).max(0.0)))
            .unwrap_or_default(),
        _ => {
            let format = field
                .strip_prefix("date_custom=\"")
                .and_then(|f| f.strip_suffix('"'))?;
            fields
                .created_at
                .map(|d| d.format(&custom_to_strftime(format)).to_string())
                .unwrap_or_default()
        }
    };
    Some(value)
}

/// Translate `yyyy-MM-dd HH:mm:ss` style patterns to strftime
fn custom_to_strftime(pattern: &str) -> String {
    const TOKENS: [(&str, &str); 12] = [
        ("yyyy", "%Y"),
        ("yy", "%y"),
        ("MM", "%m"),
        ("M", "%-m"),
        ("dd", "%d"),
        ("d", "%-d"),
        ("HH", "%H"),
        ("H", "%-H"),
        ("hh", "%I"),
        ("mm", "%M"),
        ("ss", "%S"),
        ("%", "%%"),
    ];

    let mut out = String::new();
    let mut rest = pattern;
    'outer: while !rest.is_empty() {
        for (token, replacement) in TOKENS {
            if let Some(tail) = rest.strip_prefix(token) {
                out.push_str(replacement);
                rest = tail;
                continue 'outer;
            }
        }
        let mut chars = rest.chars();
        if let Some(c) = chars.next() {
            out.push(c);
        }
        rest = chars.as_str();
    }
    out
}

fn sanitize(name: &str) -> String {
    name.chars()
        .map(|c| match c {
            '/' | '\\' | ':' | '*' | '?' | '"' | '<' | '>' | '|' => '_',
            c if c.is_control() => '_',
            c => c,
        })
        .collect::<String>()
        .trim()
        .to_string()
}

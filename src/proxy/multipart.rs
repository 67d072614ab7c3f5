//! Multipart upload translation for file and image endpoints.
//!
//! The client's form is parsed from the buffered body and rebuilt as a fresh
//! upstream form. Only fields the endpoint accepts are carried over; file
//! parts keep their field name, file name and content type.

use bytes::Bytes;
use reqwest::multipart::{Form, Part};

#[derive(Debug, thiserror::Error)]
pub enum MultipartError {
    #[error("malformed multipart body: {0}")]
    Malformed(&'static str),

    #[error("invalid part content type: {0}")]
    ContentType(#[from] reqwest::Error),
}

#[derive(Debug, Clone, PartialEq)]
pub struct MultipartPart {
    pub name: String,
    pub filename: Option<String>,
    pub content_type: Option<String>,
    pub data: Bytes,
}

impl MultipartPart {
    pub fn is_file(&self) -> bool {
        self.filename.is_some()
    }

    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.data).into_owned()
    }
}

const FILES_FIELDS: &[&str] = &["file", "purpose"];
const IMAGE_EDIT_FIELDS: &[&str] = &[
    "image",
    "mask",
    "prompt",
    "model",
    "n",
    "size",
    "response_format",
    "user",
];
const IMAGE_VARIATION_FIELDS: &[&str] =
    &["image", "model", "n", "size", "response_format", "user"];
const AUDIO_FIELDS: &[&str] = &[
    "file",
    "model",
    "prompt",
    "response_format",
    "temperature",
    "language",
];

/// Field allow-list for a multipart endpoint, matched on the path suffix.
pub fn allowed_fields(path: &str) -> Option<&'static [&'static str]> {
    let path = path.trim_end_matches('/');
    if path.ends_with("/files") {
        Some(FILES_FIELDS)
    } else if path.ends_with("/images/edits") {
        Some(IMAGE_EDIT_FIELDS)
    } else if path.ends_with("/images/variations") {
        Some(IMAGE_VARIATION_FIELDS)
    } else if path.ends_with("/audio/transcriptions") || path.ends_with("/audio/translations") {
        Some(AUDIO_FIELDS)
    } else {
        None
    }
}

pub fn is_multipart(content_type: &str) -> bool {
    content_type
        .trim_start()
        .to_ascii_lowercase()
        .starts_with("multipart/form-data")
}

fn find_subslice(haystack: &[u8], needle: &[u8], start: usize) -> Option<usize> {
    if needle.is_empty() {
        return Some(start);
    }
    if start >= haystack.len() {
        return None;
    }
    haystack[start..]
        .windows(needle.len())
        .position(|w| w == needle)
        .map(|p| p + start)
}

fn boundary(content_type: &str) -> Option<String> {
    content_type.split(';').map(str::trim).find_map(|part| {
        let (key, value) = part.split_once('=')?;
        if !key.trim().eq_ignore_ascii_case("boundary") {
            return None;
        }
        let value = value.trim();
        let value = value
            .strip_prefix('"')
            .and_then(|v| v.strip_suffix('"'))
            .unwrap_or(value);
        (!value.is_empty()).then(|| value.to_string())
    })
}

fn unquote(value: &str) -> String {
    let value = value.trim();
    value
        .strip_prefix('"')
        .and_then(|v| v.strip_suffix('"'))
        .unwrap_or(value)
        .to_string()
}

/// Skip one line break at `cursor`, if present.
fn skip_newline(bytes: &[u8], cursor: usize) -> usize {
    if bytes.get(cursor..cursor + 2) == Some(b"\r\n") {
        cursor + 2
    } else if bytes.get(cursor..cursor + 1) == Some(b"\n") {
        cursor + 1
    } else {
        cursor
    }
}

pub fn parse_multipart_form(
    content_type: &str,
    body: &Bytes,
) -> Result<Vec<MultipartPart>, MultipartError> {
    let boundary = boundary(content_type).ok_or(MultipartError::Malformed("missing boundary"))?;
    let marker = format!("--{boundary}");
    let delimiter = format!("\r\n{marker}");
    let bytes = body.as_ref();

    let mut cursor = find_subslice(bytes, marker.as_bytes(), 0)
        .ok_or(MultipartError::Malformed("missing boundary marker"))?
        + marker.len();

    let mut parts = Vec::new();
    while bytes.get(cursor..cursor + 2) != Some(b"--") {
        cursor = skip_newline(bytes, cursor);

        let (headers_end, sep) = find_subslice(bytes, b"\r\n\r\n", cursor)
            .map(|i| (i, 4))
            .or_else(|| find_subslice(bytes, b"\n\n", cursor).map(|i| (i, 2)))
            .ok_or(MultipartError::Malformed("part without header separator"))?;

        let headers = String::from_utf8_lossy(&bytes[cursor..headers_end]);
        let mut name = None;
        let mut filename = None;
        let mut part_type = None;
        for line in headers.lines() {
            let Some((key, value)) = line.split_once(':') else {
                continue;
            };
            let value = value.trim();
            if key.trim().eq_ignore_ascii_case("content-disposition") {
                for item in value.split(';').map(str::trim) {
                    if let Some(v) = item.strip_prefix("name=") {
                        name = Some(unquote(v));
                    } else if let Some(v) = item.strip_prefix("filename=") {
                        filename = Some(unquote(v));
                    }
                }
            } else if key.trim().eq_ignore_ascii_case("content-type") && !value.is_empty() {
                part_type = Some(value.to_string());
            }
        }

        let name = name.ok_or(MultipartError::Malformed("part without a name"))?;
        let data_start = headers_end + sep;
        let end = find_subslice(bytes, delimiter.as_bytes(), data_start)
            .ok_or(MultipartError::Malformed("part without trailing boundary"))?;

        parts.push(MultipartPart {
            name,
            filename,
            content_type: part_type,
            data: body.slice(data_start..end),
        });
        cursor = end + delimiter.len();
    }

    Ok(parts)
}

/// Rebuild the allowed parts as an upstream form.
pub fn build_form(parts: &[MultipartPart], allowed: &[&str]) -> Result<Form, MultipartError> {
    let mut form = Form::new();
    for part in parts {
        if !allowed.contains(&part.name.as_str()) {
            tracing::debug!(field = %part.name, "Dropping multipart field not accepted upstream");
            continue;
        }
        if let Some(filename) = &part.filename {
            let mut file = Part::bytes(part.data.to_vec()).file_name(filename.clone());
            if let Some(ct) = &part.content_type {
                file = file.mime_str(ct)?;
            }
            form = form.part(part.name.clone(), file);
        } else {
            form = form.text(part.name.clone(), part.text());
        }
    }
    Ok(form)
}

/// Text value of the first field named `name`.
pub fn field<'a>(parts: &'a [MultipartPart], name: &str) -> Option<&'a MultipartPart> {
    parts.iter().find(|p| p.name == name && !p.is_file())
}

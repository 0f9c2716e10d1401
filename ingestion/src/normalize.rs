use curio_core::model::Modality;
use std::path::Path;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum NormalizeError {
    #[error("invalid UTF-8 content")]
    InvalidUtf8,
    #[error("content extraction failed: {0}")]
    ExtractionFailed(String),
    #[error("unsupported content type: {0}")]
    Unsupported(String),
}

/// Char span of one extracted PDF page within the normalized text.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PageSpan {
    pub page: u32,
    pub char_start: u64,
    pub char_end: u64,
}

#[derive(Debug, Clone)]
pub struct NormalizedText {
    pub text: String,
    pub pages: Vec<PageSpan>,
}

#[derive(Debug, Clone)]
pub struct NormalizedImage {
    pub original: Vec<u8>,
    pub thumbnail: Vec<u8>,
}

/// Modality-normalized content. `canonical_bytes` feed the content hash, so
/// two fetches of the same logical source dedupe at the document level.
#[derive(Debug, Clone)]
pub struct NormalizedContent {
    pub modality: Modality,
    pub text: Option<NormalizedText>,
    pub image: Option<NormalizedImage>,
    pub canonical_bytes: Vec<u8>,
}

/// Resolve the effective modality from the hint, the mime type, and the uri
/// extension, in that order.
pub fn detect_modality(hint: Option<Modality>, mime: Option<&str>, uri: &str) -> Option<Modality> {
    if let Some(modality) = hint {
        return Some(modality);
    }

    if let Some(mime) = mime {
        let mime = mime.split(';').next().unwrap_or("").trim().to_lowercase();
        match mime.as_str() {
            "text/plain" | "text/markdown" | "application/json" => return Some(Modality::Text),
            "application/pdf" => return Some(Modality::Pdf),
            _ if mime.starts_with("image/") => return Some(Modality::Image),
            _ if mime.starts_with("text/") => return Some(Modality::Text),
            _ => {}
        }
    }

    let ext = Path::new(uri)
        .extension()
        .and_then(|e| e.to_str())
        .unwrap_or("")
        .to_lowercase();
    match ext.as_str() {
        "txt" | "md" | "markdown" | "json" => Some(Modality::Text),
        "pdf" => Some(Modality::Pdf),
        "png" | "jpg" | "jpeg" | "webp" => Some(Modality::Image),
        _ => None,
    }
}

pub fn normalize(
    modality: Modality,
    bytes: &[u8],
    thumbnail_max_edge: u32,
) -> Result<NormalizedContent, NormalizeError> {
    match modality {
        Modality::Text => {
            let raw = String::from_utf8(bytes.to_vec()).map_err(|_| NormalizeError::InvalidUtf8)?;
            let text = canonicalize_whitespace(&raw);
            Ok(NormalizedContent {
                modality,
                canonical_bytes: text.as_bytes().to_vec(),
                text: Some(NormalizedText {
                    text,
                    pages: Vec::new(),
                }),
                image: None,
            })
        }
        Modality::Pdf => {
            let extracted = pdf_extract::extract_text_from_mem(bytes)
                .map_err(|err| NormalizeError::ExtractionFailed(err.to_string()))?;
            if extracted.trim().is_empty() {
                return Err(NormalizeError::ExtractionFailed(
                    "pdf produced no text".to_string(),
                ));
            }
            let (text, pages) = paginate(&extracted);
            Ok(NormalizedContent {
                modality,
                // The source bytes are canonical for PDFs; text extraction is
                // lossy and layout-dependent.
                canonical_bytes: bytes.to_vec(),
                text: Some(NormalizedText { text, pages }),
                image: None,
            })
        }
        Modality::Image => {
            let decoded = image::load_from_memory(bytes)
                .map_err(|err| NormalizeError::ExtractionFailed(err.to_string()))?;
            let thumbnail = decoded.thumbnail(thumbnail_max_edge, thumbnail_max_edge);
            let mut out = Vec::new();
            thumbnail
                .write_to(&mut std::io::Cursor::new(&mut out), image::ImageFormat::Png)
                .map_err(|err| NormalizeError::ExtractionFailed(err.to_string()))?;

            Ok(NormalizedContent {
                modality,
                canonical_bytes: bytes.to_vec(),
                text: None,
                image: Some(NormalizedImage {
                    original: bytes.to_vec(),
                    thumbnail: out,
                }),
            })
        }
    }
}

/// Collapse horizontal whitespace runs, normalize line endings, and bound
/// consecutive blank lines so hash-identical content hashes identically.
fn canonicalize_whitespace(raw: &str) -> String {
    let mut lines: Vec<String> = Vec::new();
    for line in raw.replace("\r\n", "\n").replace('\r', "\n").split('\n') {
        let collapsed = line.split_whitespace().collect::<Vec<_>>().join(" ");
        lines.push(collapsed);
    }

    let mut out = String::new();
    let mut blank_run = 0;
    for line in lines {
        if line.is_empty() {
            blank_run += 1;
            if blank_run > 1 {
                continue;
            }
        } else {
            blank_run = 0;
        }
        if !out.is_empty() {
            out.push('\n');
        }
        out.push_str(&line);
    }
    out.trim().to_string()
}

/// PDF extractors emit form feeds between pages; map them to page spans over
/// a single concatenated text.
fn paginate(extracted: &str) -> (String, Vec<PageSpan>) {
    let mut text = String::new();
    let mut pages = Vec::new();
    let mut char_cursor: u64 = 0;

    for (index, raw_page) in extracted.split('\u{c}').enumerate() {
        let page_text = canonicalize_whitespace(raw_page);
        if page_text.is_empty() {
            continue;
        }
        if !text.is_empty() {
            text.push('\n');
            char_cursor += 1;
        }
        let start = char_cursor;
        let chars = page_text.chars().count() as u64;
        text.push_str(&page_text);
        char_cursor += chars;
        pages.push(PageSpan {
            page: index as u32 + 1,
            char_start: start,
            char_end: char_cursor,
        });
    }

    (text, pages)
}

/// Page lookup for a chunk's starting offset.
pub fn page_for_offset(pages: &[PageSpan], char_start: u64) -> Option<u32> {
    pages
        .iter()
        .find(|span| char_start >= span.char_start && char_start < span.char_end)
        .or_else(|| pages.last().filter(|span| char_start >= span.char_start))
        .map(|span| span.page)
}

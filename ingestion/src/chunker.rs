use crate::normalize::{page_for_offset, PageSpan};
use text_splitter::TextSplitter;

/// One window of normalized text, with char offsets into the source and the
/// page it starts on (PDF only).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChunkPiece {
    pub ordinal: u32,
    pub text: String,
    pub char_start: u64,
    pub char_end: u64,
    pub page: Option<u32>,
}

/// Boundary-aware windows via text-splitter, then each window's start is
/// pulled back by `overlap_chars` so neighboring chunks share context.
pub struct WindowChunker {
    max_chars: usize,
    overlap_chars: usize,
}

impl WindowChunker {
    pub fn new(max_chars: usize, overlap_chars: usize) -> Self {
        let max_chars = max_chars.max(1);
        Self {
            max_chars,
            overlap_chars: overlap_chars.min(max_chars.saturating_sub(1)),
        }
    }

    pub fn chunk(&self, text: &str, pages: &[PageSpan]) -> Vec<ChunkPiece> {
        if text.is_empty() {
            return Vec::new();
        }

        let splitter = TextSplitter::default().with_trim_chunks(true);
        let windows: Vec<&str> = splitter.chunks(text, self.max_chars).collect();

        let mut pieces = Vec::new();
        let mut byte_cursor = 0usize;
        let mut char_cursor = 0u64;

        for (index, window) in windows.into_iter().enumerate() {
            if window.is_empty() {
                continue;
            }

            // Windows come back in order as slices of `text`; find this one
            // starting from the cursor and convert byte to char offsets
            // incrementally.
            let window_byte = match text[byte_cursor..].find(window) {
                Some(relative) => byte_cursor + relative,
                None => continue,
            };
            let chars_between = text[byte_cursor..window_byte].chars().count() as u64;
            let window_char_start = char_cursor + chars_between;
            let window_chars = window.chars().count() as u64;

            byte_cursor = window_byte + window.len();
            char_cursor = window_char_start + window_chars;

            let (start_char, start_byte) = if index == 0 || self.overlap_chars == 0 {
                (window_char_start, window_byte)
            } else {
                pull_back(text, window_byte, window_char_start, self.overlap_chars)
            };

            pieces.push(ChunkPiece {
                ordinal: pieces.len() as u32,
                text: text[start_byte..window_byte + window.len()].to_string(),
                char_start: start_char,
                char_end: window_char_start + window_chars,
                page: page_for_offset(pages, window_char_start),
            });
        }

        pieces
    }
}

fn pull_back(text: &str, byte_offset: usize, char_offset: u64, overlap: usize) -> (u64, usize) {
    let mut byte = byte_offset;
    let mut stepped = 0u64;
    for (index, _) in text[..byte_offset].char_indices().rev().take(overlap) {
        byte = index;
        stepped += 1;
    }
    (char_offset - stepped, byte)
}

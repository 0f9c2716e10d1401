use std::collections::HashMap;

const K1: f32 = 1.2;
const B: f32 = 0.75;

/// Inverted index with BM25 scoring, one partition per container.
pub struct Bm25Index {
    postings: HashMap<String, HashMap<String, u32>>, // term -> doc id -> tf
    doc_lengths: HashMap<String, u32>,
    total_length: u64,
}

impl Bm25Index {
    pub fn new() -> Self {
        Self {
            postings: HashMap::new(),
            doc_lengths: HashMap::new(),
            total_length: 0,
        }
    }

    pub fn insert(&mut self, id: impl Into<String>, text: &str) {
        let id = id.into();
        self.remove(&id);

        let tokens = tokenize(text);
        if tokens.is_empty() {
            return;
        }

        let length = tokens.len() as u32;
        for token in tokens {
            *self
                .postings
                .entry(token)
                .or_default()
                .entry(id.clone())
                .or_insert(0) += 1;
        }
        self.doc_lengths.insert(id, length);
        self.total_length += length as u64;
    }

    pub fn remove(&mut self, id: &str) -> bool {
        let Some(length) = self.doc_lengths.remove(id) else {
            return false;
        };
        self.total_length -= length as u64;

        self.postings.retain(|_, docs| {
            docs.remove(id);
            !docs.is_empty()
        });
        true
    }

    pub fn contains(&self, id: &str) -> bool {
        self.doc_lengths.contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.doc_lengths.len()
    }

    pub fn is_empty(&self) -> bool {
        self.doc_lengths.is_empty()
    }

    /// Top-k BM25 scores for the query. Ties break by id ascending so the
    /// ordering is stable for identical inputs.
    pub fn search(&self, query: &str, k: usize) -> Vec<(String, f32)> {
        let n = self.doc_lengths.len() as f32;
        if n == 0.0 {
            return Vec::new();
        }
        let avg_len = self.total_length as f32 / n;

        let mut scores: HashMap<&str, f32> = HashMap::new();
        for term in tokenize(query) {
            let Some(docs) = self.postings.get(&term) else {
                continue;
            };
            let df = docs.len() as f32;
            let idf = ((n - df + 0.5) / (df + 0.5) + 1.0).ln();

            for (id, tf) in docs {
                let len = *self.doc_lengths.get(id).unwrap_or(&0) as f32;
                let tf = *tf as f32;
                let denom = tf + K1 * (1.0 - B + B * len / avg_len.max(1.0));
                *scores.entry(id.as_str()).or_insert(0.0) += idf * (tf * (K1 + 1.0)) / denom;
            }
        }

        let mut out: Vec<(String, f32)> = scores
            .into_iter()
            .map(|(id, score)| (id.to_string(), score))
            .collect();
        out.sort_by(|a, b| {
            b.1.partial_cmp(&a.1)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| a.0.cmp(&b.0))
        });
        out.truncate(k);
        out
    }
}

impl Default for Bm25Index {
    fn default() -> Self {
        Self::new()
    }
}

/// Lowercased alphanumeric tokens; non-ascii tokens additionally contribute
/// character bigrams so CJK text stays searchable.
pub fn tokenize(text: &str) -> Vec<String> {
    let mut out = Vec::new();
    let mut buffer = String::new();

    for ch in text.chars().flat_map(|ch| ch.to_lowercase()) {
        if ch.is_alphanumeric() || ch == '_' {
            buffer.push(ch);
        } else if !buffer.is_empty() {
            push_token(&mut out, std::mem::take(&mut buffer));
        }
    }
    if !buffer.is_empty() {
        push_token(&mut out, buffer);
    }

    out
}

fn push_token(out: &mut Vec<String>, token: String) {
    if !token.is_ascii() {
        let chars: Vec<char> = token.chars().collect();
        if chars.len() > 2 {
            for window in chars.windows(2) {
                out.push(window.iter().collect());
            }
        }
    }
    out.push(token);
}

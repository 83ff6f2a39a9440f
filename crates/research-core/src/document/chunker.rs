use crate::utils::error::{CoreError, CoreResult};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Chunk {
    pub index: usize,
    pub content: String,
    /// Char offsets into the source text.
    pub start_pos: usize,
    pub end_pos: usize,
}

/// Fixed-size character windows with overlap.
#[derive(Debug, Clone)]
pub struct TextChunker {
    chunk_size: usize,
    overlap: usize,
}

impl TextChunker {
    pub fn new(chunk_size: usize, overlap: usize) -> CoreResult<Self> {
        if chunk_size == 0 || overlap >= chunk_size {
            return Err(CoreError::Validation(format!(
                "chunk overlap ({}) must be smaller than chunk size ({})",
                overlap, chunk_size
            )));
        }
        Ok(Self {
            chunk_size,
            overlap,
        })
    }

    pub fn chunk(&self, text: &str) -> Vec<Chunk> {
        let mut chunks = Vec::new();
        let chars: Vec<char> = text.chars().collect();
        let total_len = chars.len();

        let mut start = 0;
        while start < total_len {
            let end = std::cmp::min(start + self.chunk_size, total_len);

            chunks.push(Chunk {
                index: chunks.len(),
                content: chars[start..end].iter().collect(),
                start_pos: start,
                end_pos: end,
            });

            if end >= total_len {
                break;
            }

            start += self.chunk_size - self.overlap;
        }

        chunks
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_overlapping_windows() {
        let chunker = TextChunker::new(4, 1).unwrap();
        let chunks = chunker.chunk("abcdefghij");

        let parts: Vec<_> = chunks.iter().map(|c| c.content.as_str()).collect();
        assert_eq!(parts, vec!["abcd", "defg", "ghij"]);
        assert_eq!(chunks[2].index, 2);
        assert_eq!((chunks[1].start_pos, chunks[1].end_pos), (3, 7));
    }

    #[test]
    fn test_empty_and_short_text() {
        let chunker = TextChunker::new(10, 2).unwrap();
        assert!(chunker.chunk("").is_empty());
        assert_eq!(chunker.chunk("short").len(), 1);
    }

    #[test]
    fn test_rejects_overlap_not_below_size() {
        assert!(TextChunker::new(5, 5).is_err());
        assert!(TextChunker::new(0, 0).is_err());
    }
}

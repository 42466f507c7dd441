/// Encoded output of tokenizers.
#[derive(Debug, Clone, Default)]
pub struct PiecesWithIds {
    /// Piece identifiers of each input sequence.
    pub ids: Vec<Vec<u32>>,
    /// Piece strings of each input sequence.
    pub pieces: Vec<Vec<String>>,
}

impl PiecesWithIds {
    /// Number of encoded sequences.
    pub fn len(&self) -> usize {
        self.ids.len()
    }

    /// Check if no sequences were encoded.
    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }

    /// Concatenate the piece identifiers of all sequences.
    ///
    /// * separator - Piece identifier placed after every sequence,
    ///   typically the end-of-sequence piece.
    pub fn into_stream(self, separator: Option<u32>) -> Vec<u32> {
        let mut stream = Vec::with_capacity(
            self.ids.iter().map(Vec::len).sum::<usize>() + separator.map_or(0, |_| self.len()),
        );
        for ids in self.ids {
            stream.extend(ids);
            stream.extend(separator);
        }
        stream
    }
}

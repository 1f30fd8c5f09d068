/// Terminating zero-length chunk with an empty trailer.
pub const LAST_CHUNK: &[u8] = b"0\r\n\r\n";

/// Collects the segments of a chunked response as they stream past.
///
/// The first segment is the header buffer; every later segment is kept in
/// arrival order so the cache can replay them byte for byte.
#[derive(Debug)]
pub struct ChunkAssembler {
    header: Vec<u8>,
    chunks: Vec<Vec<u8>>,
    complete: bool,
}

impl ChunkAssembler {
    pub fn new(header: Vec<u8>) -> Self {
        let complete = is_last_segment(&header);
        Self {
            header,
            chunks: Vec::new(),
            complete,
        }
    }

    /// Appends a segment, returning true once the terminal chunk has arrived.
    pub fn push(&mut self, segment: &[u8]) -> bool {
        if self.complete {
            return true;
        }
        self.chunks.push(segment.to_vec());
        self.complete = is_last_segment(segment);
        self.complete
    }

    pub fn is_complete(&self) -> bool {
        self.complete
    }

    pub fn buffered(&self) -> usize {
        self.header.len() + self.chunks.iter().map(Vec::len).sum::<usize>()
    }

    pub fn into_parts(self) -> (Vec<u8>, Vec<Vec<u8>>) {
        (self.header, self.chunks)
    }
}

pub fn is_last_segment(segment: &[u8]) -> bool {
    segment.ends_with(LAST_CHUNK)
}

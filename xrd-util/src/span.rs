//! Partitioning of an array into mostly equal pieces, used to frame large
//! lists into stream-sized chunks.

/// Half-open index range `[start, end)` into a list.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Span {
    pub start: usize,
    pub end: usize,
}

impl Span {
    pub fn len(&self) -> usize {
        self.end - self.start
    }

    pub fn is_empty(&self) -> bool {
        self.start == self.end
    }
}

/// Split `n` elements into consecutive spans of at most `size` elements.
pub fn with_size(n: usize, size: usize) -> Vec<Span> {
    if n == 0 || size == 0 {
        return Vec::new();
    }
    let mut spans = Vec::with_capacity(n.div_ceil(size));
    let mut start = 0;
    while start < n {
        let end = usize::min(start + size, n);
        spans.push(Span { start, end });
        start = end;
    }
    spans
}

/// Split `n` elements into `num` consecutive spans whose sizes differ by at
/// most one. If `n < num`, only `n` spans are produced.
pub fn n_spans(n: usize, num: usize) -> Vec<Span> {
    let num = usize::min(num, n);
    if num == 0 {
        return Vec::new();
    }
    let size = n / num;
    let rem = n % num;
    let mut spans = Vec::with_capacity(num);
    let mut end = 0;
    for i in 0..num {
        let start = end;
        end = start + size + usize::from(i < rem);
        spans.push(Span { start, end });
    }
    spans
}

/// Chunk `n` messages of `msg_size` bytes each so that every chunk stays
/// under `stream_size` bytes. At least one message per chunk.
pub fn stream_spans(n: usize, stream_size: usize, msg_size: usize) -> Vec<Span> {
    let per_span = usize::max(1, stream_size / usize::max(1, msg_size));
    with_size(n, per_span)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn spans_cover_without_overlap() {
        for n in [0, 1, 7, 100, 1001] {
            for size in [1, 3, 100] {
                let spans = with_size(n, size);
                let mut next = 0;
                for s in &spans {
                    assert_eq!(s.start, next);
                    assert!(s.len() <= size && !s.is_empty());
                    next = s.end;
                }
                assert_eq!(next, n);
            }
        }
    }

    #[test]
    fn n_spans_balanced() {
        let spans = n_spans(10, 3);
        assert_eq!(spans.len(), 3);
        let sizes: Vec<_> = spans.iter().map(Span::len).collect();
        assert_eq!(sizes, vec![4, 3, 3]);

        // fewer elements than requested spans
        assert_eq!(n_spans(2, 5).len(), 2);
    }

    #[test]
    fn stream_spans_bound_chunk_bytes() {
        let spans = stream_spans(100, 1024, 100);
        for s in &spans {
            assert!(s.len() * 100 <= 1024);
        }
        // oversized messages still go one per chunk
        assert_eq!(stream_spans(3, 16, 64).len(), 3);
    }
}

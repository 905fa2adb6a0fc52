//! Fixed-size batching for lazy sequences
//!
//! Every stage that writes or embeds nodes groups its input with these
//! adapters instead of carrying its own buffer state. Both adapters consume
//! their source exactly once.

use futures::stream::{BoxStream, Stream, StreamExt};

/// Iterator adapter yielding `Vec`s of at most `size` items
pub struct Batched<I: Iterator> {
    inner: I,
    size: usize,
}

impl<I: Iterator> Iterator for Batched<I> {
    type Item = Vec<I::Item>;

    fn next(&mut self) -> Option<Self::Item> {
        let mut batch = Vec::with_capacity(self.size);
        for item in self.inner.by_ref() {
            batch.push(item);
            if batch.len() == self.size {
                break;
            }
        }
        if batch.is_empty() {
            None
        } else {
            Some(batch)
        }
    }
}

/// Group an iterator into batches of at most `size` items
///
/// A `size` of zero is treated as one.
pub fn batched<I: IntoIterator>(iter: I, size: usize) -> Batched<I::IntoIter> {
    Batched {
        inner: iter.into_iter(),
        size: size.max(1),
    }
}

/// Group a stream into batches of at most `size` items
pub fn batched_stream<'a, S>(stream: S, size: usize) -> BoxStream<'a, Vec<S::Item>>
where
    S: Stream + Send + 'a,
    S::Item: Send + 'a,
{
    stream.chunks(size.max(1)).boxed()
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::stream;

    #[test]
    fn test_batched_uneven_tail() {
        let batches: Vec<Vec<u32>> = batched(0..7, 3).collect();
        assert_eq!(batches, vec![vec![0, 1, 2], vec![3, 4, 5], vec![6]]);
    }

    #[test]
    fn test_batched_empty_and_zero_size() {
        assert_eq!(batched(Vec::<u8>::new(), 4).count(), 0);
        assert_eq!(batched(0..3, 0).count(), 3);
    }

    #[tokio::test]
    async fn test_batched_stream() {
        let batches: Vec<Vec<u32>> = batched_stream(stream::iter(0..5), 2).collect().await;
        assert_eq!(batches, vec![vec![0, 1], vec![2, 3], vec![4]]);
    }
}

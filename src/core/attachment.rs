//! Purpose: Encode ordered key/value byte pairs into one opaque attachment blob and back.
//! Exports: `Attachment`, `Pairs`, `PairConsumer`, `ExpectedPairs`.
//! Role: Shared by puts, queries and replies; the blob travels untouched through transports.
//! Invariants: Pair order is preserved exactly; arbitrary bytes (empty, NUL) round-trip.
//! Invariants: A blob is a varint pair count followed by varint-length-prefixed keys/values.
//! Invariants: Truncated or over-long blobs fail with `CorruptAttachment`, never a short result.
use crate::core::error::{Error, ErrorKind};
use bytes::{BufMut, Bytes, BytesMut};
use std::fmt;

const MAX_VARINT_LEN: usize = 10;

#[derive(Clone, Eq, PartialEq)]
pub struct Attachment {
    bytes: Bytes,
}

impl Attachment {
    /// Encodes every pair the producer yields; exhaustion ends the sequence.
    pub fn encode<I, K, V>(pairs: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: AsRef<[u8]>,
        V: AsRef<[u8]>,
    {
        let mut body = BytesMut::new();
        let mut count: u64 = 0;
        for (key, value) in pairs {
            put_chunk(&mut body, key.as_ref());
            put_chunk(&mut body, value.as_ref());
            count += 1;
        }

        let mut out = BytesMut::with_capacity(body.len() + MAX_VARINT_LEN);
        put_varint(&mut out, count);
        out.put(body);
        Self {
            bytes: out.freeze(),
        }
    }

    pub fn empty() -> Self {
        Self::encode(std::iter::empty::<(&[u8], &[u8])>())
    }

    /// Wraps a received blob without validating it; decoding reports corruption.
    pub fn from_bytes(bytes: impl Into<Bytes>) -> Self {
        Self {
            bytes: bytes.into(),
        }
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }

    pub fn into_bytes(self) -> Bytes {
        self.bytes
    }

    pub fn iter(&self) -> Pairs<'_> {
        Pairs::new(&self.bytes)
    }

    /// Number of pairs, after validating the whole blob.
    pub fn pair_count(&self) -> Result<usize, Error> {
        let mut count = 0;
        for pair in self.iter() {
            pair?;
            count += 1;
        }
        Ok(count)
    }

    /// Feeds every pair to `consumer` in encoding order.
    ///
    /// The blob is validated before the first pair is handed out. The first
    /// consumer error stops decoding and is returned unchanged.
    pub fn decode<C: PairConsumer + ?Sized>(&self, consumer: &mut C) -> Result<usize, Error> {
        let count = self.pair_count()?;
        for pair in self.iter() {
            let (key, value) = pair?;
            consumer.consume(key, value)?;
        }
        Ok(count)
    }

    pub fn to_pairs(&self) -> Result<Vec<(Bytes, Bytes)>, Error> {
        let mut pairs = Vec::new();
        for pair in self.iter() {
            let (key, value) = pair?;
            pairs.push((
                self.bytes.slice_ref(key),
                self.bytes.slice_ref(value),
            ));
        }
        Ok(pairs)
    }
}

impl<K, V> FromIterator<(K, V)> for Attachment
where
    K: AsRef<[u8]>,
    V: AsRef<[u8]>,
{
    fn from_iter<T: IntoIterator<Item = (K, V)>>(iter: T) -> Self {
        Attachment::encode(iter)
    }
}

impl fmt::Debug for Attachment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut list = f.debug_list();
        for pair in self.iter() {
            match pair {
                Ok((key, value)) => {
                    list.entry(&(
                        String::from_utf8_lossy(key),
                        String::from_utf8_lossy(value),
                    ));
                }
                Err(_) => {
                    list.entry(&"<corrupt>");
                    break;
                }
            }
        }
        list.finish()
    }
}

/// Lazy pair iterator; yields one `Err` on corruption and then stops.
pub struct Pairs<'a> {
    buf: &'a [u8],
    pos: usize,
    remaining: Option<u64>,
    failed: bool,
}

impl<'a> Pairs<'a> {
    fn new(buf: &'a [u8]) -> Self {
        Self {
            buf,
            pos: 0,
            remaining: None,
            failed: false,
        }
    }

    fn step(&mut self) -> Result<Option<(&'a [u8], &'a [u8])>, Error> {
        let remaining = match self.remaining {
            Some(remaining) => remaining,
            None => {
                let count = self.read_varint()?;
                self.remaining = Some(count);
                count
            }
        };
        if remaining == 0 {
            if self.pos != self.buf.len() {
                return Err(corrupt("trailing bytes after last pair", self.pos));
            }
            return Ok(None);
        }
        let key = self.read_chunk()?;
        let value = self.read_chunk()?;
        self.remaining = Some(remaining - 1);
        Ok(Some((key, value)))
    }

    fn read_varint(&mut self) -> Result<u64, Error> {
        let mut value: u64 = 0;
        for index in 0..MAX_VARINT_LEN {
            let Some(&byte) = self.buf.get(self.pos) else {
                return Err(corrupt("truncated length prefix", self.pos));
            };
            self.pos += 1;
            let bits = u64::from(byte & 0x7f);
            if index == MAX_VARINT_LEN - 1 && byte > 1 {
                return Err(corrupt("length prefix overflows u64", self.pos));
            }
            value |= bits << (7 * index);
            if byte & 0x80 == 0 {
                return Ok(value);
            }
        }
        Err(corrupt("length prefix is too long", self.pos))
    }

    fn read_chunk(&mut self) -> Result<&'a [u8], Error> {
        let len = self.read_varint()?;
        let available = (self.buf.len() - self.pos) as u64;
        if len > available {
            return Err(corrupt("truncated pair", self.pos));
        }
        let buf = self.buf;
        let start = self.pos;
        self.pos += len as usize;
        Ok(&buf[start..self.pos])
    }
}

impl<'a> Iterator for Pairs<'a> {
    type Item = Result<(&'a [u8], &'a [u8]), Error>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.failed {
            return None;
        }
        match self.step() {
            Ok(Some(pair)) => Some(Ok(pair)),
            Ok(None) => None,
            Err(err) => {
                self.failed = true;
                Some(Err(err))
            }
        }
    }
}

/// Receives decoded pairs; returning an error aborts decoding.
pub trait PairConsumer {
    fn consume(&mut self, key: &[u8], value: &[u8]) -> Result<(), Error>;
}

impl<F> PairConsumer for F
where
    F: FnMut(&[u8], &[u8]) -> Result<(), Error>,
{
    fn consume(&mut self, key: &[u8], value: &[u8]) -> Result<(), Error> {
        self(key, value)
    }
}

/// Checks decoded pairs against an exact expected sequence.
#[derive(Debug)]
pub struct ExpectedPairs<'a> {
    expected: &'a [(&'a [u8], &'a [u8])],
    seen: usize,
}

impl<'a> ExpectedPairs<'a> {
    pub fn new(expected: &'a [(&'a [u8], &'a [u8])]) -> Self {
        Self { expected, seen: 0 }
    }

    pub fn seen(&self) -> usize {
        self.seen
    }

    /// Fails if fewer pairs were consumed than expected.
    pub fn finish(&self) -> Result<(), Error> {
        if self.seen != self.expected.len() {
            return Err(Error::new(ErrorKind::AttachmentMismatch).with_message(format!(
                "attachment has {} pairs, expected {}",
                self.seen,
                self.expected.len()
            )));
        }
        Ok(())
    }
}

impl PairConsumer for ExpectedPairs<'_> {
    fn consume(&mut self, key: &[u8], value: &[u8]) -> Result<(), Error> {
        let Some((expected_key, expected_value)) = self.expected.get(self.seen) else {
            return Err(Error::new(ErrorKind::AttachmentMismatch)
                .with_message("attachment contains more pairs than expected"));
        };
        if key != *expected_key {
            return Err(Error::new(ErrorKind::AttachmentMismatch).with_message(format!(
                "unexpected key at pair {}: {:?}",
                self.seen,
                String::from_utf8_lossy(key)
            )));
        }
        if value != *expected_value {
            return Err(Error::new(ErrorKind::AttachmentMismatch).with_message(format!(
                "unexpected value for key {:?}",
                String::from_utf8_lossy(key)
            )));
        }
        self.seen += 1;
        Ok(())
    }
}

fn put_chunk(buf: &mut BytesMut, chunk: &[u8]) {
    put_varint(buf, chunk.len() as u64);
    buf.put_slice(chunk);
}

fn put_varint(buf: &mut BytesMut, mut value: u64) {
    while value >= 0x80 {
        buf.put_u8((value as u8) | 0x80);
        value >>= 7;
    }
    buf.put_u8(value as u8);
}

fn corrupt(message: &str, offset: usize) -> Error {
    Error::new(ErrorKind::CorruptAttachment).with_message(format!("{message} at byte {offset}"))
}

#[cfg(test)]
mod tests {
    use super::{Attachment, ExpectedPairs};
    use crate::core::error::{Error, ErrorKind};

    fn sample_pairs() -> Vec<(Vec<u8>, Vec<u8>)> {
        vec![
            (b"k_const".to_vec(), b"v const".to_vec()),
            (b"k_var".to_vec(), b"test_value_1".to_vec()),
            (Vec::new(), Vec::new()),
            (b"nul\0key".to_vec(), vec![0, 0, 255, 0]),
            (vec![b'x'; 300], vec![7; 20_000]),
        ]
    }

    #[test]
    fn pairs_survive_encoding_in_order() {
        let pairs = sample_pairs();
        let attachment = Attachment::encode(pairs.iter().map(|(k, v)| (k, v)));
        let decoded: Vec<(Vec<u8>, Vec<u8>)> = attachment
            .to_pairs()
            .expect("decode")
            .into_iter()
            .map(|(k, v)| (k.to_vec(), v.to_vec()))
            .collect();
        assert_eq!(decoded, pairs);
        assert_eq!(attachment.pair_count().expect("count"), pairs.len());
    }

    #[test]
    fn zero_pairs_is_a_valid_blob() {
        let attachment = Attachment::empty();
        assert_eq!(attachment.as_bytes(), &[0u8]);
        assert_eq!(attachment.pair_count().expect("count"), 0);
        let mut calls = 0;
        let decoded = attachment
            .decode(&mut |_: &[u8], _: &[u8]| -> Result<(), Error> {
                calls += 1;
                Ok(())
            })
            .expect("decode");
        assert_eq!(decoded, 0);
        assert_eq!(calls, 0);
    }

    #[test]
    fn every_truncation_is_corrupt() {
        let pairs = sample_pairs();
        let full = Attachment::encode(pairs.iter().map(|(k, v)| (k, v)));
        let bytes = full.as_bytes();
        for cut in 1..=bytes.len() {
            let truncated = Attachment::from_bytes(bytes[..bytes.len() - cut].to_vec());
            let err = truncated.pair_count().expect_err("truncated");
            assert_eq!(err.kind(), ErrorKind::CorruptAttachment, "cut {cut}");
        }
    }

    #[test]
    fn truncated_empty_blob_is_corrupt() {
        let err = Attachment::from_bytes(Vec::new())
            .pair_count()
            .expect_err("empty");
        assert_eq!(err.kind(), ErrorKind::CorruptAttachment);
    }

    #[test]
    fn trailing_bytes_are_corrupt() {
        let mut bytes = Attachment::encode([("a", "b")]).as_bytes().to_vec();
        bytes.push(0);
        let err = Attachment::from_bytes(bytes).to_pairs().expect_err("trailing");
        assert_eq!(err.kind(), ErrorKind::CorruptAttachment);
    }

    #[test]
    fn oversized_varint_is_corrupt() {
        let bytes = vec![0xffu8; 11];
        let err = Attachment::from_bytes(bytes).pair_count().expect_err("varint");
        assert_eq!(err.kind(), ErrorKind::CorruptAttachment);
    }

    #[test]
    fn corrupt_blob_never_reaches_the_consumer() {
        let full = Attachment::encode([("k1", "v1"), ("k2", "v2")]);
        let bytes = full.as_bytes();
        let truncated = Attachment::from_bytes(bytes[..bytes.len() - 1].to_vec());
        let mut seen = Vec::new();
        let err = truncated
            .decode(&mut |key: &[u8], _: &[u8]| -> Result<(), Error> {
                seen.push(key.to_vec());
                Ok(())
            })
            .expect_err("corrupt");
        assert_eq!(err.kind(), ErrorKind::CorruptAttachment);
        assert!(seen.is_empty());
    }

    #[test]
    fn consumer_error_aborts_decoding() {
        let attachment = Attachment::encode([("a", "1"), ("b", "2"), ("c", "3")]);
        let mut seen = 0;
        let err = attachment
            .decode(&mut |_: &[u8], _: &[u8]| -> Result<(), Error> {
                seen += 1;
                if seen == 2 {
                    return Err(Error::new(ErrorKind::Usage).with_message("stop"));
                }
                Ok(())
            })
            .expect_err("abort");
        assert_eq!(err.kind(), ErrorKind::Usage);
        assert_eq!(seen, 2);
    }

    #[test]
    fn expected_pairs_accepts_exact_match() {
        let attachment = Attachment::encode([("k_const", "v const")]);
        let expected: [(&[u8], &[u8]); 1] = [(b"k_const", b"v const")];
        let mut check = ExpectedPairs::new(&expected);
        attachment.decode(&mut check).expect("decode");
        check.finish().expect("complete");
        assert_eq!(check.seen(), 1);
    }

    #[test]
    fn expected_pairs_rejects_extra_and_missing_pairs() {
        let expected: [(&[u8], &[u8]); 1] = [(b"k_const", b"v const")];

        let extra = Attachment::encode([("k_const", "v const"), ("k_var", "x")]);
        let mut check = ExpectedPairs::new(&expected);
        let err = extra.decode(&mut check).expect_err("extra");
        assert_eq!(err.kind(), ErrorKind::AttachmentMismatch);

        let missing = Attachment::empty();
        let mut check = ExpectedPairs::new(&expected);
        missing.decode(&mut check).expect("decode");
        assert_eq!(
            check.finish().expect_err("missing").kind(),
            ErrorKind::AttachmentMismatch
        );

        let wrong = Attachment::encode([("k_const", "other")]);
        let mut check = ExpectedPairs::new(&expected);
        let err = wrong.decode(&mut check).expect_err("wrong");
        assert_eq!(err.kind(), ErrorKind::AttachmentMismatch);
    }

    #[test]
    fn debug_renders_pairs() {
        let attachment: Attachment = [("a", "b")].into_iter().collect();
        assert_eq!(format!("{attachment:?}"), "[(\"a\", \"b\")]");
    }
}

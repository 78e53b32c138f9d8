//! The ed2k file hash: MD4 over fixed-size parts, then MD4 over the
//! concatenated part digests.
//!
//! A file of `n` parts where `n = size / PART_SIZE + 1` hashes to the MD4
//! of the concatenation of the `n` part digests; a single-part file hashes
//! to that part's MD4 directly. The `+ 1` means a file whose size is an
//! exact multiple of [`PART_SIZE`] contributes a trailing *empty* part.
//! That is the identity the network has always used, so it is preserved
//! here, not corrected.

use std::io::Read;

use md4::{Digest, Md4};

/// Primary file subdivision: 9500 KiB.
pub const PART_SIZE: u64 = 9_728_000;

/// A 16-byte ed2k file identifier.
pub type Ed2kHash = [u8; 16];

/// Streaming ed2k hasher. Feed chunks of any size with [`update`], then
/// take the file hash with [`finish`].
///
/// [`update`]: Ed2kHasher::update
/// [`finish`]: Ed2kHasher::finish
pub struct Ed2kHasher {
    part: Md4,
    part_len: u64,
    digests: Vec<u8>,
}

impl Ed2kHasher {
    pub fn new() -> Self {
        Self {
            part: Md4::new(),
            part_len: 0,
            digests: Vec::new(),
        }
    }

    /// Absorbs the next chunk of the stream.
    pub fn update(&mut self, mut data: &[u8]) {
        while !data.is_empty() {
            let room = (PART_SIZE - self.part_len) as usize;
            let take = room.min(data.len());
            self.part.update(&data[..take]);
            self.part_len += take as u64;
            data = &data[take..];

            // A full part is sealed immediately; the stream continuing (or
            // ending) decides whether the next part stays empty.
            if self.part_len == PART_SIZE {
                let digest = self.part.finalize_reset();
                self.digests.extend_from_slice(&digest);
                self.part_len = 0;
            }
        }
    }

    /// Seals the final part, which is empty whenever the stream length is
    /// an exact multiple of [`PART_SIZE`], and returns the file hash.
    pub fn finish(mut self) -> Ed2kHash {
        let last = self.part.finalize();
        self.digests.extend_from_slice(&last);

        if self.digests.len() == 16 {
            self.digests.try_into().expect("one 16-byte digest")
        } else {
            Md4::digest(&self.digests).into()
        }
    }
}

impl Default for Ed2kHasher {
    fn default() -> Self {
        Self::new()
    }
}

/// Hashes an in-memory buffer.
pub fn hash_bytes(data: &[u8]) -> Ed2kHash {
    let mut hasher = Ed2kHasher::new();
    hasher.update(data);
    hasher.finish()
}

/// Hashes a reader to end of stream.
pub fn hash_reader<R: Read>(mut reader: R) -> std::io::Result<Ed2kHash> {
    let mut hasher = Ed2kHasher::new();
    let mut buf = vec![0u8; 128 * 1024];
    loop {
        let read = reader.read(&mut buf)?;
        if read == 0 {
            break;
        }
        hasher.update(&buf[..read]);
    }
    Ok(hasher.finish())
}

#[cfg(test)]
mod test {
    use super::*;

    fn md4(data: &[u8]) -> [u8; 16] {
        Md4::digest(data).into()
    }

    /// Feeds `len` zero bytes without materializing them all at once.
    fn hash_zeros(len: u64) -> Ed2kHash {
        let chunk = vec![0u8; 1024 * 1024];
        let mut hasher = Ed2kHasher::new();
        let mut fed = 0;
        while fed < len {
            let take = chunk.len().min((len - fed) as usize);
            hasher.update(&chunk[..take]);
            fed += take as u64;
        }
        hasher.finish()
    }

    fn md4_zeros(len: u64) -> [u8; 16] {
        let chunk = vec![0u8; 1024 * 1024];
        let mut md4 = Md4::new();
        let mut fed = 0;
        while fed < len {
            let take = chunk.len().min((len - fed) as usize);
            md4.update(&chunk[..take]);
            fed += take as u64;
        }
        md4.finalize().into()
    }

    #[test]
    fn empty_input_is_md4_of_nothing() {
        // The classic null ed2k hash.
        assert_eq!(
            hash_bytes(b""),
            hex::decode("31d6cfe0d16ae931b73c59d7e0c089c0")
                .unwrap()
                .as_slice()
        );
    }

    #[test]
    fn single_part_is_plain_md4() {
        let expected = hex::decode("6f60e71c00d4f907e38825b752763a20").unwrap();
        assert_eq!(hash_bytes(&[0u8; 100]), expected.as_slice());
        assert_eq!(hash_bytes(&[0u8; 100]), md4(&[0u8; 100]));
    }

    #[test]
    fn chunking_does_not_change_the_hash() {
        let data: Vec<u8> = (0..5000u32).flat_map(|v| v.to_le_bytes()).collect();
        let whole = hash_bytes(&data);

        let mut hasher = Ed2kHasher::new();
        for chunk in data.chunks(7) {
            hasher.update(chunk);
        }
        assert_eq!(hasher.finish(), whole);
    }

    #[test]
    fn one_byte_under_a_part_is_single_part() {
        let len = PART_SIZE - 1;
        assert_eq!(hash_zeros(len), md4_zeros(len));
    }

    #[test]
    fn exact_part_size_gains_trailing_empty_part() {
        // n = size/PART_SIZE + 1 = 2: the full part plus an empty part.
        let mut concat = Vec::new();
        concat.extend_from_slice(&md4_zeros(PART_SIZE));
        concat.extend_from_slice(&md4(b""));
        assert_eq!(hash_zeros(PART_SIZE), md4(&concat));

        // In particular it is not the single-part hash.
        assert_ne!(hash_zeros(PART_SIZE), md4_zeros(PART_SIZE));
    }

    #[test]
    fn two_parts_hash_the_digest_list() {
        let len = PART_SIZE + 3;
        let mut concat = Vec::new();
        concat.extend_from_slice(&md4_zeros(PART_SIZE));
        concat.extend_from_slice(&md4(&[0u8; 3]));
        assert_eq!(hash_zeros(len), md4(&concat));
    }

    #[test]
    fn reader_matches_bytes() {
        let data = vec![0xA5u8; 4096];
        assert_eq!(
            hash_reader(std::io::Cursor::new(&data)).unwrap(),
            hash_bytes(&data)
        );
    }
}

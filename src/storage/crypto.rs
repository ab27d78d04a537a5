//! Encryption and compression call contracts.
//!
//! The pool does not choose algorithms; it drives these traits at the
//! right points of the read/write pipelines. [`SnapCompressor`] is the
//! bundled compressor; [`NoEncryption`] disables the encryption layer
//! and [`XorEncryptor`] exists to exercise the key-version plumbing in
//! tests (it is not a cipher).

use std::io;

use crate::common::{Lsn, PageId, Result};

/// Page encryption collaborator.
///
/// `encrypt`/`decrypt` transform the payload span in place; the caller
/// stores the key version in the page header so `decrypt` can recover
/// the right key later.
pub trait PageEncryptor: Send + Sync {
    /// Key version stamped on new writes. 0 disables encryption.
    fn key_version(&self) -> u32;

    /// Encrypt `data` for this page. The LSN is the page LSN at write
    /// time and may be folded into the keystream; it is readable from
    /// the (never encrypted) header on decrypt.
    fn encrypt(&self, id: PageId, key_version: u32, lsn: Lsn, data: &mut [u8]) -> Result<()>;

    /// Inverse of [`encrypt`](Self::encrypt).
    ///
    /// # Errors
    /// Fails when the key version is unknown; content corruption is
    /// not detectable here and surfaces at checksum validation instead.
    fn decrypt(&self, id: PageId, key_version: u32, lsn: Lsn, data: &mut [u8]) -> Result<()>;
}

/// Page compression collaborator.
pub trait PageCompressor: Send + Sync {
    /// Compress `src`; returns the compressed bytes.
    fn compress(&self, src: &[u8]) -> Result<Vec<u8>>;

    /// Decompress `src` into at most `max_len` bytes.
    ///
    /// # Errors
    /// Fails on malformed input; the caller classifies that as page
    /// corruption.
    fn decompress(&self, src: &[u8], max_len: usize) -> Result<Vec<u8>>;
}

/// Encryption disabled: key version 0, transforms are identity.
#[derive(Debug, Default)]
pub struct NoEncryption;

impl PageEncryptor for NoEncryption {
    fn key_version(&self) -> u32 {
        0
    }

    fn encrypt(&self, _id: PageId, _kv: u32, _lsn: Lsn, _data: &mut [u8]) -> Result<()> {
        Ok(())
    }

    fn decrypt(&self, _id: PageId, _kv: u32, _lsn: Lsn, _data: &mut [u8]) -> Result<()> {
        Ok(())
    }
}

/// Keystream-XOR stand-in used by tests to exercise the encryption
/// boundary: deterministic per (key, key version, identity, lsn),
/// self-inverse, and emphatically not secure.
#[derive(Debug)]
pub struct XorEncryptor {
    key: u64,
    version: u32,
}

impl XorEncryptor {
    pub fn new(key: u64, version: u32) -> Self {
        assert!(version != 0, "key version 0 means no encryption");
        Self { key, version }
    }

    fn apply(&self, id: PageId, kv: u32, lsn: Lsn, data: &mut [u8]) {
        let mut state = self
            .key
            .wrapping_add(kv as u64)
            .wrapping_add(id.fold())
            .wrapping_add(lsn.rotate_left(17));
        for b in data.iter_mut() {
            // xorshift64 keystream
            state ^= state << 13;
            state ^= state >> 7;
            state ^= state << 17;
            *b ^= state as u8;
        }
    }
}

impl PageEncryptor for XorEncryptor {
    fn key_version(&self) -> u32 {
        self.version
    }

    fn encrypt(&self, id: PageId, kv: u32, lsn: Lsn, data: &mut [u8]) -> Result<()> {
        self.apply(id, kv, lsn, data);
        Ok(())
    }

    fn decrypt(&self, id: PageId, kv: u32, lsn: Lsn, data: &mut [u8]) -> Result<()> {
        self.apply(id, kv, lsn, data);
        Ok(())
    }
}

/// Snappy-based page compressor.
#[derive(Debug, Default)]
pub struct SnapCompressor;

impl PageCompressor for SnapCompressor {
    fn compress(&self, src: &[u8]) -> Result<Vec<u8>> {
        snap::raw::Encoder::new()
            .compress_vec(src)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e).into())
    }

    fn decompress(&self, src: &[u8], max_len: usize) -> Result<Vec<u8>> {
        let out = snap::raw::Decoder::new()
            .decompress_vec(src)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
        if out.len() > max_len {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                "decompressed image larger than a page",
            )
            .into());
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_xor_round_trip() {
        let enc = XorEncryptor::new(0xC0FFEE, 2);
        let id = PageId::new(4, 77);
        let original: Vec<u8> = (0..=255u8).cycle().take(1000).collect();

        let mut data = original.clone();
        enc.encrypt(id, 2, 42, &mut data).unwrap();
        assert_ne!(data, original);
        enc.decrypt(id, 2, 42, &mut data).unwrap();
        assert_eq!(data, original);
    }

    #[test]
    fn test_xor_differs_per_identity() {
        let enc = XorEncryptor::new(1, 1);
        let mut a = vec![0u8; 64];
        let mut b = vec![0u8; 64];
        enc.encrypt(PageId::new(1, 1), 1, 0, &mut a).unwrap();
        enc.encrypt(PageId::new(1, 2), 1, 0, &mut b).unwrap();
        assert_ne!(a, b);
    }

    #[test]
    fn test_snap_round_trip() {
        let comp = SnapCompressor;
        let src = vec![7u8; 4096];
        let packed = comp.compress(&src).unwrap();
        assert!(packed.len() < src.len());
        let unpacked = comp.decompress(&packed, 4096).unwrap();
        assert_eq!(unpacked, src);
    }

    #[test]
    fn test_snap_rejects_garbage() {
        let comp = SnapCompressor;
        assert!(comp.decompress(&[0xFF, 0x00, 0x12, 0x34], 4096).is_err());
    }
}

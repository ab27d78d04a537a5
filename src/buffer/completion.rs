//! I/O completion: the corruption / encryption / compression boundary.
//!
//! Read side: decrypt if the stored key version is non-zero, then
//! decompress if the image is page-compressed, then validate, then
//! classify failures. Write side runs the inverse pipeline into a
//! scratch buffer so the resident frame is never touched — concurrent
//! readers of the page keep going while its image is being prepared.
//!
//! Encrypted images carry a checksum of the ciphertext payload in the
//! key-version span, which is what makes the failure classification
//! possible: ciphertext checks out but plaintext does not, so either
//! the key is wrong or the page was corrupted before encryption.
//! Reported as [`Error::DecryptionFailed`] with the ambiguity logged.

use tracing::{debug, error, warn};

use crate::common::{Error, PageId, PoolConfig, Result, PAGE_SIZE};
use crate::storage::checksum;
use crate::storage::format::{self, CRYPT_CHECKSUM, DATA, KEY_VERSION, PAGE_TYPE, TRAILER};
use crate::storage::{PageCompressor, PageEncryptor};

/// What a successful read left behind.
#[derive(Debug)]
pub(crate) struct ReadOutcome {
    /// Key version of the on-disk image.
    pub key_version: u32,
    /// Physical bytes of the on-disk image (compressed size, or the
    /// full page).
    pub real_size: u32,
    /// The (decrypted) compressed image, kept so the page can later
    /// drop its frame and survive as compressed-only.
    pub zip_image: Option<Vec<u8>>,
}

fn crypt_checksum(buf: &[u8]) -> u32 {
    let mut h = crc32fast::Hasher::new();
    h.update(&buf[format::payload_range(buf.len())]);
    h.finalize()
}

fn corrupted(id: PageId) -> Error {
    Error::Corrupted {
        id,
        fatal: id.is_system_meta(),
    }
}

/// Finalize a page read: `buf` arrives as the raw on-disk image and
/// leaves as the validated uncompressed plaintext page.
pub(crate) fn complete_read(
    id: PageId,
    buf: &mut [u8],
    cfg: &PoolConfig,
    encryptor: &dyn PageEncryptor,
    compressor: &dyn PageCompressor,
) -> Result<ReadOutcome> {
    debug_assert_eq!(buf.len(), PAGE_SIZE);

    let key_version = format::key_version(buf);
    let lsn = format::page_lsn(buf);

    if key_version != 0 {
        // The plaintext checksum fields cannot cover ciphertext; the
        // encrypted image carries its own.
        if crypt_checksum(buf) != format::read_u32(buf, CRYPT_CHECKSUM) {
            debug!(page = %id, "ciphertext checksum mismatch");
            return Err(corrupted(id));
        }
        let range = format::payload_range(buf.len());
        encryptor
            .decrypt(id, key_version, lsn, &mut buf[range])
            .map_err(|_| Error::DecryptionFailed(id))?;
    }

    let mut zip_image = None;
    let mut real_size = PAGE_SIZE as u32;
    if format::is_compressed_type(format::page_type(buf)) {
        let packed_len = format::read_u32(buf, DATA) as usize;
        let packed_end = DATA + 4 + packed_len;
        if packed_end > PAGE_SIZE - TRAILER {
            debug!(page = %id, packed_len, "implausible compressed length");
            return Err(corrupted(id));
        }
        let inner = compressor
            .decompress(&buf[DATA + 4..packed_end], PAGE_SIZE)
            .map_err(|_| corrupted(id))?;
        if inner.len() != PAGE_SIZE {
            debug!(page = %id, len = inner.len(), "short decompressed image");
            return Err(corrupted(id));
        }
        real_size = packed_end as u32;
        zip_image = Some(buf[..packed_end].to_vec());
        buf.copy_from_slice(&inner);
    }

    if checksum::is_corrupted(buf, cfg.checksum) {
        if key_version != 0 {
            // The encrypted form was plausible; either the key is wrong
            // or the page was corrupted before encryption. We cannot
            // tell which from here.
            warn!(
                page = %id,
                key_version,
                "valid ciphertext decrypted to an invalid page; \
                 suspecting a wrong or rotated key"
            );
            return Err(Error::DecryptionFailed(id));
        }
        if id.is_system_meta() {
            error!(page = %id, "system metadata page failed validation");
        }
        return Err(corrupted(id));
    }

    // A plausible page for the wrong identity is corruption too
    // (misdirected write or stale mapping), except an all-zero page,
    // which is a legitimately never-written slot.
    if !format::is_all_zero(buf) && format::page_id(buf) != id {
        debug!(page = %id, stored = %format::page_id(buf), "identity mismatch");
        return Err(corrupted(id));
    }

    Ok(ReadOutcome {
        key_version,
        real_size,
        zip_image,
    })
}

/// Rebuild the full page image from a stored compressed prefix
/// (materialization of a compressed-only page).
pub(crate) fn decompress_stored(
    id: PageId,
    stored: &[u8],
    compressor: &dyn PageCompressor,
) -> Result<Vec<u8>> {
    if stored.len() < DATA + 4 {
        return Err(corrupted(id));
    }
    let packed_len = format::read_u32(stored, DATA) as usize;
    let packed_end = DATA + 4 + packed_len;
    if packed_end > stored.len() {
        return Err(corrupted(id));
    }
    let inner = compressor
        .decompress(&stored[DATA + 4..packed_end], PAGE_SIZE)
        .map_err(|_| corrupted(id))?;
    if inner.len() != PAGE_SIZE {
        return Err(corrupted(id));
    }
    Ok(inner)
}

/// Prepare the on-disk image for a write-back: stamp LSN, tear mirror
/// and checksum, then compress and encrypt per configuration. Returns
/// the bytes to hand to the I/O backend; `frame` itself is untouched.
pub(crate) fn prepare_write(
    id: PageId,
    frame: &[u8],
    newest_lsn: u64,
    cfg: &PoolConfig,
    encryptor: &dyn PageEncryptor,
    compressor: &dyn PageCompressor,
) -> Result<Vec<u8>> {
    debug_assert_eq!(frame.len(), PAGE_SIZE);
    let mut scratch = frame.to_vec();

    format::set_page_id(&mut scratch, id);
    format::set_page_lsn(&mut scratch, newest_lsn);
    checksum::stamp(&mut scratch, cfg.checksum);

    if cfg.page_compression {
        let packed = compressor.compress(&scratch)?;
        let packed_end = DATA + 4 + packed.len();
        if packed_end <= PAGE_SIZE - TRAILER {
            let mut out = vec![0u8; PAGE_SIZE];
            out[..DATA].copy_from_slice(&scratch[..DATA]);
            format::write_u16(&mut out, PAGE_TYPE, format::TYPE_COMPRESSED);
            format::write_u32(&mut out, DATA, packed.len() as u32);
            out[DATA + 4..packed_end].copy_from_slice(&packed);
            format::set_page_lsn(&mut out, newest_lsn);
            scratch = out;
        }
        // An incompressible page is written uncompressed; the type
        // field tells the read side which form it got.
    }

    let key_version = encryptor.key_version();
    if key_version != 0 {
        let range = format::payload_range(scratch.len());
        encryptor.encrypt(id, key_version, newest_lsn, &mut scratch[range])?;
        if format::page_type(&scratch) == format::TYPE_COMPRESSED {
            format::write_u16(&mut scratch, PAGE_TYPE, format::TYPE_COMPRESSED_ENCRYPTED);
        }
        format::write_u32(&mut scratch, KEY_VERSION, key_version);
        let crypt = crypt_checksum(&scratch);
        format::write_u32(&mut scratch, CRYPT_CHECKSUM, crypt);
    }

    Ok(scratch)
}

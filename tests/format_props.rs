//! Property tests for the on-disk format boundary: checksum
//! algorithms, the tear pair, and the compress/encrypt pipelines.

use proptest::prelude::*;

use pagepool::storage::checksum::{self, ChecksumAlgorithm};
use pagepool::storage::format::{self, DATA, TRAILER};
use pagepool::{PageId, PAGE_SIZE};

fn stamped_page(algo: ChecksumAlgorithm, payload: &[u8], lsn: u64) -> Vec<u8> {
    let mut page = vec![0u8; PAGE_SIZE];
    format::init_page(&mut page, PageId::new(2, 11));
    let n = payload.len().min(PAGE_SIZE - TRAILER - DATA);
    page[DATA..DATA + n].copy_from_slice(&payload[..n]);
    format::set_page_lsn(&mut page, lsn);
    checksum::stamp(&mut page, algo);
    page
}

proptest! {
    /// Every algorithm accepts what it stamped, for arbitrary payloads.
    #[test]
    fn prop_stamp_validates(
        payload in proptest::collection::vec(any::<u8>(), 0..1024),
        lsn in 1u64..u64::MAX,
    ) {
        for algo in [
            ChecksumAlgorithm::Crc32,
            ChecksumAlgorithm::StrictCrc32,
            ChecksumAlgorithm::Legacy,
            ChecksumAlgorithm::StrictLegacy,
            ChecksumAlgorithm::None,
            ChecksumAlgorithm::StrictNone,
        ] {
            let page = stamped_page(algo, &payload, lsn);
            prop_assert!(!checksum::is_corrupted(&page, algo));
        }
    }

    /// Flipping any single bit in the page body is detected by the
    /// checksummed algorithms, strict and tolerant alike.
    #[test]
    fn prop_single_bit_flip_detected(
        payload in proptest::collection::vec(any::<u8>(), 64..512),
        lsn in 1u64..u64::MAX,
        flip_at in DATA..(PAGE_SIZE - TRAILER),
        bit in 0u8..8,
    ) {
        for algo in [
            ChecksumAlgorithm::Crc32,
            ChecksumAlgorithm::StrictCrc32,
            ChecksumAlgorithm::Legacy,
            ChecksumAlgorithm::StrictLegacy,
        ] {
            let mut page = stamped_page(algo, &payload, lsn);
            page[flip_at] ^= 1 << bit;
            prop_assert!(
                checksum::is_corrupted(&page, algo),
                "{algo:?} missed a flip at {flip_at} bit {bit}"
            );
        }
    }

    /// Cross-acceptance: tolerant readers take pages written under any
    /// historical configuration; strict readers only their own.
    #[test]
    fn prop_cross_acceptance(
        payload in proptest::collection::vec(any::<u8>(), 0..256),
        lsn in 1u64..u64::MAX,
    ) {
        for writer in [
            ChecksumAlgorithm::Crc32,
            ChecksumAlgorithm::Legacy,
            ChecksumAlgorithm::None,
        ] {
            let page = stamped_page(writer, &payload, lsn);
            prop_assert!(!checksum::is_corrupted(&page, ChecksumAlgorithm::Crc32));
            prop_assert!(!checksum::is_corrupted(&page, ChecksumAlgorithm::Legacy));
            prop_assert!(!checksum::is_corrupted(&page, ChecksumAlgorithm::None));
        }

        let legacy = stamped_page(ChecksumAlgorithm::Legacy, &payload, lsn);
        prop_assert!(checksum::is_corrupted(&legacy, ChecksumAlgorithm::StrictCrc32));
    }

    /// A torn write (mismatched LSN mirror) is detected regardless of
    /// the checksum configuration.
    #[test]
    fn prop_tear_detected(
        payload in proptest::collection::vec(any::<u8>(), 0..256),
        lsn in 1u64..u64::MAX,
        delta in 1u32..u32::MAX,
    ) {
        let mut page = stamped_page(ChecksumAlgorithm::StrictNone, &payload, lsn);
        let end = page.len();
        let mirror = format::read_u32(&page, end - 4);
        format::write_u32(&mut page, end - 4, mirror.wrapping_add(delta));
        prop_assert!(checksum::is_corrupted(&page, ChecksumAlgorithm::StrictNone));
        prop_assert!(checksum::is_corrupted(&page, ChecksumAlgorithm::Crc32));
    }
}

mod pipeline {
    use super::*;
    use pagepool::storage::crypto::XorEncryptor;
    use pagepool::{NoEncryption, SnapCompressor};

    // The pipeline functions are exercised through the pool API.
    use pagepool::{BufferPool, FileIo, LatchMode, LatchedPage, PoolConfig};
    use std::sync::Arc;

    fn round_trip_config(compress: bool) -> PoolConfig {
        PoolConfig {
            total_blocks: 8,
            instances: 1,
            page_compression: compress,
            ..Default::default()
        }
    }

    fn pool_round_trip(
        payload: &[u8],
        compress: bool,
        encryptor: Arc<dyn pagepool::PageEncryptor>,
    ) -> Vec<u8> {
        let dir = tempfile::tempdir().unwrap();
        let io = Arc::new(FileIo::open(dir.path()).unwrap());
        io.create_space(1).unwrap();
        let id = PageId::new(1, 0);
        let io_dyn: Arc<dyn pagepool::IoBackend> = Arc::clone(&io) as _;

        {
            let pool = BufferPool::with_collaborators(
                round_trip_config(compress),
                Arc::clone(&io_dyn),
                Arc::clone(&encryptor),
                Arc::new(SnapCompressor),
                Arc::new(pagepool::FlushList::new()),
            )
            .unwrap();
            let mut guard = match pool.create_page(id, LatchMode::Exclusive).unwrap() {
                LatchedPage::Exclusive(g) => g,
                LatchedPage::Shared(_) => unreachable!(),
            };
            let n = payload.len().min(PAGE_SIZE - TRAILER - DATA);
            guard.data_mut()[DATA..DATA + n].copy_from_slice(&payload[..n]);
            guard.mark_dirty(7);
            drop(guard);
            pool.flush_all().unwrap();
        }

        // Fresh pool, cold read through the whole inverse pipeline.
        let io = Arc::new(FileIo::open(dir.path()).unwrap());
        let pool = BufferPool::with_collaborators(
            round_trip_config(compress),
            io,
            encryptor,
            Arc::new(SnapCompressor),
            Arc::new(pagepool::FlushList::new()),
        )
        .unwrap();
        let guard = pool.get_page_shared(id).unwrap();
        guard.data().to_vec()
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(16))]

        /// decrypt(decompress(encrypt(compress(P)))) == P through the
        /// real write/read paths, for every pipeline combination.
        #[test]
        fn prop_pipeline_round_trip(
            payload in proptest::collection::vec(any::<u8>(), 1..2048),
            compress in any::<bool>(),
            encrypted in any::<bool>(),
        ) {
            let encryptor: Arc<dyn pagepool::PageEncryptor> = if encrypted {
                Arc::new(XorEncryptor::new(0xDEC0DE, 9))
            } else {
                Arc::new(NoEncryption)
            };
            let out = pool_round_trip(&payload, compress, encryptor);
            let n = payload.len().min(PAGE_SIZE - TRAILER - DATA);
            prop_assert_eq!(&out[DATA..DATA + n], &payload[..n]);
        }
    }
}

use proptest::prelude::*;

use super::*;
use crate::path::{first_path_in_rank, left_child, left_grand_child, right_child};

/// Every chunk root of `height` down to (and including) `max_rank`.
fn chunk_paths(height: u32, max_rank: u32) -> Vec<Path> {
    (0..=max_rank)
        .step_by(height as usize)
        .flat_map(|rank| first_path_in_rank(rank)..=first_path_in_rank(rank + 1) - 1)
        .collect()
}

mod sizes {
    use super::*;

    #[test]
    fn chunk_size_formula() {
        for height in 1..=6 {
            assert_eq!(chunk_size(height), (1 << (height + 1)) - 2, "height {height}");
        }
        assert_eq!(chunk_size(2), 6);
        assert_eq!(chunk_size(3), 14);
    }

    #[test]
    fn oversized_heights_saturate() {
        assert_eq!(chunk_size(62), (1 << 63) - 2);
        assert_eq!(chunk_size(63), usize::MAX);
        assert_eq!(chunk_size(u32::MAX), usize::MAX);
    }

    #[test]
    fn new_chunk_is_zero_filled() {
        let chunk = HashChunk::new(0, 3).unwrap();

        assert_eq!(chunk.size(), 14);
        assert_eq!(chunk.hash_data().len(), 14 * DIGEST_LENGTH);
        assert!(chunk.hash_data().iter().all(|byte| *byte == 0));
    }
}

mod validation {
    use super::*;

    #[test]
    fn rejects_zero_height() {
        assert!(matches!(
            HashChunk::new(0, 0),
            Err(VmapError::InvalidArgument(_))
        ));
    }

    #[test]
    fn rejects_misaligned_path() {
        // rank(1) == 1, not a multiple of 2
        assert!(matches!(
            HashChunk::new(1, 2),
            Err(VmapError::InvalidArgument(_))
        ));
        // rank(3) == 2
        assert!(HashChunk::new(3, 2).is_ok());
        assert!(HashChunk::new(3, 3).is_err());
    }

    #[test]
    fn rejects_oversized_height() {
        assert!(HashChunk::new(0, MAX_CHUNK_HEIGHT + 1).is_err());
    }

    #[test]
    fn rejects_wrong_hash_data_length() {
        assert!(HashChunk::from_parts(0, 2, vec![0; 5 * DIGEST_LENGTH]).is_err());
        assert!(HashChunk::from_parts(0, 2, vec![0; 6 * DIGEST_LENGTH]).is_ok());
    }

    #[test]
    fn path_outside_chunk_is_rejected() {
        // chunk rooted at 3 with height 2 covers paths 7..=8 and 15..=18
        assert!(path_index_in_chunk(3, 3, 2).is_err());
        assert!(path_index_in_chunk(11, 3, 2).is_err());
        assert!(path_index_in_chunk(23, 3, 2).is_err());
        assert!(path_index_in_chunk(31, 3, 2).is_err());
        assert!(path_index_in_chunk(4, 0, 2).is_ok());
    }

    #[test]
    fn index_outside_chunk_is_rejected() {
        assert!(path_in_chunk(0, 6, 2).is_err());
        assert!(path_in_chunk(0, 5, 2).is_ok());

        let mut chunk = HashChunk::new(0, 2).unwrap();
        assert!(matches!(chunk.hash_at_index(6), Err(VmapError::InvalidArgument(_))));
        assert!(matches!(
            chunk.hash_at_index(usize::MAX),
            Err(VmapError::InvalidArgument(_))
        ));
        assert!(matches!(
            chunk.set_hash_at_index(usize::MAX / DIGEST_LENGTH, &[1; DIGEST_LENGTH]),
            Err(VmapError::InvalidArgument(_))
        ));
        assert!(matches!(
            chunk.set_hash_at_index(usize::MAX, &[1; DIGEST_LENGTH]),
            Err(VmapError::InvalidArgument(_))
        ));
        assert_eq!(chunk, HashChunk::new(0, 2).unwrap());
    }
}

mod ids {
    use super::*;

    #[test]
    fn breadth_first_numbering() {
        // height 2: level 0 is chunk 0, level 1 (rank 2) holds chunks 1..=4
        assert_eq!(path_to_chunk_id(0, 2).unwrap(), 0);
        assert_eq!(path_to_chunk_id(3, 2).unwrap(), 1);
        assert_eq!(path_to_chunk_id(6, 2).unwrap(), 4);
        assert_eq!(path_to_chunk_id(15, 2).unwrap(), 5);
        assert_eq!(chunk_id_to_chunk_path(5, 2).unwrap(), 15);

        // height 1: every path is a chunk root and ids equal paths
        for path in 0..100 {
            assert_eq!(path_to_chunk_id(path, 1).unwrap(), path);
        }
    }

    #[test]
    fn chunk_id_round_trip() {
        for height in 1..=4 {
            for chunk_path in chunk_paths(height, 12) {
                let id = path_to_chunk_id(chunk_path, height).unwrap();
                assert_eq!(
                    chunk_id_to_chunk_path(id, height).unwrap(),
                    chunk_path,
                    "height {height}, id {id}"
                );
            }
        }
    }

    #[test]
    fn ids_are_dense() {
        for height in 1..=4 {
            let ids: Vec<_> = chunk_paths(height, 12)
                .into_iter()
                .map(|path| path_to_chunk_id(path, height).unwrap())
                .collect();

            assert!(
                ids.iter().enumerate().all(|(i, id)| i as u64 == *id),
                "height {height}"
            );
        }
    }

    #[test]
    fn owning_chunk_of_a_path() {
        assert!(chunk_path_for(0, 2).is_err());
        assert_eq!(chunk_path_for(1, 2).unwrap(), 0);
        assert_eq!(chunk_path_for(6, 2).unwrap(), 0);
        assert_eq!(chunk_path_for(7, 2).unwrap(), 3);
        assert_eq!(chunk_path_for(22, 2).unwrap(), 4);
        assert_eq!(chunk_path_for(31, 2).unwrap(), 15);
    }
}

mod indices {
    use super::*;

    #[test]
    fn level_doubling_layout() {
        assert_eq!(path_index_in_chunk(1, 0, 2).unwrap(), 0);
        assert_eq!(path_index_in_chunk(2, 0, 2).unwrap(), 1);
        assert_eq!(path_index_in_chunk(3, 0, 2).unwrap(), 2);
        assert_eq!(path_index_in_chunk(6, 0, 2).unwrap(), 5);

        let chunk_path = 3;
        assert_eq!(path_index_in_chunk(left_child(chunk_path), chunk_path, 2).unwrap(), 0);
        assert_eq!(path_index_in_chunk(right_child(chunk_path), chunk_path, 2).unwrap(), 1);
        assert_eq!(
            path_index_in_chunk(left_grand_child(chunk_path, 2), chunk_path, 2).unwrap(),
            2
        );
    }

    #[test]
    fn index_round_trip() {
        for height in 1..=4 {
            for chunk_path in chunk_paths(height, 8) {
                for index in 0..chunk_size(height) {
                    let path = path_in_chunk(chunk_path, index, height).unwrap();
                    assert_eq!(
                        path_index_in_chunk(path, chunk_path, height).unwrap(),
                        index,
                        "height {height}, chunk {chunk_path}"
                    );
                    assert_eq!(chunk_path_for(path, height).unwrap(), chunk_path);
                }
            }
        }
    }
}

mod hashes {
    use super::*;

    #[test]
    fn set_and_get_by_path_and_index() {
        let mut chunk = HashChunk::new(3, 2).unwrap();

        chunk.set_hash_at_path(8, &[8; DIGEST_LENGTH]).unwrap();
        chunk.set_hash_at_index(5, &[5; DIGEST_LENGTH]).unwrap();

        assert_eq!(chunk.hash_at_index(1).unwrap(), [8; DIGEST_LENGTH]);
        assert_eq!(chunk.hash_at_path(18).unwrap(), [5; DIGEST_LENGTH]);
        assert_eq!(chunk.hash_at_path(7).unwrap(), NULL_HASH);
        assert!(chunk.hash_at_index(6).is_err());
        assert!(chunk.set_hash_at_path(2, &NULL_HASH).is_err());
    }

    #[test]
    fn clone_is_deep() {
        let mut original = HashChunk::new(0, 2).unwrap();
        original.set_hash_at_index(0, &[1; DIGEST_LENGTH]).unwrap();

        let mut copy = original.clone();
        copy.set_hash_at_index(0, &[2; DIGEST_LENGTH]).unwrap();

        assert_eq!(original.hash_at_index(0).unwrap(), [1; DIGEST_LENGTH]);
        assert_eq!(copy.hash_at_index(0).unwrap(), [2; DIGEST_LENGTH]);
    }

    #[test]
    fn disjoint_slots_written_from_threads() {
        let mut chunk = HashChunk::new(0, 4).unwrap();

        std::thread::scope(|scope| {
            for (index, slot) in chunk.slots_mut().enumerate() {
                let _handle = scope.spawn(move || slot.fill(index as u8));
            }
        });

        for index in 0..chunk.size() {
            assert_eq!(chunk.hash_at_index(index).unwrap(), [index as u8; DIGEST_LENGTH]);
        }
    }
}

proptest! {
    #[test]
    fn chunk_id_round_trip_on_deep_paths(height in 1_u32..=4, rank_level in 0_u32..10, offset in any::<u64>()) {
        let rank = rank_level * height;
        prop_assume!(rank <= 40);
        let chunk_path = first_path_in_rank(rank) + offset % (1 << rank);

        let id = path_to_chunk_id(chunk_path, height).unwrap();
        prop_assert_eq!(chunk_id_to_chunk_path(id, height).unwrap(), chunk_path);
    }
}

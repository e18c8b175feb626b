use super::*;
use crate::constants::BLOCK_SIZE;
use crate::peer::Bitfield;
use bytes::Bytes;
use sha1::{Digest, Sha1};
use std::net::SocketAddr;

fn addr(n: u8) -> SocketAddr {
    format!("10.0.0.{}:6881", n).parse().unwrap()
}

fn sha1_of(data: &[u8]) -> [u8; 20] {
    let mut hasher = Sha1::new();
    hasher.update(data);
    hasher.finalize().into()
}

/// Two 16KB pieces with bytes 0x00 and 0x01, the fixture from the
/// single-peer happy path. Endgame is disabled so normal-mode rules
/// apply to these tiny maps; the endgame tests opt back in.
fn two_piece_map() -> (PieceMap, Vec<Vec<u8>>) {
    let pieces = vec![vec![0x00u8; 16384], vec![0x01u8; 16384]];
    let hashes = pieces.iter().map(|p| sha1_of(p)).collect();
    (
        PieceMap::new(16384, 32768, hashes).with_endgame_threshold(0),
        pieces,
    )
}

fn full_bitfield(count: usize) -> Bitfield {
    let mut bits = Bitfield::new(count);
    for i in 0..count {
        bits.set(i);
    }
    bits
}

#[test]
fn test_availability_tracking() {
    let (map, _) = two_piece_map();

    let mut bits_a = Bitfield::new(2);
    bits_a.set(0);
    let mut bits_b = Bitfield::new(2);
    bits_b.set(0);
    bits_b.set(1);

    map.add_bitfield(&bits_a);
    map.add_bitfield(&bits_b);
    assert_eq!(map.availability(0), 2);
    assert_eq!(map.availability(1), 1);

    map.add_have(1);
    assert_eq!(map.availability(1), 2);

    map.peer_gone(&bits_a, addr(1));
    assert_eq!(map.availability(0), 1);
    assert_eq!(map.availability(1), 2);
}

#[test]
fn test_availability_never_underflows() {
    let (map, _) = two_piece_map();
    let bits = full_bitfield(2);
    map.peer_gone(&bits, addr(1));
    assert_eq!(map.availability(0), 0);
    assert_eq!(map.availability(1), 0);
}

#[test]
fn test_rarest_first_selection() {
    // 4 single-block pieces; piece 2 is the rarest.
    let pieces: Vec<Vec<u8>> = (0..4u8).map(|i| vec![i; 16384]).collect();
    let hashes: Vec<[u8; 20]> = pieces.iter().map(|p| sha1_of(p)).collect();
    let map = PieceMap::new(16384, 4 * 16384, hashes);

    let everything = full_bitfield(4);
    map.add_bitfield(&everything);
    map.add_bitfield(&everything);
    let mut partial = Bitfield::new(4);
    partial.set(0);
    partial.set(1);
    partial.set(3);
    map.add_bitfield(&partial);

    // Leave the cold-start override by completing piece 0 directly.
    assert!(matches!(
        map.deliver(addr(1), 0, 0, Bytes::from(pieces[0].clone())),
        Delivery::Accepted { .. }
    ));

    let request = map.next_request(addr(2), &everything).unwrap();
    assert_eq!(request.piece, 2, "rarest piece should win");
}

#[test]
fn test_rarest_first_tie_breaks_by_index() {
    let pieces: Vec<Vec<u8>> = (0..3u8).map(|i| vec![i; 16384]).collect();
    let hashes: Vec<[u8; 20]> = pieces.iter().map(|p| sha1_of(p)).collect();
    let map = PieceMap::new(16384, 3 * 16384, hashes);

    let everything = full_bitfield(3);
    map.add_bitfield(&everything);

    map.deliver(addr(1), 0, 0, Bytes::from(pieces[0].clone()));

    // Remaining pieces tie on availability; lowest index wins.
    let request = map.next_request(addr(2), &everything).unwrap();
    assert_eq!(request.piece, 1);
}

#[test]
fn test_random_first_piece_draws_from_rarest_four() {
    // Pieces 0..4 have availability 1, pieces 4..8 availability 2: the
    // cold-start pick must come from the first four.
    let pieces: Vec<Vec<u8>> = (0..8u8).map(|i| vec![i; 16384]).collect();
    let hashes: Vec<[u8; 20]> = pieces.iter().map(|p| sha1_of(p)).collect();
    let everything = full_bitfield(8);

    for _ in 0..16 {
        let map = PieceMap::new(16384, 8 * 16384, hashes.clone());
        map.add_bitfield(&everything);
        let mut common = Bitfield::new(8);
        for i in 4..8 {
            common.set(i);
        }
        map.add_bitfield(&common);

        let request = map.next_request(addr(1), &everything).unwrap();
        assert!(request.piece < 4, "cold-start pick outside rarest four");
    }
}

#[test]
fn test_blocks_issued_in_ascending_offset() {
    // One piece of 4 blocks.
    let piece: Vec<u8> = vec![7u8; 4 * BLOCK_SIZE as usize];
    let map = PieceMap::new(
        u64::from(4 * BLOCK_SIZE),
        u64::from(4 * BLOCK_SIZE),
        vec![sha1_of(&piece)],
    );
    let bits = full_bitfield(1);
    map.add_bitfield(&bits);

    let offsets: Vec<u32> = (0..4)
        .map(|_| map.next_request(addr(1), &bits).unwrap().offset)
        .collect();
    assert_eq!(offsets, vec![0, 16384, 32768, 49152]);
    assert!(map.next_request(addr(1), &bits).is_none());
}

#[test]
fn test_single_requester_outside_endgame() {
    let (map, _) = two_piece_map();
    let bits = full_bitfield(2);
    map.add_bitfield(&bits);

    let first = map.next_request(addr(1), &bits).unwrap();
    assert_eq!(map.requester_count(first.piece, first.offset), 1);

    // The other peer must be steered to a different block.
    let second = map.next_request(addr(2), &bits).unwrap();
    assert_ne!(
        (first.piece, first.offset),
        (second.piece, second.offset),
        "same block handed to two peers outside endgame"
    );
}

#[test]
fn test_deliver_happy_path() {
    let (map, pieces) = two_piece_map();
    let bits = full_bitfield(2);
    map.add_bitfield(&bits);

    for piece in 0..2u32 {
        match map.deliver(addr(1), piece, 0, Bytes::from(pieces[piece as usize].clone())) {
            Delivery::Accepted { completed, .. } => {
                let done = completed.expect("single-block piece completes");
                assert_eq!(done.index, piece);
                assert_eq!(done.data.as_ref(), pieces[piece as usize].as_slice());
            }
            other => panic!("unexpected delivery outcome: {:?}", other),
        }
    }

    assert!(map.is_complete());
    assert_eq!(map.bytes_left(), 0);
    assert_eq!(map.pending_broadcast(), vec![0, 1]);
    assert!(map.pending_broadcast().is_empty(), "broadcast drains once");
}

#[test]
fn test_deliver_rejects_bad_geometry() {
    let (map, pieces) = two_piece_map();

    assert!(matches!(
        map.deliver(addr(1), 9, 0, Bytes::from_static(b"x")),
        Delivery::Rejected(RejectReason::UnknownPiece)
    ));
    assert!(matches!(
        map.deliver(addr(1), 0, 3, Bytes::from_static(b"x")),
        Delivery::Rejected(RejectReason::BadOffset)
    ));
    assert!(matches!(
        map.deliver(addr(1), 0, 0, Bytes::from_static(b"short")),
        Delivery::Rejected(RejectReason::LengthMismatch)
    ));

    map.deliver(addr(1), 0, 0, Bytes::from(pieces[0].clone()));
    assert!(matches!(
        map.deliver(addr(1), 0, 0, Bytes::from(pieces[0].clone())),
        Delivery::Rejected(RejectReason::AlreadyComplete)
    ));
}

#[test]
fn test_duplicate_block_reported() {
    // One piece of two blocks so the piece stays open after one delivery.
    let piece: Vec<u8> = vec![9u8; 2 * BLOCK_SIZE as usize];
    let map = PieceMap::new(
        u64::from(2 * BLOCK_SIZE),
        u64::from(2 * BLOCK_SIZE),
        vec![sha1_of(&piece)],
    );

    let block = Bytes::from(vec![9u8; BLOCK_SIZE as usize]);
    assert!(matches!(
        map.deliver(addr(1), 0, 0, block.clone()),
        Delivery::Accepted { completed: None, .. }
    ));
    assert!(matches!(
        map.deliver(addr(2), 0, 0, block),
        Delivery::Duplicate
    ));
}

#[test]
fn test_hash_failure_resets_piece_and_names_contributors() {
    let (map, pieces) = two_piece_map();
    let bits = full_bitfield(2);
    map.add_bitfield(&bits);

    // Corrupted content for piece 1.
    match map.deliver(addr(7), 1, 0, Bytes::from(vec![0xFFu8; 16384])) {
        Delivery::Rejected(RejectReason::HashMismatch { contributors }) => {
            assert_eq!(contributors, vec![addr(7)]);
        }
        other => panic!("expected hash mismatch, got {:?}", other),
    }
    assert!(!map.is_complete());
    assert!(map.pending_broadcast().is_empty());

    // The piece is requestable again and a correct delivery succeeds.
    let retry = map.next_request(addr(8), &bits);
    assert!(retry.is_some());
    assert!(matches!(
        map.deliver(addr(8), 1, 0, Bytes::from(pieces[1].clone())),
        Delivery::Accepted {
            completed: Some(_),
            ..
        }
    ));
}

#[test]
fn test_endgame_duplicates_and_cancels() {
    // Single remaining piece of 2 blocks, threshold 1: endgame active.
    let piece: Vec<u8> = vec![3u8; 2 * BLOCK_SIZE as usize];
    let map = PieceMap::new(
        u64::from(2 * BLOCK_SIZE),
        u64::from(2 * BLOCK_SIZE),
        vec![sha1_of(&piece)],
    )
    .with_endgame_threshold(1);
    let bits = full_bitfield(1);
    map.add_bitfield(&bits);
    assert!(map.is_endgame());

    // Peer X takes both blocks, then stalls.
    let x = addr(1);
    let r0 = map.next_request(x, &bits).unwrap();
    let r1 = map.next_request(x, &bits).unwrap();
    assert_eq!((r0.offset, r1.offset), (0, 16384));

    // Peer Y may duplicate both requests in endgame.
    let y = addr(2);
    let d0 = map.next_request(y, &bits).unwrap();
    let d1 = map.next_request(y, &bits).unwrap();
    assert_eq!((d0.offset, d1.offset), (0, 16384));
    assert_eq!(map.requester_count(0, 0), 2);

    // Y never gets handed the same block twice.
    assert!(map.next_request(y, &bits).is_none());

    // Y delivers block 0: X's outstanding duplicate must be cancelled.
    let block = Bytes::from(vec![3u8; BLOCK_SIZE as usize]);
    match map.deliver(y, 0, 0, block.clone()) {
        Delivery::Accepted { cancels, .. } => {
            assert_eq!(cancels, vec![(x, BlockRequest::new(0, 0, BLOCK_SIZE))]);
        }
        other => panic!("unexpected outcome: {:?}", other),
    }

    // Y delivers block 1; piece completes exactly once.
    match map.deliver(y, 0, 16384, block.clone()) {
        Delivery::Accepted { completed, cancels } => {
            assert!(completed.is_some());
            assert_eq!(cancels, vec![(x, BlockRequest::new(0, 16384, BLOCK_SIZE))]);
        }
        other => panic!("unexpected outcome: {:?}", other),
    }

    // X's late duplicate commit attempt is rejected.
    assert!(matches!(
        map.deliver(x, 0, 0, block),
        Delivery::Rejected(RejectReason::AlreadyComplete)
    ));
}

#[test]
fn test_endgame_requester_cap() {
    let piece: Vec<u8> = vec![4u8; BLOCK_SIZE as usize];
    let map = PieceMap::new(
        u64::from(BLOCK_SIZE),
        u64::from(BLOCK_SIZE),
        vec![sha1_of(&piece)],
    )
    .with_endgame_threshold(1);
    let bits = full_bitfield(1);

    for n in 1..=3u8 {
        assert!(map.next_request(addr(n), &bits).is_some());
    }
    // Fourth requester exceeds the endgame duplicate cap.
    assert!(map.next_request(addr(4), &bits).is_none());
    assert_eq!(map.requester_count(0, 0), 3);
}

#[test]
fn test_short_last_piece() {
    // 40000 bytes in 16384-byte pieces: last piece is 7232 bytes.
    let content: Vec<Vec<u8>> = vec![vec![1u8; 16384], vec![2u8; 16384], vec![3u8; 7232]];
    let hashes: Vec<[u8; 20]> = content.iter().map(|p| sha1_of(p)).collect();
    let map = PieceMap::new(16384, 40000, hashes);

    assert_eq!(map.piece_size(2), 7232);

    let mut only_last = Bitfield::new(3);
    only_last.set(2);

    // Request against the last piece produces the short block length.
    let request = map.next_request(addr(1), &only_last).unwrap();
    assert_eq!(request, BlockRequest::new(2, 0, 7232));

    assert!(matches!(
        map.deliver(addr(1), 2, 0, Bytes::from(content[2].clone())),
        Delivery::Accepted {
            completed: Some(_),
            ..
        }
    ));
}

#[test]
fn test_empty_bitfield_never_selected() {
    let (map, _) = two_piece_map();
    let empty = Bitfield::new(2);
    assert!(map.next_request(addr(1), &empty).is_none());
}

#[test]
fn test_restore_complete_skips_broadcast() {
    let (map, _) = two_piece_map();
    map.restore_complete(0);
    assert_eq!(map.have_count(), 1);
    assert!(map.pending_broadcast().is_empty());
    assert_eq!(map.bytes_left(), 16384);

    // Restored pieces are never re-requested.
    let mut only_zero = Bitfield::new(2);
    only_zero.set(0);
    assert!(map.next_request(addr(1), &only_zero).is_none());
}

#[test]
fn test_reclaim_expired_frees_block() {
    let (map, _) = two_piece_map();
    let bits = full_bitfield(2);

    let first = map.next_request(addr(1), &bits).unwrap();
    // A fresh request is not expired; the block stays claimed.
    map.reclaim_expired(std::time::Instant::now());
    assert_eq!(map.requester_count(first.piece, first.offset), 1);

    // Far enough in the future the claim lapses and the block is free.
    let later = std::time::Instant::now() + crate::constants::REQUEST_TIMEOUT * 2;
    map.reclaim_expired(later);
    assert_eq!(map.requester_count(first.piece, first.offset), 0);
    let again = map.next_request(addr(2), &bits).unwrap();
    assert_eq!((again.piece, again.offset), (first.piece, first.offset));
}

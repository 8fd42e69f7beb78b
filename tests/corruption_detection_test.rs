mod common;

use spitelog::codec::HEADER_SIZE;
use spitelog::{BinlogEvent, EventId, EVENT_FLAG_PARTIAL};

#[test]
fn torn_tail_is_truncated_to_last_complete_frame() {
    let (_dir, path) = common::temp_binlog("torn.binlog");

    let (mut binlog, _) = common::open_and_collect(&path, common::plain_options()).unwrap();
    binlog.add(0, b"first").unwrap();
    binlog.add(0, b"second").unwrap();
    binlog.add(0, b"third").unwrap();
    binlog.close(true).unwrap();

    let full = common::file_size(&path);
    common::truncate_file(&path, full - 1);

    let replayed = common::replay_set(&path, common::plain_options());
    assert_eq!(
        replayed,
        vec![(1, b"first".to_vec()), (2, b"second".to_vec())]
    );

    // The damaged tail is gone from disk as well.
    assert_eq!(
        common::file_size(&path),
        common::frame_size(5) + common::frame_size(6)
    );
}

#[test]
fn truncation_at_every_offset_recovers_the_prefix() {
    let (_dir, path) = common::temp_binlog("every-offset.binlog");

    let payloads: [&[u8]; 3] = [b"alpha", b"bb", b"gamma-long-payload"];
    let (mut binlog, _) = common::open_and_collect(&path, common::plain_options()).unwrap();
    for payload in payloads {
        binlog.add(0, payload).unwrap();
    }
    binlog.close(true).unwrap();

    let original = common::read_file(&path);
    let boundaries: Vec<u64> = payloads
        .iter()
        .scan(0u64, |acc, payload| {
            *acc += common::frame_size(payload.len());
            Some(*acc)
        })
        .collect();

    for cut in 0..=original.len() as u64 {
        std::fs::write(&path, &original[..cut as usize]).unwrap();

        let expected: Vec<(u64, Vec<u8>)> = payloads
            .iter()
            .enumerate()
            .take_while(|(index, _)| boundaries[*index] <= cut)
            .map(|(index, payload)| (index as u64 + 1, payload.to_vec()))
            .collect();

        let replayed = common::replay_set(&path, common::plain_options());
        assert_eq!(replayed, expected, "mismatch at cut offset {cut}");
    }
}

#[test]
fn crc_corruption_stops_replay_at_valid_prefix() {
    let (_dir, path) = common::temp_binlog("crc.binlog");

    let (mut binlog, _) = common::open_and_collect(&path, common::plain_options()).unwrap();
    binlog.add(0, b"good").unwrap();
    binlog.add(0, b"bad-soon").unwrap();
    binlog.add(0, b"unreachable").unwrap();
    binlog.close(true).unwrap();

    // Flip a payload byte inside the second frame.
    let second_frame_payload = common::frame_size(4) + HEADER_SIZE as u64;
    common::corrupt_byte(&path, second_frame_payload);

    let replayed = common::replay_set(&path, common::plain_options());
    assert_eq!(replayed, vec![(1, b"good".to_vec())]);
    assert_eq!(common::file_size(&path), common::frame_size(4));
}

#[test]
fn out_of_range_length_stops_replay_at_valid_prefix() {
    let (_dir, path) = common::temp_binlog("badlen.binlog");

    let (mut binlog, _) = common::open_and_collect(&path, common::plain_options()).unwrap();
    binlog.add(0, b"survivor").unwrap();
    binlog.add(0, b"mangled").unwrap();
    binlog.close(true).unwrap();

    // Stamp an absurd length over the second frame's length field.
    common::overwrite_bytes(&path, common::frame_size(8), &u32::MAX.to_le_bytes());

    let replayed = common::replay_set(&path, common::plain_options());
    assert_eq!(replayed, vec![(1, b"survivor".to_vec())]);
}

#[test]
fn undersized_length_stops_replay_at_valid_prefix() {
    let (_dir, path) = common::temp_binlog("tinylen.binlog");

    let (mut binlog, _) = common::open_and_collect(&path, common::plain_options()).unwrap();
    binlog.add(0, b"survivor").unwrap();
    binlog.add(0, b"mangled").unwrap();
    binlog.close(true).unwrap();

    common::overwrite_bytes(&path, common::frame_size(8), &3u32.to_le_bytes());

    let replayed = common::replay_set(&path, common::plain_options());
    assert_eq!(replayed, vec![(1, b"survivor".to_vec())]);
}

#[test]
fn corrupted_first_frame_yields_empty_but_usable_binlog() {
    let (_dir, path) = common::temp_binlog("first-frame.binlog");

    let (mut binlog, _) = common::open_and_collect(&path, common::plain_options()).unwrap();
    binlog.add(0, b"only").unwrap();
    binlog.close(true).unwrap();

    common::corrupt_byte(&path, 6);

    let (mut binlog, replayed) =
        common::open_and_collect(&path, common::plain_options()).unwrap();
    assert!(replayed.is_empty());
    assert_eq!(common::file_size(&path), 0);

    // The binlog stays fully usable after the wipeout.
    binlog.add(0, b"fresh start").unwrap();
    binlog.close(true).unwrap();
    assert_eq!(
        common::replay_set(&path, common::plain_options()),
        vec![(1, b"fresh start".to_vec())]
    );
}

#[test]
fn partial_group_vanishes_when_commit_frame_is_torn() {
    let (_dir, path) = common::temp_binlog("torn-group.binlog");

    let (mut binlog, _) = common::open_and_collect(&path, common::plain_options()).unwrap();
    binlog.add(0, b"base-1").unwrap();
    binlog.add(0, b"base-2").unwrap();

    let p1 = binlog.next_event_id();
    binlog
        .add_event(BinlogEvent::new(p1, 0, EVENT_FLAG_PARTIAL, b"group-a"))
        .unwrap();
    let p2 = binlog.next_event_id();
    binlog
        .add_event(BinlogEvent::new(p2, 0, EVENT_FLAG_PARTIAL, b"group-b"))
        .unwrap();
    let commit = binlog.next_event_id();
    binlog
        .add_event(BinlogEvent::new(commit, 0, 0, b"group-commit"))
        .unwrap();
    binlog.close(true).unwrap();

    // Tear the file inside the group's commit frame: the whole group must
    // disappear, not just the commit.
    let base = common::frame_size(6) * 2;
    let group_members = common::frame_size(7) * 2;
    common::truncate_file(&path, base + group_members + 3);

    let replayed = common::replay_set(&path, common::plain_options());
    assert_eq!(
        replayed,
        vec![(1, b"base-1".to_vec()), (2, b"base-2".to_vec())]
    );
    assert_eq!(common::file_size(&path), base);
}

#[test]
fn reopen_after_truncation_is_stable() {
    let (_dir, path) = common::temp_binlog("stable.binlog");

    let (mut binlog, _) = common::open_and_collect(&path, common::plain_options()).unwrap();
    binlog.add(0, b"one").unwrap();
    binlog.add(0, b"two").unwrap();
    binlog.close(true).unwrap();

    common::truncate_file(&path, common::file_size(&path) - 2);

    let first = common::replay_set(&path, common::plain_options());
    let second = common::replay_set(&path, common::plain_options());
    assert_eq!(first, vec![(1, b"one".to_vec())]);
    assert_eq!(first, second);
}

#[test]
fn rewrite_of_missing_id_is_rejected_on_append() {
    let (_dir, path) = common::temp_binlog("zombie.binlog");

    let (mut binlog, _) = common::open_and_collect(&path, common::plain_options()).unwrap();
    let id = binlog.add(0, b"short-lived").unwrap();
    binlog.erase(id).unwrap();

    let err = binlog
        .add_event(BinlogEvent::rewrite(EventId(id.0), 0, b"zombie"))
        .unwrap_err();
    assert!(matches!(err, spitelog::Error::Corruption(_)));
}

use cancap::{
    CanFrame, Column, FilterCategory, FrameQueue, FrameStore, StoreConfig, TimeBasis, WireMessage,
    frame::{ERROR_FRAME_FLAG, EXTENDED_ID_MASK},
    sort_frames,
    wire_codec::{FLAG_ERROR, FLAG_EXTENDED, FLAG_FD, FLAG_REMOTE, decode_frame, encode_frame},
};
use proptest::prelude::*;
use std::collections::HashMap;
use std::time::{Duration, Instant};

fn arb_frame() -> impl Strategy<Value = CanFrame> {
    (
        prop_oneof![0u32..0x800, Just(0x181u32), Just(0x081u32), Just(0x701u32)],
        0u64..1_000_000,
        prop::collection::vec(any::<u8>(), 0..=8),
    )
        .prop_map(|(id, timestamp, data)| CanFrame::new(id, &data).unwrap().with_timestamp(timestamp))
}

fn arb_category_switches() -> impl Strategy<Value = Vec<bool>> {
    prop::collection::vec(any::<bool>(), 7)
}

/// 属性测试：覆盖模式下每个标识符只保留最后一帧
proptest! {
    #[test]
    fn test_overwrite_invariant(frames in prop::collection::vec(arb_frame(), 0..200)) {
        let store = FrameStore::new(StoreConfig {
            overwrite_mode: true,
            prealloc_frames: 0,
            ..StoreConfig::default()
        });
        for frame in &frames {
            store.ingest(*frame);
        }

        let mut last: HashMap<u32, CanFrame> = HashMap::new();
        for frame in &frames {
            last.insert(frame.id, *frame);
        }

        let all = store.frames().to_vec();
        prop_assert_eq!(all.len(), last.len());
        for stored in &all {
            let expected = last.get(&stored.id).unwrap();
            prop_assert_eq!(stored.payload(), expected.payload());
            prop_assert_eq!(stored.timestamp, expected.timestamp);
        }
    }
}

/// 属性测试：过滤视图恰好包含通过过滤的帧
proptest! {
    #[test]
    fn test_filter_soundness(
        frames in prop::collection::vec(arb_frame(), 0..200),
        switches in arb_category_switches(),
        disabled in prop::collection::vec(0u32..0x800, 0..20),
        overwrite in any::<bool>(),
    ) {
        let store = FrameStore::new(StoreConfig {
            overwrite_mode: overwrite,
            prealloc_frames: 0,
            ..StoreConfig::default()
        });
        store.add_frames(&frames);
        for (category, enabled) in FilterCategory::ALL.iter().zip(&switches) {
            store.set_category_switch(*category, *enabled);
        }
        for id in &disabled {
            store.set_filter_state(*id, false);
        }
        store.recompute_filtered_view();

        let all = store.frames().to_vec();
        let filtered = store.snapshot_filtered();
        let expected: Vec<CanFrame> = all.iter().filter(|f| store.passes(f)).copied().collect();
        prop_assert_eq!(filtered, expected);
    }
}

/// 属性测试：增量追加与整体重建结果一致
proptest! {
    #[test]
    fn test_incremental_matches_recompute(
        frames in prop::collection::vec(arb_frame(), 0..200),
        switches in arb_category_switches(),
        overwrite in any::<bool>(),
    ) {
        let store = FrameStore::new(StoreConfig {
            overwrite_mode: overwrite,
            prealloc_frames: 0,
            ..StoreConfig::default()
        });
        for (category, enabled) in FilterCategory::ALL.iter().zip(&switches) {
            store.set_category_switch(*category, *enabled);
        }
        store.recompute_filtered_view();
        store.add_frames(&frames);

        let incremental = store.snapshot_filtered();
        store.recompute_filtered_view();
        prop_assert_eq!(incremental, store.snapshot_filtered());
    }
}

/// 属性测试：排序稳定，相等键在两个方向上都保持原始顺序
proptest! {
    #[test]
    fn test_sort_stability(
        frames in prop::collection::vec(arb_frame(), 0..100),
        column_index in 0usize..11,
        ascending in any::<bool>(),
    ) {
        let column = Column::from_index(column_index).unwrap();
        let tagged: Vec<CanFrame> = frames
            .iter()
            .enumerate()
            .map(|(i, f)| f.with_timestamp(i as u64))
            .collect();
        let column = if column == Column::TimeStamp { Column::FrameId } else { column };

        let mut once = tagged.clone();
        sort_frames(&mut once, column, ascending);
        let mut twice = once.clone();
        sort_frames(&mut twice, column, ascending);
        prop_assert_eq!(&once, &twice);

        for pair in once.windows(2) {
            let (a, b) = (column.key(&pair[0]), column.key(&pair[1]));
            if ascending {
                prop_assert!(a <= b);
            } else {
                prop_assert!(a >= b);
            }
            if a == b {
                // 时间戳记录了原始位置
                prop_assert!(pair[0].timestamp < pair[1].timestamp);
            }
        }
    }
}

/// 属性测试：连续两次rebase得到相同的捕获起点
proptest! {
    #[test]
    fn test_rebase_idempotence(
        timestamps in prop::collection::vec(0u64..u64::MAX / 2, 1..100),
        offset in -1_000_000i64..1_000_000,
    ) {
        let mut basis = TimeBasis::new(false);
        basis.set_device_to_host_offset(offset);
        let frames: Vec<CanFrame> = timestamps
            .iter()
            .map(|ts| CanFrame::new(0x1, &[]).unwrap().with_timestamp(basis.capture(*ts, 0)))
            .collect();
        basis.rebase(&frames);
        let first = basis.capture_epoch();
        basis.rebase(&frames);
        prop_assert_eq!(first, basis.capture_epoch());

        // 最早的帧显示为0
        let earliest = frames.iter().map(|f| basis.normalize(f.timestamp)).min();
        prop_assert_eq!(earliest, Some(0));
    }
}

/// 属性测试：超出容量的生产不会阻塞，丢帧计数单调不减
proptest! {
    #![proptest_config(ProptestConfig::with_cases(32))]
    #[test]
    fn test_queue_never_blocks(capacity in 1usize..64, extra in 0usize..500) {
        let queue = FrameQueue::new(capacity);
        let frame = CanFrame::new(0x181, &[1]).unwrap();
        let started = Instant::now();
        let mut last_dropped = 0;
        for _ in 0..capacity + extra {
            queue.push(frame);
            let dropped = queue.stats().dropped;
            prop_assert!(dropped >= last_dropped);
            last_dropped = dropped;
        }
        prop_assert!(started.elapsed() < Duration::from_secs(1));
        prop_assert_eq!(last_dropped, extra as u64);
        prop_assert_eq!(queue.len(), capacity);
    }
}

/// 属性测试：线上格式往返
proptest! {
    #[test]
    fn test_wire_round_trip(
        timestamp in any::<u64>(),
        flags in 0u8..16,
        len in prop_oneof![Just(0usize), Just(1usize), Just(8usize), Just(64usize)],
        seed in any::<u8>(),
    ) {
        let payload: Vec<u8> = (0..len).map(|i| seed.wrapping_add(i as u8)).collect();
        let bytes = WireMessage { timestamp, flags, payload: &payload }.to_vec();
        prop_assert_eq!(bytes.len(), 9 + len);

        let decoded = WireMessage::decode(&bytes).unwrap();
        prop_assert_eq!(decoded.timestamp, timestamp);
        prop_assert_eq!(decoded.flags, flags);
        prop_assert_eq!(decoded.payload, &payload[..]);
        prop_assert_eq!(decoded.to_vec(), bytes);
    }
}

/// 属性测试：报文 → 帧 → 报文，16种标志组合都逐字节一致
proptest! {
    #[test]
    fn test_frame_wire_round_trip(
        id in 0u32..=EXTENDED_ID_MASK,
        bus in 0u8..4,
        timestamp in any::<u64>(),
        flags in 0u8..16,
        len in prop_oneof![Just(0usize), Just(1usize), Just(8usize), Just(64usize)],
        seed in any::<u8>(),
    ) {
        let payload: Vec<u8> = (0..len).map(|i| seed.wrapping_add(i as u8)).collect();
        let bytes = WireMessage { timestamp, flags, payload: &payload }.to_vec();

        let frame = decode_frame(id, bus, &bytes).unwrap();
        prop_assert_eq!(frame.timestamp, timestamp);
        prop_assert_eq!(frame.payload(), &payload[..]);
        prop_assert_eq!(frame.bus, bus);
        prop_assert_eq!(frame.frame_id(), id);
        prop_assert_eq!(frame.extended, flags & FLAG_EXTENDED != 0);
        prop_assert_eq!(frame.remote, flags & FLAG_REMOTE != 0);
        prop_assert_eq!(frame.fd, flags & FLAG_FD != 0);
        prop_assert_eq!(frame.is_error(), flags & FLAG_ERROR != 0);
        prop_assert_eq!(frame.id & ERROR_FRAME_FLAG != 0, flags & FLAG_ERROR != 0);

        prop_assert_eq!(encode_frame(&frame, frame.timestamp), bytes);
    }
}

/// 属性测试：短于头部的报文一律被拒绝
proptest! {
    #[test]
    fn test_short_messages_rejected(bytes in prop::collection::vec(any::<u8>(), 0..9)) {
        prop_assert!(WireMessage::decode(&bytes).is_err());
    }
}

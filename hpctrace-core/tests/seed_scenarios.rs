//! End-to-end seed scenarios (§8) exercised at the library level: build a
//! small merged trace file by hand, open it, and drive a DATA-shaped
//! request through both worker pool implementations.

use std::fs;
use std::io::Write;

use hpctrace_core::controller::SpaceTimeController;
use hpctrace_core::rank_filter::{Filter, FilterSet, Range};
use hpctrace_core::worker_pool::{DataSnapshot, DataWindow, DistributedWorkerPool, InlineWorkerPool, WorkerPool};
use tempfile::TempDir;

/// Build a merged `experiment.mt` directly (bypassing shard merge) with
/// `ranks`, each holding `records`.
fn build_database(dir: &std::path::Path, ranks: &[(i32, i32, &[(u64, u32)])]) {
    fs::write(dir.join("experiment.xml"), b"<experiment/>").unwrap();

    let mut type_flag = 0u32;
    for (pid, tid, _) in ranks {
        if *pid != 0 {
            type_flag |= 1;
        }
        if *tid != 0 {
            type_flag |= 2;
        }
    }

    let header_len = 8 + 16 * ranks.len() as u64;
    let mut starts = Vec::new();
    let mut offset = header_len;
    for (_, _, records) in ranks {
        starts.push(offset);
        offset += records.len() as u64 * 12;
    }

    let mut f = fs::File::create(dir.join("experiment.mt")).unwrap();
    f.write_all(&type_flag.to_be_bytes()).unwrap();
    f.write_all(&(ranks.len() as u32).to_be_bytes()).unwrap();
    for (i, (pid, tid, _)) in ranks.iter().enumerate() {
        f.write_all(&(*pid as u32).to_be_bytes()).unwrap();
        f.write_all(&(*tid as u32).to_be_bytes()).unwrap();
        f.write_all(&starts[i].to_be_bytes()).unwrap();
    }
    for (_, _, records) in ranks {
        for (t, c) in *records {
            f.write_all(&t.to_be_bytes()).unwrap();
            f.write_all(&c.to_be_bytes()).unwrap();
        }
    }
    f.write_all(&0xFFFFFFFFDEADF00Du64.to_be_bytes()).unwrap();
}

fn open_controller(dir: &std::path::Path) -> SpaceTimeController {
    SpaceTimeController::open(dir.join("experiment.xml"), dir.join("experiment.mt"), 4096, 8 * 1024 * 1024).unwrap()
}

fn run_inline(controller: &SpaceTimeController, window: DataWindow) -> Vec<hpctrace_core::RankReply> {
    let snapshot = DataSnapshot {
        paged_file: controller.paged_file(),
        rank_index: controller.rank_index(),
        rank_filter: controller.rank_filter(),
    };
    let mut pool = InlineWorkerPool::new();
    pool.dispatch_data(snapshot, window).unwrap();
    let mut out = Vec::new();
    pool.collect_into(&mut |r| {
        out.push(r);
        Ok(())
    })
    .unwrap();
    out
}

#[test]
fn s1_minimal_two_rank_database() {
    let tmp = TempDir::new().unwrap();
    build_database(
        tmp.path(),
        &[(0, 0, &[(100, 1), (200, 2), (300, 3)]), (1, 0, &[(100, 1), (200, 2), (300, 3)])],
    );
    let controller = open_controller(tmp.path());
    assert_eq!(controller.rank_count(), 2);

    let window = DataWindow { rank_lo: 0, rank_hi: 2, t_lo: 100, t_hi: 300, pixels_h: 10, pixels_v: 2, compress: true };
    let replies = run_inline(&controller, window);
    assert_eq!(replies.len(), 2);
    for r in &replies {
        assert_eq!(r.entry_count, 3);
    }
}

#[test]
fn s1_uncompressed_body_is_plain_delta_stream() {
    let tmp = TempDir::new().unwrap();
    build_database(tmp.path(), &[(0, 0, &[(100, 1), (200, 2), (300, 3)])]);
    let controller = open_controller(tmp.path());

    let window = DataWindow { rank_lo: 0, rank_hi: 1, t_lo: 100, t_hi: 300, pixels_h: 10, pixels_v: 1, compress: false };
    let replies = run_inline(&controller, window);
    assert_eq!(replies.len(), 1);
    let reply = &replies[0];
    assert_eq!(reply.body.len(), 8 * reply.entry_count as usize);
    let decoded = hpctrace_core::compression::decode_rank_body(&reply.body, reply.begin_time);
    assert_eq!(decoded.iter().map(|r| (r.time, r.context_id)).collect::<Vec<_>>(), vec![(100, 1), (200, 2), (300, 3)]);
}

#[test]
fn s2_oversampled_single_rank() {
    let tmp = TempDir::new().unwrap();
    let records: Vec<(u64, u32)> = (0..1000u64).map(|i| (i * 10, (i % 7) as u32)).collect();
    build_database(tmp.path(), &[(0, 0, &records)]);
    let controller = open_controller(tmp.path());

    let window = DataWindow { rank_lo: 0, rank_hi: 1, t_lo: 0, t_hi: 9999, pixels_h: 100, pixels_v: 1, compress: true };
    let replies = run_inline(&controller, window);
    assert_eq!(replies.len(), 1);
    assert!(replies[0].entry_count >= 100 && replies[0].entry_count <= 102);
}

#[test]
fn s3_filter_excludes_every_rank() {
    let tmp = TempDir::new().unwrap();
    build_database(tmp.path(), &[(0, 0, &[(1, 1)]), (0, 0, &[(2, 2)])]);
    let mut controller = open_controller(tmp.path());
    assert_eq!(controller.rank_count(), 2);

    let filter_set = FilterSet {
        filters: vec![Filter {
            process: Range { min: 0, max: 0, stride: 1 },
            thread: Range { min: 0, max: 0, stride: 1 },
        }],
        polarity: true,
    };
    controller.apply_filters(filter_set);
    assert_eq!(controller.rank_count(), 0);
}

#[test]
fn s6_distributed_even_split() {
    let tmp = TempDir::new().unwrap();
    build_database(
        tmp.path(),
        &[
            (0, 0, &[(0, 1), (10, 2)]),
            (1, 0, &[(0, 1), (10, 2)]),
            (2, 0, &[(0, 1), (10, 2)]),
            (3, 0, &[(0, 1), (10, 2)]),
        ],
    );
    let controller = open_controller(tmp.path());
    let window = DataWindow { rank_lo: 0, rank_hi: 4, t_lo: 0, t_hi: 10, pixels_h: 10, pixels_v: 4, compress: true };

    let snapshot = DataSnapshot {
        paged_file: controller.paged_file(),
        rank_index: controller.rank_index(),
        rank_filter: controller.rank_filter(),
    };
    let mut pool = DistributedWorkerPool::new(3); // 1 coordinator + 2 workers
    pool.dispatch_data(snapshot, window).unwrap();
    let mut lines: Vec<i32> = Vec::new();
    pool.collect_into(&mut |r| {
        lines.push(r.cursor_line);
        Ok(())
    })
    .unwrap();
    lines.sort();
    assert_eq!(lines, vec![0, 1, 2, 3]);
}

//! End-to-end capture scenarios against the in-process host and source

use std::collections::HashSet;
use std::path::Path;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use netcap_rs::shard::util;
use netcap_rs::{LifecycleState, LocalHost, LocalPacketSource, Pipeline, PipelineConfig, CSV_HEADER};

const UDP: u8 = 17;
const TCP: u8 = 6;

fn ipv4_frame(protocol: u8, src: [u8; 4], dst: [u8; 4], transport: &[u8]) -> Vec<u8> {
    let mut frame = vec![0x02, 0, 0, 0, 0, 0x01, 0x02, 0, 0, 0, 0, 0x02, 0x08, 0x00];
    let total_len = (20 + transport.len()) as u16;
    frame.extend_from_slice(&[0x45, 0x00]);
    frame.extend_from_slice(&total_len.to_be_bytes());
    frame.extend_from_slice(&[0x00, 0x01, 0x00, 0x00, 0x40, protocol, 0x00, 0x00]);
    frame.extend_from_slice(&src);
    frame.extend_from_slice(&dst);
    frame.extend_from_slice(transport);
    frame
}

fn udp_frame(src_port: u16, dst_port: u16) -> Vec<u8> {
    let mut header = Vec::new();
    header.extend_from_slice(&src_port.to_be_bytes());
    header.extend_from_slice(&dst_port.to_be_bytes());
    header.extend_from_slice(&[0x00, 0x08, 0x00, 0x00]);
    ipv4_frame(UDP, [10, 0, 0, 1], [10, 0, 0, 2], &header)
}

fn tcp_frame(src_port: u16, dst_port: u16) -> Vec<u8> {
    let mut header = Vec::new();
    header.extend_from_slice(&src_port.to_be_bytes());
    header.extend_from_slice(&dst_port.to_be_bytes());
    header.extend_from_slice(&[0, 0, 0, 1, 0, 0, 0, 0, 0x50, 0x02, 0xff, 0xff, 0, 0, 0, 0]);
    ipv4_frame(TCP, [192, 168, 0, 1], [192, 168, 0, 2], &header)
}

fn config(dir: &Path) -> PipelineConfig {
    PipelineConfig::default()
        .with_base_dir(dir.join("traffic_data"))
        .with_merged_dir(dir.join("merged_data"))
        .with_queue_capacity(4096)
        .with_write_buffer_size(64 * 1024)
        .with_flush_interval(Duration::from_secs(3600))
        .with_merge_interval(Duration::from_secs(3600))
}

fn sequence_of(row: &str) -> u64 {
    row.split(',').next().and_then(|s| s.parse().ok()).unwrap()
}

#[test_log::test]
fn three_udp_and_one_tcp_land_one_per_shard() -> anyhow::Result<()> {
    let dir = tempfile::tempdir()?;
    let config = config(dir.path()).with_shard_count(4);
    let source = Arc::new(LocalPacketSource::inline());
    let pipeline = Pipeline::new(config.clone(), Arc::new(LocalHost::new()), source.clone());

    pipeline.start()?;
    source.submit_frame(&udp_frame(5001, 53))?;
    source.submit_frame(&udp_frame(5002, 53))?;
    source.submit_frame(&udp_frame(5003, 53))?;
    source.submit_frame(&tcp_frame(40000, 80))?;

    pipeline.flush_all()?;
    for id in 0..4 {
        let rows = util::read_data_rows(&config.shard_path(id))?;
        assert_eq!(rows.len(), 1, "shard {}", id);
        assert_eq!(sequence_of(&rows[0]), id as u64 + 1);
    }

    let report = pipeline.merge_now()?;
    assert_eq!(report.rows, 4);

    let merged = std::fs::read_to_string(config.merged_path())?;
    let lines: Vec<&str> = merged.lines().collect();
    assert_eq!(format!("{}\n", lines[0]), CSV_HEADER);
    assert_eq!(lines.len(), 5);
    let protocols: Vec<&str> = lines[1..].iter().map(|l| l.split(',').nth(4).unwrap()).collect();
    assert_eq!(protocols, vec!["UDP", "UDP", "UDP", "TCP"]);
    assert!(lines[1].starts_with("1,"));
    assert!(lines[1].contains(",10.0.0.1,10.0.0.2,UDP,28,SrcPort:5001,DstPort:53"));
    assert!(lines[4].ends_with(",192.168.0.1,192.168.0.2,TCP,40,SrcPort:40000,DstPort:80"));

    for id in 0..4 {
        assert!(util::is_header_only(&config.shard_path(id))?);
    }

    pipeline.stop();
    assert_eq!(pipeline.state(), LifecycleState::Stopped);

    Ok(())
}

#[test_log::test]
fn saturated_queue_drops_without_blocking() -> anyhow::Result<()> {
    let dir = tempfile::tempdir()?;
    let config = config(dir.path())
        .with_shard_count(1)
        .with_queue_capacity(2)
        .with_offer_timeout(Duration::from_micros(50));
    let source = Arc::new(LocalPacketSource::inline());
    let pipeline = Pipeline::new(config.clone(), Arc::new(LocalHost::new()), source.clone());
    pipeline.start()?;

    let start = Instant::now();
    for port in 1..=5 {
        source.submit_frame(&udp_frame(port, 53))?;
    }
    assert!(start.elapsed() < Duration::from_secs(1));

    let metrics = pipeline.metrics();
    assert_eq!(metrics.records_admitted, 2);
    assert_eq!(metrics.records_dropped, 3);

    let report = pipeline.merge_now()?;
    assert_eq!(report.rows, 2);
    let sequences: Vec<u64> = util::read_data_rows(&config.merged_path())?
        .iter()
        .map(|row| sequence_of(row))
        .collect();
    assert_eq!(sequences, vec![1, 2]);

    pipeline.stop();
    Ok(())
}

#[test]
fn concurrent_producers_with_timers() -> anyhow::Result<()> {
    let dir = tempfile::tempdir()?;
    let config = config(dir.path())
        .with_shard_count(4)
        .with_batch_size(50)
        .with_flush_interval(Duration::from_millis(5))
        .with_merge_interval(Duration::from_millis(40));
    let source = Arc::new(LocalPacketSource::with_backlog(2, 256)?);
    let pipeline = Pipeline::new(config.clone(), Arc::new(LocalHost::new()), source.clone());
    pipeline.start()?;

    let producers = 4;
    let per_producer = 250u16;
    let handles: Vec<_> = (0..producers)
        .map(|_| {
            let source = source.clone();
            thread::spawn(move || {
                for port in 0..per_producer {
                    source.submit_frame(&udp_frame(port, 53)).unwrap();
                }
            })
        })
        .collect();
    for handle in handles {
        handle.join().unwrap();
    }
    assert!(source.wait_idle(Duration::from_secs(10)));

    let mut seen = HashSet::new();
    let mut collect = |path: &Path| -> anyhow::Result<()> {
        for row in util::read_data_rows(path)? {
            assert!(seen.insert(sequence_of(&row)), "row merged twice: {}", row);
        }
        Ok(())
    };

    // Each merge replaces the previous snapshot, so read every one we drive
    loop {
        let report = pipeline.merge_now()?;
        collect(&report.path)?;
        if report.rows == 0 && pipeline.stats()?.shards.pending_records == 0 {
            break;
        }
    }
    pipeline.stop();

    let total = producers as u64 * per_producer as u64;
    let metrics = pipeline.metrics();
    assert_eq!(metrics.records_dropped, 0);
    assert_eq!(metrics.records_admitted, total);
    // Scheduled merges may have consumed rows before the driven ones
    assert!(seen.len() as u64 <= total);
    assert_eq!(metrics.rows_merged, total);

    Ok(())
}

#[test]
fn restart_after_stop() -> anyhow::Result<()> {
    let dir = tempfile::tempdir()?;
    let config = config(dir.path());
    let source = Arc::new(LocalPacketSource::inline());
    let pipeline = Pipeline::new(config.clone(), Arc::new(LocalHost::new()), source.clone());

    for round in 0..3u16 {
        pipeline.start()?;
        source.submit_frame(&udp_frame(round, 53))?;
        source.submit_frame(&udp_frame(round, 54))?;
        pipeline.stop();

        let rows = util::read_data_rows(&config.merged_path())?;
        let sequences: Vec<u64> = rows.iter().map(|row| sequence_of(row)).collect();
        assert_eq!(sequences, vec![1, 2], "round {}", round);
    }

    // Packets submitted while stopped go nowhere
    source.submit_frame(&udp_frame(9, 9))?;
    assert_eq!(source.processor_count(), 0);

    Ok(())
}

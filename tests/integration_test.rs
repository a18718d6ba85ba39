use ddb::device::{AnyDevice, BlockOp, ReadFlags};
use ddb::{CopyConfig, CopyEngine, ImageContainer, Sequence};
use tempfile::tempdir;

#[test]
fn sparse_image_create_write_reopen() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("image.img");
    let total = 512u64 * 2048;

    {
        let mut img = ImageContainer::create(&path, 512, total, true).unwrap();
        let mut batch = vec![BlockOp::new(42, 512)];
        batch[0].buffer = vec![1u8; 512];
        img.write_multi(&mut batch).unwrap();
        let mut batch = vec![BlockOp::new(1042, 512)];
        batch[0].buffer = vec![2u8; 512];
        img.write_multi(&mut batch).unwrap();
        img.close().unwrap();
    }

    let mut img = ImageContainer::open(&path, false, None, None).unwrap();
    assert!(img.blocks().has(42));
    assert!(img.blocks().has(1042));
    assert_eq!(img.copy_range().count(), 2048);

    let mut batch = vec![BlockOp::new(42, 512)];
    img.read_multi(&mut batch, ReadFlags::default()).unwrap();
    assert!(batch[0].buffer.iter().all(|&b| b == 1));

    let mut batch = vec![BlockOp::new(500, 512)];
    img.read_multi(&mut batch, ReadFlags::default()).unwrap();
    assert!(batch[0].buffer.iter().all(|&b| b == 0));
}

#[test]
fn sequence_layered_read_and_join() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("seq");

    let mut seq = Sequence::create(&path, 512, 512 * 16).unwrap();
    for b in 0..16u64 {
        let mut batch = vec![BlockOp::new(b, 512)];
        batch[0].buffer = vec![10u8; 512];
        seq.write_multi(&mut batch).unwrap();
    }
    seq.close().unwrap();

    let mut seq = Sequence::open(&path, true, Some(false)).unwrap();
    for &b in &[5u64, 10] {
        let mut batch = vec![BlockOp::new(b, 512)];
        batch[0].buffer = vec![20u8; 512];
        seq.write_multi(&mut batch).unwrap();
    }
    seq.close().unwrap();

    let mut seq = Sequence::open(&path, true, Some(false)).unwrap();
    for &b in &[3u64, 7, 10] {
        let mut batch = vec![BlockOp::new(b, 512)];
        batch[0].buffer = vec![30u8; 512];
        seq.write_multi(&mut batch).unwrap();
    }
    seq.close().unwrap();

    let mut seq = Sequence::open(&path, false, None).unwrap();
    let mut batch = vec![BlockOp::new(3, 512)];
    seq.read_multi(&mut batch, ReadFlags::default()).unwrap();
    assert!(batch[0].buffer.iter().all(|&b| b == 30));

    let mut batch = vec![BlockOp::new(5, 512)];
    seq.read_multi(&mut batch, ReadFlags::default()).unwrap();
    assert!(batch[0].buffer.iter().all(|&b| b == 20));

    let mut batch = vec![BlockOp::new(10, 512)];
    seq.read_multi(&mut batch, ReadFlags::default()).unwrap();
    assert!(batch[0].buffer.iter().all(|&b| b == 30));

    let mut batch = vec![BlockOp::new(0, 512)];
    seq.read_multi(&mut batch, ReadFlags::default()).unwrap();
    assert!(batch[0].buffer.iter().all(|&b| b == 10));
    drop(seq);

    let mut seq = Sequence::open(&path, true, None).unwrap();
    seq.join().unwrap();
    let mut batch = vec![BlockOp::new(5, 512)];
    seq.read_multi(&mut batch, ReadFlags::default()).unwrap();
    assert!(batch[0].buffer.iter().all(|&b| b == 20));

    let remaining: Vec<_> = std::fs::read_dir(&path)
        .unwrap()
        .filter_map(|e| e.ok())
        .filter(|e| e.file_name().to_string_lossy().starts_with("incr-"))
        .collect();
    assert_eq!(remaining.len(), 1, "join should remove the oldest incremental only");
}

#[test]
fn copy_engine_skips_identical_blocks_with_checksums() {
    let dir = tempdir().unwrap();
    let src_path = dir.path().join("src.img");
    let dst_path = dir.path().join("dst.img");

    let mut src = ImageContainer::create(&src_path, 512, 512 * 1024, true).unwrap();
    for b in 0..1024u64 {
        let mut batch = vec![BlockOp::new(b, 512)];
        batch[0].buffer = vec![(b % 251) as u8; 512];
        src.write_multi(&mut batch).unwrap();
    }

    let mut dst = ImageContainer::create(&dst_path, 512, 512 * 1024, true).unwrap();
    for b in 0..512u64 {
        let mut batch = vec![BlockOp::new(b, 512)];
        batch[0].buffer = vec![(b % 251) as u8; 512];
        dst.write_multi(&mut batch).unwrap();
    }

    let mut src_dev = AnyDevice::Image(src);
    let mut dst_dev = AnyDevice::Image(dst);

    let config = CopyConfig {
        write_dst: true,
        use_checksums: true,
        skip_identical: true,
        output_each_pass: false,
        extra_report: false,
        block_size: 512,
        max_passes: 2,
        progress_interval: 0,
        progress_sleep: 0,
        flush_interval: 0,
        checkpoint_interval: 0,
        machine_progress_interval: 0,
        input_list: None,
        output_list: None,
        copied_list: None,
        checkpoint_file: None,
        machine_progress_file: None,
    };
    let mut engine = CopyEngine::new(config);
    let result = engine.run(&mut src_dev, &mut dst_dev, &mut |_| {}).unwrap();
    assert_eq!(result, 1);

    for b in 0..1024u64 {
        let mut s = vec![BlockOp::new(b, 512)];
        src_dev.read_multi(&mut s, ReadFlags::default()).unwrap();
        let mut d = vec![BlockOp::new(b, 512)];
        dst_dev.read_multi(&mut d, ReadFlags::default()).unwrap();
        assert_eq!(s[0].buffer, d[0].buffer, "block {b} mismatch");
    }
}

#[test]
fn checkpoint_resume_continues_at_next_pass() {
    use ddb::Checkpoint;

    let dir = tempdir().unwrap();
    let checkpoint_path = dir.path().join("ckpt");

    let mut to_retry = ddb::BlockRangeSet::new();
    to_retry.add(0, 16);
    let cp = Checkpoint {
        header: ddb::checkpoint::CheckpointHeader {
            total_size: 512 * 1024,
            pass_size: 1024,
            blocks_read: 1007,
            read_errors: 17,
            blocks_written: 1007,
            blocks_skipped: 0,
            checksum_equal: 0,
            write_errors: 0,
            block_size: 512,
            pass: 1,
        },
        to_copy: to_retry.clone(),
        to_retry: to_retry.clone(),
        copied: ddb::BlockRangeSet::new(),
    };
    cp.save_atomic(&checkpoint_path).unwrap();

    let src_path = dir.path().join("src.img");
    let dst_path = dir.path().join("dst.img");
    let mut src = ImageContainer::create(&src_path, 512, 512 * 1024, true).unwrap();
    for b in 0..1024u64 {
        let mut batch = vec![BlockOp::new(b, 512)];
        batch[0].buffer = vec![1u8; 512];
        src.write_multi(&mut batch).unwrap();
    }
    let dst = ImageContainer::create(&dst_path, 512, 512 * 1024, true).unwrap();

    let mut src_dev = AnyDevice::Image(src);
    let mut dst_dev = AnyDevice::Image(dst);

    let config = CopyConfig {
        write_dst: true,
        use_checksums: false,
        skip_identical: false,
        output_each_pass: false,
        extra_report: false,
        block_size: 512,
        max_passes: 2,
        progress_interval: 0,
        progress_sleep: 0,
        flush_interval: 0,
        checkpoint_interval: 0,
        machine_progress_interval: 0,
        input_list: None,
        output_list: None,
        copied_list: None,
        checkpoint_file: Some(checkpoint_path),
        machine_progress_file: None,
    };
    let mut engine = CopyEngine::new(config);
    let result = engine.run(&mut src_dev, &mut dst_dev, &mut |_| {}).unwrap();
    assert_eq!(result, 1);
}

use criterion::{criterion_group, criterion_main, Criterion};
use ddb::device::{AnyDevice, BlockOp};
use ddb::{CopyConfig, CopyEngine, ImageContainer};
use tempfile::tempdir;

fn bench_full_pass_copy(c: &mut Criterion) {
    c.bench_function("copy_engine_full_pass_4096_blocks", |b| {
        b.iter(|| {
            let dir = tempdir().unwrap();
            let src_path = dir.path().join("src.img");
            let dst_path = dir.path().join("dst.img");

            let mut src = ImageContainer::create(&src_path, 512, 512 * 4096, true).unwrap();
            for blk in 0..4096u64 {
                let mut batch = vec![BlockOp::new(blk, 512)];
                batch[0].buffer = vec![(blk % 251) as u8; 512];
                src.write_multi(&mut batch).unwrap();
            }
            let dst = ImageContainer::create(&dst_path, 512, 512 * 4096, true).unwrap();

            let mut src_dev = AnyDevice::Image(src);
            let mut dst_dev = AnyDevice::Image(dst);
            let mut engine = CopyEngine::new(CopyConfig {
                write_dst: true,
                use_checksums: false,
                skip_identical: false,
                output_each_pass: false,
                extra_report: false,
                block_size: 512,
                max_passes: 1,
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
            });
            engine.run(&mut src_dev, &mut dst_dev, &mut |_| {}).unwrap()
        })
    });
}

criterion_group!(benches, bench_full_pass_copy);
criterion_main!(benches);

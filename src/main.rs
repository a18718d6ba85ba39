use clap::{Parser, Subcommand};
use ddb::device::AnyDevice;
use ddb::{CopyConfig, CopyEngine, ImageContainer, Sequence};
use std::path::PathBuf;
use std::process::ExitCode;

#[derive(Parser)]
#[command(name = "ddb", version = "1.0.0", about = "Block-level backup and replication engine")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Copy blocks from src to dst with multi-pass retry and checkpointing
    Backup {
        src: PathBuf,
        dst: Option<PathBuf>,
        #[arg(short = 'b', long, default_value = "512")]
        block_size: u64,
        #[arg(short = 'c', long)]
        checkpoint: Option<PathBuf>,
        #[arg(short = 'n', long)]
        dry_run: bool,
        #[arg(short = 'p', long, default_value = "1")]
        max_passes: u32,
        #[arg(short = 'w', long)]
        unconditional_write: bool,
        #[arg(short = 'x', long)]
        exclusive_create: bool,
        #[arg(long)]
        use_checksums: bool,
        #[arg(long)]
        skip_identical: bool,
    },
    /// Print per-device metadata
    Info {
        source: Vec<PathBuf>,
        /// Show complete list of blocks present
        #[arg(short = 'b', long)]
        blocks: bool,
    },
    /// Operate on a backup sequence directory
    Sequence {
        dir: PathBuf,
        /// Print sequence info
        #[arg(short = 'i', long)]
        info: bool,
        /// Join the oldest incremental into the full
        #[arg(short = 'j', long)]
        join: bool,
        /// Rebuild the checksum side-file cache
        #[arg(short = 'c', long)]
        checksum: bool,
        /// Machine-readable output
        #[arg(short = 'm', long)]
        machine: bool,
    },
}

fn main() -> ExitCode {
    env_logger::init();
    match Cli::parse().command {
        Commands::Backup {
            src,
            dst,
            block_size,
            checkpoint,
            dry_run,
            max_passes,
            unconditional_write,
            exclusive_create,
            use_checksums,
            skip_identical,
        } => run_backup(
            src,
            dst,
            block_size,
            checkpoint,
            dry_run,
            max_passes,
            unconditional_write,
            exclusive_create,
            use_checksums,
            skip_identical,
        ),
        Commands::Info { source, blocks } => run_info(source, blocks),
        Commands::Sequence { dir, info, join, checksum, machine } => {
            run_sequence(dir, info, join, checksum, machine)
        }
    }
}

#[allow(clippy::too_many_arguments)]
fn run_backup(
    src: PathBuf,
    dst: Option<PathBuf>,
    block_size: u64,
    checkpoint: Option<PathBuf>,
    dry_run: bool,
    max_passes: u32,
    unconditional_write: bool,
    exclusive_create: bool,
    use_checksums: bool,
    skip_identical: bool,
) -> ExitCode {
    let _ = unconditional_write; // reserved: engine always writes unless dry_run today

    let src_img = match ImageContainer::open(&src, false, Some(block_size), None) {
        Ok(i) => i,
        Err(e) => {
            eprintln!("ddb: {}: {e}", src.display());
            return ExitCode::from(2);
        }
    };
    let total_size = src_img.info().total_size;

    let dst_path = match &dst {
        Some(p) => p.clone(),
        None => {
            eprintln!("ddb: no destination given");
            return ExitCode::from(1);
        }
    };

    let dst_img = if dst_path.exists() {
        if exclusive_create {
            eprintln!("ddb: {}: already exists", dst_path.display());
            return ExitCode::from(2);
        }
        match ImageContainer::open(&dst_path, true, Some(block_size), Some(total_size)) {
            Ok(i) => i,
            Err(e) => {
                eprintln!("ddb: {}: {e}", dst_path.display());
                return ExitCode::from(2);
            }
        }
    } else {
        match ImageContainer::create(&dst_path, block_size, total_size, true) {
            Ok(i) => i,
            Err(e) => {
                eprintln!("ddb: {}: {e}", dst_path.display());
                return ExitCode::from(2);
            }
        }
    };

    let mut src_dev = AnyDevice::Image(src_img);
    let mut dst_dev = AnyDevice::Image(dst_img);

    let config = CopyConfig {
        write_dst: !dry_run,
        use_checksums,
        skip_identical,
        output_each_pass: false,
        extra_report: false,
        block_size,
        max_passes,
        progress_interval: 0,
        progress_sleep: 0,
        flush_interval: 0,
        checkpoint_interval: if checkpoint.is_some() { 64 } else { 0 },
        machine_progress_interval: 0,
        input_list: None,
        output_list: None,
        copied_list: None,
        checkpoint_file: checkpoint,
        machine_progress_file: None,
    };
    let mut engine = CopyEngine::new(config);
    let result = engine.run(&mut src_dev, &mut dst_dev, &mut |line| println!("{line}"));

    match result {
        Ok(1) => ExitCode::from(0),
        Ok(_) => ExitCode::from(3),
        Err(e) => {
            eprintln!("ddb: backup: {e}");
            ExitCode::from(2)
        }
    }
}

fn run_info(sources: Vec<PathBuf>, list_blocks: bool) -> ExitCode {
    for path in &sources {
        let img = match ImageContainer::open(path, false, None, None) {
            Ok(i) => i,
            Err(e) => {
                eprintln!("ddb: {}: {e}", path.display());
                return ExitCode::from(2);
            }
        };
        let info = img.info();
        println!("{}", path.display());
        println!("  block_size      {}", info.block_size);
        println!("  total_size      {}", info.total_size);
        println!("  num_blocks      {}", info.num_blocks);
        println!("  blocks_present  {}", img.blocks().count());
        if list_blocks {
            let mut buf = Vec::new();
            let _ = img.blocks().print(&mut buf);
            print!("{}", String::from_utf8_lossy(&buf));
        }
        println!();
    }
    ExitCode::from(0)
}

fn run_sequence(dir: PathBuf, info: bool, join: bool, checksum: bool, machine: bool) -> ExitCode {
    let writable = join || checksum;
    let mut seq = match Sequence::open(&dir, writable, Some(false)) {
        Ok(s) => s,
        Err(e) => {
            eprintln!("ddb: {}: {e}", dir.display());
            return ExitCode::from(2);
        }
    };

    if info {
        let dinfo = seq.info();
        if machine {
            println!("{} {} {}", dinfo.block_size, dinfo.total_size, dinfo.num_blocks);
        } else {
            println!("block_size   {}", dinfo.block_size);
            println!("total_size   {}", dinfo.total_size);
            println!("num_blocks   {}", dinfo.num_blocks);
            println!("present      {}", seq.blocks().count());
        }
    }

    if join {
        if let Err(e) = seq.join() {
            eprintln!("ddb: sequence: join: {e}");
            return ExitCode::from(2);
        }
        println!("join complete");
    }

    if checksum {
        if let Err(e) = seq.build_checksum_cache() {
            eprintln!("ddb: sequence: checksum: {e}");
            return ExitCode::from(2);
        }
        println!("checksum cache rebuilt");
    }

    if let Err(e) = seq.close() {
        eprintln!("ddb: sequence: close: {e}");
        return ExitCode::from(2);
    }
    ExitCode::from(0)
}

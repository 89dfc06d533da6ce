//! Copy a file through the buffer broker, hashing the stream.
//!
//! Demonstrates the event-handler waiter flavour: the foreground loop
//! blocks on a [`BufferEventQueue`] whenever the reader or writer asks
//! it to wait.

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use clap::Parser;
use digest::Digest;
use sha1::Sha1;

use spool::{
    AioEventHandler, AioReader, AioResult, AioWriter, BufferEventQueue, BufferPool,
    FileReaderFactory, FileWriterFactory, FileWriterOptions, PoolConfig, ProgressFn,
    ReaderFactory, WaiterRef, WriterFactory, NOSIZE,
};

#[derive(Parser)]
#[command(name = "spool-copy", about = "Copy a file through pooled buffers, hashing the stream")]
struct Args {
    /// File to read.
    input: PathBuf,
    /// File to write.
    output: PathBuf,
    /// Sync the output to disk as part of finalize.
    #[arg(long)]
    fsync: bool,
    /// Number of pool buffers.
    #[arg(long, default_value_t = 8)]
    buffers: usize,
}

fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let args = Args::parse();
    match run(&args) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            tracing::error!("{err}");
            ExitCode::FAILURE
        }
    }
}

fn run(args: &Args) -> Result<(), Box<dyn std::error::Error>> {
    let pool = BufferPool::with_config(PoolConfig {
        buffer_count: args.buffers,
        ..PoolConfig::default()
    })?;

    let reader_factory = FileReaderFactory::new(&args.input);
    let writer_factory =
        FileWriterFactory::with_options(&args.output, FileWriterOptions { fsync: args.fsync });

    let mut reader = reader_factory.open(&pool, 0, NOSIZE, 0)?;

    let written = Arc::new(AtomicU64::new(0));
    let progress: ProgressFn = {
        let written = Arc::clone(&written);
        Box::new(move |n| {
            written.fetch_add(n, Ordering::Relaxed);
        })
    };
    let mut writer = writer_factory.open(0, Some(progress), 0)?;

    let events = BufferEventQueue::new();
    let handler = Arc::clone(&events) as Arc<dyn AioEventHandler>;
    let mut hasher = Sha1::new();
    let mut pulled = 0u64;

    loop {
        match reader.get_buffer(WaiterRef::Events(&handler)) {
            (AioResult::Wait, _) => {
                events.next();
            }
            (AioResult::Error, _) => return Err(format!("could not read {}", args.input.display()).into()),
            (AioResult::Ok, None) => break,
            (AioResult::Ok, Some(lease)) => {
                hasher.update(lease.readable());
                pulled += lease.len() as u64;
                match writer.add_buffer(lease, WaiterRef::Events(&handler)) {
                    AioResult::Ok => {}
                    AioResult::Wait => {
                        events.next();
                    }
                    AioResult::Error => {
                        return Err(format!("could not write {}", args.output.display()).into())
                    }
                }
            }
        }
    }

    loop {
        match writer.finalize(WaiterRef::Events(&handler)) {
            AioResult::Ok => break,
            AioResult::Wait => {
                events.next();
            }
            AioResult::Error => {
                return Err(format!("could not finalize {}", args.output.display()).into())
            }
        }
    }
    writer.close();
    reader.close();

    let digest = hasher.finalize();
    let hex: String = digest.iter().map(|b| format!("{b:02x}")).collect();
    println!(
        "copied {pulled} bytes ({} written), sha1 {hex}",
        written.load(Ordering::Relaxed)
    );
    Ok(())
}

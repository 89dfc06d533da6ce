//! Buffer contention across concurrent pipelines.

mod common;

use std::fs;
use std::sync::{Arc, Mutex};
use std::thread;

use common::test_data;
use spool::{
    pump, AioReader, BufferPool, BufferWriter, FileReaderFactory, PoolConfig, ReaderFactory,
    NOSIZE,
};
use tempfile::tempdir;

#[test]
fn two_readers_share_a_two_buffer_pool() {
    let dir = tempdir().unwrap();
    let first = dir.path().join("first.bin");
    let second = dir.path().join("second.bin");
    let first_data = test_data(1_000_000);
    let second_data: Vec<u8> = test_data(1_000_000).iter().map(|b| !b).collect();
    fs::write(&first, &first_data).unwrap();
    fs::write(&second, &second_data).unwrap();

    let pool = BufferPool::with_config(PoolConfig {
        buffer_count: 2,
        buffer_size: 16 * 1024,
        ..PoolConfig::default()
    })
    .unwrap();

    let mut workers = Vec::new();
    for path in [first.clone(), second.clone()] {
        let pool = Arc::clone(&pool);
        workers.push(thread::spawn(move || {
            // Each reader would happily queue four buffers; the pool
            // only has two between both pipelines.
            let mut reader = FileReaderFactory::new(&path)
                .open(&pool, 0, NOSIZE, 4)
                .unwrap();
            let sink = Arc::new(Mutex::new(Vec::new()));
            let mut writer =
                BufferWriter::new("sink", Arc::clone(&sink), usize::MAX, None);
            let moved = pump(reader.as_mut(), &mut writer).unwrap();
            reader.close();
            drop(writer);
            (moved, Arc::try_unwrap(sink).unwrap().into_inner().unwrap())
        }));
    }

    let mut outputs = Vec::new();
    for worker in workers {
        outputs.push(worker.join().unwrap());
    }

    assert_eq!(outputs[0].0, first_data.len() as u64);
    assert_eq!(outputs[0].1, first_data);
    assert_eq!(outputs[1].0, second_data.len() as u64);
    assert_eq!(outputs[1].1, second_data);

    // Every lease went home.
    assert_eq!(pool.available(), 2);
}

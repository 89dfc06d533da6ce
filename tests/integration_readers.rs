//! Window and rewind behaviour through the public factory API.

mod common;

use std::fs;
use std::sync::{Arc, Mutex};

use common::copy_hashed;
use spool::{
    AioReader, BufferPool, BufferWriterFactory, FileReaderFactory, MemReaderFactory,
    ReaderFactory, WriterFactory, NOSIZE,
};
use tempfile::tempdir;

fn sink_factory(sink: &Arc<Mutex<Vec<u8>>>) -> BufferWriterFactory {
    BufferWriterFactory::new("sink", Arc::clone(sink), usize::MAX)
}

#[test]
fn bounded_view_read_delivers_the_window() {
    let pool = BufferPool::new(1).unwrap();
    let factory = MemReaderFactory::from_slice("view", b"ABCDEFGHIJ");

    let mut reader = factory.open(&pool, 3, 4, 0).unwrap();
    let sink = Arc::new(Mutex::new(Vec::new()));
    let mut writer = sink_factory(&sink).open(0, None, 0).unwrap();

    let (pulled, _) = copy_hashed(reader.as_mut(), writer.as_mut()).unwrap();
    assert_eq!(pulled, 4);
    assert_eq!(sink.lock().unwrap().as_slice(), b"DEFG");
}

#[test]
fn rewound_reader_replays_identically() {
    let pool = BufferPool::new(1).unwrap();
    let factory = MemReaderFactory::from_string("mem", "HELLO".to_string());
    let mut reader = factory.open(&pool, 0, NOSIZE, 0).unwrap();

    for _ in 0..2 {
        let sink = Arc::new(Mutex::new(Vec::new()));
        let mut writer = sink_factory(&sink).open(0, None, 0).unwrap();
        let (pulled, _) = copy_hashed(reader.as_mut(), writer.as_mut()).unwrap();
        assert_eq!(pulled, 5);
        assert_eq!(sink.lock().unwrap().as_slice(), b"HELLO");
        assert!(reader.rewind());
    }
}

#[test]
fn file_reader_rewinds_through_its_worker() {
    let dir = tempdir().unwrap();
    let input = dir.path().join("input.bin");
    fs::write(&input, b"HELLO").unwrap();

    let pool = BufferPool::new(2).unwrap();
    let mut reader = FileReaderFactory::new(&input)
        .open(&pool, 0, NOSIZE, 0)
        .unwrap();

    for _ in 0..2 {
        let sink = Arc::new(Mutex::new(Vec::new()));
        let mut writer = sink_factory(&sink).open(0, None, 0).unwrap();
        let (pulled, _) = copy_hashed(reader.as_mut(), writer.as_mut()).unwrap();
        assert_eq!(pulled, 5);
        assert_eq!(sink.lock().unwrap().as_slice(), b"HELLO");
        assert!(reader.rewind());
    }
}

#[test]
fn oversized_windows_are_rejected_at_open() {
    let pool = BufferPool::new(1).unwrap();
    let factory = MemReaderFactory::from_slice("view", b"short");
    assert!(factory.open(&pool, 0, 100, 0).is_err());
    assert!(factory.open(&pool, 100, NOSIZE, 0).is_err());
}

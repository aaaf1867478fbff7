use super::*;
use segdir_lib::{read_file, write_file, BlockSize, SegDirectory, SegError};
use std::sync::Arc;

fn pattern_data(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i % 251) as u8).collect()
}

fn create_mem_dir(block_size: BlockSize) -> (Arc<MemBlockStore>, ChunkedDirectory) {
    let store = Arc::new(MemBlockStore::new("c1/d1"));
    let dir = ChunkedDirectory::new(store.clone(), block_size);
    (store, dir)
}

#[tokio::test]
async fn test_round_trip_all_block_sizes() {
    for block_size in BlockSize::ALL {
        let (_store, dir) = create_mem_dir(block_size);
        let data = pattern_data(block_size.size() * 2 + 17);
        write_file(&dir, "seg.0", &data).await.unwrap();
        assert_eq!(dir.file_length("seg.0").await.unwrap(), data.len() as u64);
        let read_back = read_file(&dir, "seg.0").await.unwrap();
        assert_eq!(read_back, data, "block size {}", block_size);
    }
}

#[tokio::test]
async fn test_write_100k_at_32k() {
    let (store, dir) = create_mem_dir(BlockSize::Size32K);
    let data = pattern_data(100_000);

    let mut writer = dir.create_output("seg.0").await.unwrap();
    writer.write(&data).await.unwrap();
    writer.close().await.unwrap();

    // blocks 0, 1, 2 full; block 3 carries 1696 bytes
    assert_eq!(dir.file_length("seg.0").await.unwrap(), 100_000);
    assert_eq!(store.block_count(), 4);
    let last = store.get_block("seg.0", 3).await.unwrap().unwrap();
    assert_eq!(&last[..1696], &data[98_304..]);

    let mut reader = dir.open_input("seg.0").await.unwrap();
    let tail = reader.read_at(98_000, 2000).await.unwrap();
    assert_eq!(tail, data[98_000..].to_vec());
    assert_eq!(reader.read(&mut [0u8; 16]).await.unwrap(), 0);
    reader.close().await.unwrap();
}

#[tokio::test]
async fn test_length_visible_only_after_flush() {
    let (_store, dir) = create_mem_dir(BlockSize::Size1K);
    let mut writer = dir.create_output("seg.1").await.unwrap();
    writer.write(&pattern_data(100)).await.unwrap();
    // still buffered
    assert_eq!(dir.file_length("seg.1").await.unwrap(), 0);

    writer.flush().await.unwrap();
    assert_eq!(dir.file_length("seg.1").await.unwrap(), 100);

    writer.write(&pattern_data(2048)).await.unwrap();
    let mid = dir.file_length("seg.1").await.unwrap();
    assert!(mid >= 100);
    writer.close().await.unwrap();
    assert_eq!(dir.file_length("seg.1").await.unwrap(), 2148);
}

#[tokio::test]
async fn test_seek_rewrite_keeps_length() {
    let (_store, dir) = create_mem_dir(BlockSize::Size1K);
    let mut writer = dir.create_output("f").await.unwrap();
    writer.write(&vec![1u8; 3000]).await.unwrap();
    writer.seek(1020).await.unwrap();
    writer.write(&[9u8; 10]).await.unwrap();
    writer.close().await.unwrap();

    assert_eq!(dir.file_length("f").await.unwrap(), 3000);
    let data = read_file(&dir, "f").await.unwrap();
    assert_eq!(&data[1018..1032], &[1, 1, 9, 9, 9, 9, 9, 9, 9, 9, 9, 9, 1, 1]);
}

#[tokio::test]
async fn test_delete_removes_all_blocks() {
    let (store, dir) = create_mem_dir(BlockSize::Size4K);
    write_file(&dir, "seg.0", &pattern_data(10_000)).await.unwrap();
    assert_eq!(store.block_count(), 3);

    dir.delete_file("seg.0").await.unwrap();
    assert_eq!(store.block_count(), 0);
    assert!(!dir.file_exists("seg.0").await.unwrap());
    assert!(dir.delete_file("seg.0").await.unwrap_err().is_not_found());

    // a reopened name starts empty
    let reader = dir.open_input("seg.0").await.unwrap();
    assert_eq!(reader.length(), 0);
}

#[tokio::test]
async fn test_create_output_replaces_file() {
    let (store, dir) = create_mem_dir(BlockSize::Size1K);
    write_file(&dir, "f", &pattern_data(5000)).await.unwrap();
    write_file(&dir, "f", b"short").await.unwrap();
    assert_eq!(dir.file_length("f").await.unwrap(), 5);
    assert_eq!(store.block_count(), 1);
    assert_eq!(read_file(&dir, "f").await.unwrap(), b"short".to_vec());
}

#[tokio::test]
async fn test_missing_block_reads_zeros() {
    let (store, dir) = create_mem_dir(BlockSize::Size1K);
    store.set_length("sparse", 2048).await.unwrap();
    store.put_block("sparse", 1, &[5u8; 1024]).await.unwrap();

    let data = read_file(&dir, "sparse").await.unwrap();
    assert!(data[..1024].iter().all(|b| *b == 0));
    assert!(data[1024..].iter().all(|b| *b == 5));
}

#[tokio::test]
async fn test_missing_file_metadata() {
    let (_store, dir) = create_mem_dir(BlockSize::Size32K);
    assert!(dir.file_length("nope").await.unwrap_err().is_not_found());
    assert!(dir.file_modified("nope").await.unwrap_err().is_not_found());
    assert!(dir.list_all().await.unwrap().is_empty());

    dir.touch_file("nope").await.unwrap();
    assert_eq!(dir.file_length("nope").await.unwrap(), 0);
    assert_eq!(dir.list_all().await.unwrap(), vec!["nope".to_string()]);
}

#[tokio::test]
async fn test_reader_bounds() {
    let (_store, dir) = create_mem_dir(BlockSize::Size1K);
    write_file(&dir, "f", &pattern_data(1500)).await.unwrap();
    let mut reader = dir.open_input("f").await.unwrap();
    assert!(matches!(
        reader.seek(1501).await,
        Err(SegError::OffsetTooLarge(_))
    ));
    reader.seek(1400).await.unwrap();
    let mut buf = vec![0u8; 200];
    assert!(matches!(
        reader.read_exact(&mut buf).await,
        Err(SegError::OffsetTooLarge(_))
    ));
}

#[tokio::test]
async fn test_closed_writer_rejects_write() {
    let (_store, dir) = create_mem_dir(BlockSize::Size1K);
    let mut writer = dir.create_output("f").await.unwrap();
    writer.close().await.unwrap();
    writer.close().await.unwrap();
    assert!(matches!(
        writer.write(b"x").await,
        Err(SegError::InvalidState(_))
    ));
}

#[tokio::test]
async fn test_sqlite_chunked_directory() {
    let db = Arc::new(SqliteBlockStoreDB::open_in_memory().unwrap());
    let dir = ChunkedDirectory::new(
        Arc::new(SqliteBlockStore::new(db, "c1/d1")),
        BlockSize::Size32K,
    );
    let data = pattern_data(100_000);
    write_file(&dir, "_0.cfs", &data).await.unwrap();
    assert_eq!(read_file(&dir, "_0.cfs").await.unwrap(), data);
    assert_eq!(dir.list_all().await.unwrap(), vec!["_0.cfs".to_string()]);
    assert!(dir.describe().contains("c1/d1"));
}

use std::sync::Arc;

use dedupe_common::DEFAULT_SPARSE_SAMPLE_RATE;
use dedupe_index::{BlockStore, GeometryConfig, Index, IndexConfig, MemoryStore, OpenMode};
use dedupe_types::{
    record::{RecordData, RecordName},
    request::{IndexRegion, Request},
};

const RECORDS_PER_CHAPTER: u64 = 32;

fn name(i: u64) -> RecordName {
    let mut bytes = [0u8; 16];
    bytes[..8].copy_from_slice(&i.wrapping_mul(0x9e37_79b9_7f4a_7c15).to_be_bytes());
    bytes[8..].copy_from_slice(&i.wrapping_mul(0xc2b2_ae3d_27d4_eb4f).to_be_bytes());
    RecordName::new(bytes)
}

/// Chapters of 32 records: 4 pages of 8.
fn geometry(chapters: u32, sparse_chapters: u32) -> GeometryConfig {
    GeometryConfig {
        bytes_per_page:             256,
        record_pages_per_chapter:   4,
        chapters_per_volume:        chapters,
        sparse_chapters_per_volume: sparse_chapters,
    }
}

fn store(config: &IndexConfig) -> Arc<dyn BlockStore> {
    Arc::new(MemoryStore::new(Index::required_store_bytes(config).unwrap()))
}

fn post(index: &Index, name: RecordName, value: u64) -> bool {
    index
        .process_blocking(Request::post(name, RecordData::from_u64(value)))
        .unwrap()
        .found
}

fn lookup(index: &Index, name: RecordName) -> Option<RecordData> {
    index
        .process_blocking(Request::query_no_update(name))
        .unwrap()
        .old_metadata
}

/// The chapter each of the first `count` names was last seen in.
fn chapters(index: &Index, count: u64) -> Vec<Option<u64>> {
    (0..count)
        .map(|i| {
            index
                .process_blocking(Request::query_no_update(name(i)))
                .unwrap()
                .virtual_chapter
        })
        .collect()
}

fn sparse_hook() -> RecordName {
    (1_000_000..)
        .map(name)
        .find(|n| n.is_sample(DEFAULT_SPARSE_SAMPLE_RATE))
        .unwrap()
}

fn sparse_config() -> IndexConfig {
    IndexConfig::default()
        .with_zone_count(1)
        .with_sparse(true)
        .with_geometry(geometry(10, 5))
}

#[test]
fn full_sparse_volume_forgets_its_oldest_chapter() {
    dedupe_utils::logger::install_fmt_log();
    let config = sparse_config();
    let store = store(&config);
    let index = Index::open(config.clone(), store.clone(), OpenMode::Create).unwrap();
    for i in 0..10 * RECORDS_PER_CHAPTER {
        assert!(!post(&index, name(i), i));
    }
    index.close().unwrap();

    let index = Index::open(config, store, OpenMode::NoRebuild).unwrap();
    let stats = index.stats();
    assert_eq!((stats.oldest_chapter, stats.newest_chapter), (1, 10));
    // chapter 0 gave its slot to the open chapter
    assert_eq!(lookup(&index, name(3)), None);
    // chapter 9 is still dense
    let recent = 9 * RECORDS_PER_CHAPTER + 4;
    assert_eq!(lookup(&index, name(recent)), Some(RecordData::from_u64(recent)));
    index.close().unwrap();
}

#[test]
fn hooks_are_found_in_sparse_chapters() {
    let config = sparse_config();
    let index = Index::open(config.clone(), store(&config), OpenMode::Create).unwrap();
    let hook = sparse_hook();
    // lands in chapter 2, sparse once chapter 7 has closed
    let hook_at = 2 * RECORDS_PER_CHAPTER + 6;
    for i in 0..10 * RECORDS_PER_CHAPTER {
        let n = if i == hook_at { hook } else { name(i) };
        post(&index, n, i);
    }

    assert_eq!(lookup(&index, hook), Some(RecordData::from_u64(hook_at)));
    assert!(post(&index, hook, 0));
    index.close().unwrap();
}

#[test]
fn rebuilding_twice_gives_the_same_index() {
    let config = IndexConfig::default()
        .with_zone_count(1)
        .with_geometry(geometry(8, 0));
    let store = store(&config);
    let index = Index::open(config.clone(), store.clone(), OpenMode::Create).unwrap();
    for i in 0..100 {
        post(&index, name(i), i);
    }
    drop(index);

    let first = Index::open(config.clone(), store.clone(), OpenMode::Rebuild).unwrap();
    let replayed = first.rebuild_stats().unwrap();
    assert_eq!(replayed.chapters_replayed, 3);
    assert_eq!(replayed.records_replayed, 3 * RECORDS_PER_CHAPTER);
    let first_chapters = chapters(&first, 100);
    let first_stats = first.stats();
    first.close().unwrap();

    let second = Index::open(config, store, OpenMode::Rebuild).unwrap();
    assert_eq!(second.rebuild_stats(), Some(replayed));
    let second_stats = second.stats();
    assert_eq!(second_stats.entries_indexed, first_stats.entries_indexed);
    assert_eq!(second_stats.collisions, first_stats.collisions);
    assert_eq!(
        (second_stats.oldest_chapter, second_stats.newest_chapter),
        (first_stats.oldest_chapter, first_stats.newest_chapter)
    );
    assert_eq!(chapters(&second, 100), first_chapters);
    for i in 0..3 * RECORDS_PER_CHAPTER {
        assert_eq!(first_chapters[i as usize], Some(i / RECORDS_PER_CHAPTER), "record {i}");
        assert_eq!(lookup(&second, name(i)), Some(RecordData::from_u64(i)), "record {i}");
    }
    // the open chapter was never written
    assert!(first_chapters[96..].iter().all(Option::is_none));
    second.close().unwrap();
}

#[tokio::test]
async fn two_zones_share_sparse_chapters() {
    let config = sparse_config().with_zone_count(2);
    let index = Index::open(config.clone(), store(&config), OpenMode::Create).unwrap();
    let hook = sparse_hook();
    let hook_at = RECORDS_PER_CHAPTER + 8;
    let posted = 8 * RECORDS_PER_CHAPTER;
    let named = |i: u64| if i == hook_at { hook } else { name(i) };

    let replies: Vec<_> = (0..posted)
        .map(|i| index.submit(Request::post(named(i), RecordData::from_u64(i))).unwrap())
        .collect();
    for reply in replies {
        assert!(!reply.await.unwrap().unwrap().found);
    }
    assert!(index.stats().newest_chapter >= 7);

    // the hook's chapter has gone sparse; triage caches it in both zones
    let response = index
        .process(Request::post(hook, RecordData::from_u64(0)))
        .await
        .unwrap();
    assert!(response.found);
    assert_eq!(response.location, IndexRegion::InSparse);
    assert_eq!(response.old_metadata, Some(RecordData::from_u64(hook_at)));

    // newest first, so the last chapter is still dense when it is reached
    let replies: Vec<_> = (0..posted)
        .rev()
        .map(|i| index.submit(Request::post(named(i), RecordData::from_u64(i))).unwrap())
        .collect();
    let mut found = Vec::new();
    for reply in replies {
        found.push(reply.await.unwrap().unwrap().found);
    }
    let recent = RECORDS_PER_CHAPTER as usize;
    assert!(found[..recent].iter().all(|f| *f), "{found:?}");

    let stats = index.stats();
    assert_eq!(stats.requests, 2 * posted + 1);
    assert!(stats.posts_found_sparse >= 1);
    index.close().unwrap();
}

#[tokio::test]
async fn zones_deduplicate_independently() {
    let config = IndexConfig::default()
        .with_zone_count(4)
        .with_geometry(geometry(64, 0));
    let index = Index::open(config.clone(), store(&config), OpenMode::Create).unwrap();
    for i in 0..200 {
        let response = index
            .process(Request::post(name(i), RecordData::from_u64(i)))
            .await
            .unwrap();
        assert!(!response.found);
    }
    for i in 0..200 {
        let response = index
            .process(Request::post(name(i), RecordData::from_u64(i + 1000)))
            .await
            .unwrap();
        assert!(response.found, "record {i} lost");
        assert_eq!(response.old_metadata, Some(RecordData::from_u64(i)));
    }

    let stats = index.stats();
    assert_eq!(stats.posts_not_found, 200);
    assert_eq!(stats.requests, 400);
    index.close().unwrap();
}

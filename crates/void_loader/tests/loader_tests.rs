//! Integration tests for void_loader

use std::cell::{Cell, RefCell};
use std::io;
use std::path::Path;
use std::rc::Rc;

use void_loader::*;

fn setup() -> (tempfile::TempDir, MemoryTransport) {
    let _ = env_logger::builder().is_test(true).try_init();
    (tempfile::tempdir().unwrap(), MemoryTransport::new())
}

fn scheduler(dir: &tempfile::TempDir, transport: &MemoryTransport) -> RequestScheduler {
    RequestScheduler::new(LoaderConfig::testing(dir.path()), transport.clone()).unwrap()
}

fn png_bytes() -> Vec<u8> {
    ImageData {
        width: 3,
        height: 1,
        pixels: vec![255, 0, 0, 255, 0, 255, 0, 255, 0, 0, 255, 255],
    }
    .encode_png()
    .unwrap()
}

#[test]
fn test_disabled_cache_skips_store() {
    let (dir, transport) = setup();
    transport.serve("http://h/live.txt", "live");
    let mut scheduler = scheduler(&dir, &transport);

    let id = scheduler
        .enqueue(FetchRequest::of::<str>("http://h/live.txt").disable_local_cache().retain())
        .unwrap();
    scheduler.tick();

    let request = scheduler.get(id).unwrap();
    assert_eq!(request.local_phase(), Phase::Failed);
    assert_eq!(request.network_phase(), Phase::Running);

    scheduler.tick();
    scheduler.tick();
    assert_eq!(scheduler.payload::<str>(id), Some("live"));
    assert!(scheduler.version_store().is_empty());
    assert!(!dir.path().join("data").exists());
}

fn seed_cache(dir: &Path, entries: &[(String, Vec<u8>)]) {
    let layout = CacheLayout::new(dir);
    let mut versions = VersionStore::new(layout.manifest_path());
    for (id, data) in entries {
        DiskStore.write(&layout.data_path(id), data).unwrap();
        versions.write(id, 1).unwrap();
    }
    versions.save(&DiskStore).unwrap();
}

#[test]
fn test_version_downgrade_rejected() {
    let (dir, _) = setup();
    let mut store = VersionStore::new(CacheLayout::new(dir.path()).manifest_path());

    store.write("a", 5).unwrap();
    let err = store.write("a", 3).unwrap_err();
    assert!(matches!(
        err,
        LoaderError::VersionDowngradeRejected { stored: 5, requested: 3, .. }
    ));
    assert_eq!(store.get("a"), Some(5));

    store.write("a", 5).unwrap();
    store.write("a", 6).unwrap();
    assert_eq!(store.get("a"), Some(6));
}

#[test]
fn test_network_budget_defers_excess() {
    let (dir, transport) = setup();
    let mut ids = Vec::new();
    let mut scheduler = scheduler(&dir, &transport);

    for i in 0..6 {
        let locator = format!("http://h/file{}.bin", i);
        transport.serve(locator.clone(), vec![i as u8]);
        ids.push(
            scheduler
                .enqueue(FetchRequest::new(locator, PayloadKind::Bytes).retain())
                .unwrap(),
        );
    }

    scheduler.tick();
    let running: Vec<_> = ids
        .iter()
        .map(|id| scheduler.get(*id).unwrap().network_phase())
        .collect();
    assert_eq!(&running[..4], &[Phase::Running; 4]);
    assert_eq!(&running[4..], &[Phase::Idle; 2]);
    assert_eq!(scheduler.in_flight(), 4);
    assert_eq!(transport.fetched().len(), 4);

    scheduler.tick();
    for id in &ids[..4] {
        assert!(scheduler.get(*id).unwrap().is_success());
    }
    for id in &ids[4..] {
        assert_eq!(scheduler.get(*id).unwrap().network_phase(), Phase::Running);
    }

    scheduler.tick();
    assert_eq!(scheduler.stats().succeeded, 6);
    assert_eq!(scheduler.pending_count(), 0);
}

#[test]
fn test_cache_hit_skips_network() {
    let (dir, transport) = setup();
    transport.serve("http://h/motd.txt", "hello from the network");

    {
        let mut scheduler = scheduler(&dir, &transport);
        scheduler
            .enqueue(FetchRequest::of::<str>("http://h/motd.txt").expected_version(2))
            .unwrap();
        scheduler.tick();
        scheduler.tick();
    }

    transport.remove("http://h/motd.txt");
    let mut scheduler = scheduler(&dir, &transport);
    let id = scheduler
        .enqueue(
            FetchRequest::of::<str>("http://h/motd.txt")
                .expected_version(1)
                .retain(),
        )
        .unwrap();

    scheduler.tick();
    let request = scheduler.get(id).unwrap();
    assert_eq!(request.local_phase(), Phase::Succeeded);
    assert_eq!(request.network_phase(), Phase::Idle);

    scheduler.tick();
    let request = scheduler.get(id).unwrap();
    assert!(request.is_from_cache());
    assert_eq!(request.result::<str>(), Some("hello from the network"));
    assert_eq!(transport.fetch_count("http://h/motd.txt"), 1);
    assert_eq!(scheduler.stats().cache_hits, 1);
    assert_eq!(scheduler.stats().network_fetches, 0);
}

#[test]
fn test_stale_cache_refetches_and_bumps_version() {
    let (dir, transport) = setup();
    transport.serve("http://h/data.bin", vec![1, 2, 3]);
    let mut scheduler = scheduler(&dir, &transport);

    let first = scheduler
        .enqueue(
            FetchRequest::new("http://h/data.bin", PayloadKind::Bytes)
                .expected_version(1)
                .retain(),
        )
        .unwrap();
    scheduler.tick();
    scheduler.tick();
    assert!(scheduler.get(first).unwrap().is_from_network());

    transport.serve("http://h/data.bin", vec![4, 5, 6]);
    let second = scheduler
        .enqueue(
            FetchRequest::new("http://h/data.bin", PayloadKind::Bytes)
                .expected_version(2)
                .retain(),
        )
        .unwrap();
    scheduler.tick();
    scheduler.tick();

    assert_eq!(scheduler.payload::<[u8]>(second), Some(&[4u8, 5, 6][..]));
    assert_eq!(scheduler.version_store().get("h_data.bin"), Some(2));
    assert_eq!(scheduler.stats().stale, 1);
    assert_eq!(transport.fetch_count("http://h/data.bin"), 2);
}

#[test]
fn test_manifest_persisted_at_next_tick() {
    let (dir, transport) = setup();
    transport.serve("http://h/a.txt", "a");
    let mut scheduler = scheduler(&dir, &transport);
    let manifest = scheduler.layout().manifest_path();

    let id = scheduler
        .enqueue(FetchRequest::of::<str>("http://h/a.txt").retain())
        .unwrap();
    scheduler.tick();
    scheduler.tick();

    let cache_id = scheduler.get(id).unwrap().cache_id().unwrap().to_string();
    assert!(scheduler.version_store().get(&cache_id).is_some());
    assert!(scheduler.layout().data_path(&cache_id).exists());
    assert!(scheduler.version_store().is_dirty());
    assert!(!manifest.exists());

    scheduler.tick();
    assert!(!scheduler.version_store().is_dirty());

    let json: serde_json::Value = serde_json::from_slice(&std::fs::read(&manifest).unwrap()).unwrap();
    assert_eq!(json["files"][0]["id"], cache_id.as_str());
    assert_eq!(json["files"][0]["version"], 0);
}

#[test]
fn test_corrupt_manifest_loads_empty() {
    let (dir, transport) = setup();
    let layout = CacheLayout::new(dir.path());
    DiskStore.write(&layout.manifest_path(), b"{ not json").unwrap();
    DiskStore.write(&layout.data_path("h_a.txt"), b"stale").unwrap();
    transport.serve("http://h/a.txt", "fresh");

    let mut scheduler = scheduler(&dir, &transport);
    let id = scheduler
        .enqueue(FetchRequest::of::<str>("http://h/a.txt").retain())
        .unwrap();
    scheduler.tick();
    scheduler.tick();

    assert_eq!(scheduler.payload::<str>(id), Some("fresh"));
    assert_eq!(scheduler.stats().cache_misses, 1);
}

#[test]
fn test_retry_is_noop_unless_failed() {
    let (dir, transport) = setup();
    transport.serve_after("http://h/slow.bin", vec![0], 3);
    let mut scheduler = scheduler(&dir, &transport);

    let id = scheduler
        .enqueue(FetchRequest::new("http://h/slow.bin", PayloadKind::Bytes))
        .unwrap();
    scheduler.tick();

    assert!(!scheduler.retry(id).unwrap());
    let request = scheduler.get(id).unwrap();
    assert_eq!(request.local_phase(), Phase::Failed);
    assert_eq!(request.network_phase(), Phase::Running);
    assert!(matches!(
        scheduler.retry(RequestId(42)),
        Err(LoaderError::UnknownRequest(42))
    ));
}

#[test]
fn test_retry_after_failure() {
    let (dir, transport) = setup();
    transport.fail(
        "http://h/flaky.txt",
        TransportError::Network("connection reset".to_string()),
    );
    let mut scheduler = scheduler(&dir, &transport);

    let failures = Rc::new(Cell::new(0));
    let counter = failures.clone();
    let id = scheduler
        .enqueue(
            FetchRequest::of::<str>("http://h/flaky.txt")
                .retain()
                .on_failure(move |r| {
                    assert!(r.error().unwrap().is_transport());
                    counter.set(counter.get() + 1);
                }),
        )
        .unwrap();

    scheduler.tick();
    scheduler.tick();
    assert_eq!(failures.get(), 1);
    assert!(scheduler.get(id).unwrap().is_failed());

    transport.serve("http://h/flaky.txt", "recovered");
    assert!(scheduler.retry(id).unwrap());
    assert_eq!(scheduler.pending_count(), 1);

    scheduler.tick();
    scheduler.tick();
    assert_eq!(scheduler.payload::<str>(id), Some("recovered"));
    assert_eq!(failures.get(), 1);
    assert_eq!(scheduler.stats().failed, 1);
    assert_eq!(scheduler.stats().succeeded, 1);
}

#[test]
fn test_progress_is_monotonic() {
    let (dir, transport) = setup();
    transport.serve_after("http://h/big.bin", vec![7; 64], 5);
    let mut scheduler = scheduler(&dir, &transport);

    let seen = Rc::new(RefCell::new(Vec::new()));
    let log = seen.clone();
    let id = scheduler
        .enqueue(
            FetchRequest::new("http://h/big.bin", PayloadKind::Bytes)
                .retain()
                .on_progress(move |r| log.borrow_mut().push(r.progress())),
        )
        .unwrap();

    let mut ticks = 0;
    while scheduler.get(id).map_or(true, |r| !r.is_done()) {
        scheduler.tick();
        ticks += 1;
        assert!(ticks < 20, "request never finished");
    }

    let seen = seen.borrow();
    assert_eq!(seen.len(), 5);
    assert!(seen.windows(2).all(|w| w[0] <= w[1]));
    assert!(seen.iter().all(|p| *p >= LOCAL_WEIGHT && *p < 1.0));
    assert_eq!(scheduler.get(id).unwrap().progress(), 1.0);
}

#[test]
fn test_group_completes_once() {
    let (dir, transport) = setup();
    transport.serve("http://h/a.txt", "A");
    transport.serve("http://h/b.txt", "B");
    let mut scheduler = scheduler(&dir, &transport);

    let fired = Rc::new(Cell::new(0));
    let counter = fired.clone();
    let group = scheduler
        .create_group_with::<str, _, _>(
            ["http://h/a.txt", "http://h/b.txt", "http://h/missing.txt"],
            move |view| {
                assert_eq!(view.len(), 3);
                assert_eq!(view.result::<str>(0), Some("A"));
                assert_eq!(view.result::<str>(1), Some("B"));
                assert_eq!(view.succeeded(), 2);
                assert_eq!(view.failed(), 1);
                counter.set(counter.get() + 1);
            },
        )
        .unwrap();

    scheduler.tick();
    assert_eq!(scheduler.group(group).unwrap().progress(), 0.0);
    scheduler.tick();
    assert_eq!(fired.get(), 0);

    scheduler.tick();
    assert_eq!(fired.get(), 1);
    let state = scheduler.group(group).unwrap();
    assert!(state.is_done());
    assert!(!state.is_success());
    assert_eq!(state.succeeded_count(), 2);
    assert_eq!(state.failed_count(), 1);
    assert!((state.progress() - 2.0 / 3.0).abs() < 1e-6);

    assert_eq!(
        scheduler.group_results::<str>(group),
        vec![Some("A"), Some("B"), None]
    );
    assert_eq!(scheduler.group_result::<str>(group, 1), Some("B"));

    let member = scheduler.group(group).unwrap().members()[0];
    assert!(scheduler.take(member).is_none());

    assert_eq!(scheduler.retry_group(group).unwrap(), 1);
    for _ in 0..4 {
        scheduler.tick();
    }
    assert_eq!(fired.get(), 1);

    assert_eq!(scheduler.remove_group(group).unwrap(), 3);
    assert!(scheduler.get(member).is_none());
    assert!(scheduler.group(group).is_none());
}

#[test]
fn test_callbacks_can_enqueue() {
    let (dir, transport) = setup();
    transport.serve("http://h/index.txt", "http://h/page.txt");
    transport.serve("http://h/page.txt", "page");
    let mut scheduler = scheduler(&dir, &transport);

    let enqueuer = scheduler.enqueuer();
    let follow_up = Rc::new(Cell::new(None));
    let slot = follow_up.clone();
    scheduler
        .load::<str>("http://h/index.txt", move |next| {
            slot.set(enqueuer.enqueue(FetchRequest::of::<str>(next).retain()).ok());
        })
        .unwrap();

    scheduler.tick();
    scheduler.tick();
    let page = follow_up.get().unwrap();
    assert_eq!(scheduler.pending_count(), 1);

    scheduler.tick();
    scheduler.tick();
    assert_eq!(scheduler.payload::<str>(page), Some("page"));
}

#[test]
fn test_cached_image_loads_through_transport() {
    let (dir, transport) = setup();
    transport.serve("http://h/sprite.png", png_bytes());
    let mut scheduler = scheduler(&dir, &transport);

    scheduler
        .enqueue(FetchRequest::of::<ImageData>("http://h/sprite.png"))
        .unwrap();
    scheduler.tick();
    scheduler.tick();

    let id = scheduler
        .enqueue(FetchRequest::of::<ImageData>("http://h/sprite.png").retain())
        .unwrap();
    scheduler.tick();
    let request = scheduler.get(id).unwrap();
    assert_eq!(request.local_phase(), Phase::Running);
    assert_eq!(scheduler.in_flight(), 1);

    scheduler.tick();
    let request = scheduler.get(id).unwrap();
    assert!(request.is_from_cache());
    let image = request.result::<ImageData>().unwrap();
    assert_eq!((image.width, image.height), (3, 1));
    assert_eq!(transport.fetch_count("http://h/sprite.png"), 1);
    assert!(transport.fetched().iter().any(|l| l.starts_with("file://")));
}

#[test]
fn test_archive_payload() {
    let (dir, transport) = setup();
    transport.serve("http://h/level.lz4", Archive::pack(b"level data level data"));
    let mut scheduler = scheduler(&dir, &transport);

    let id = scheduler
        .enqueue(FetchRequest::of::<Archive>("http://h/level.lz4").retain())
        .unwrap();
    scheduler.tick();
    scheduler.tick();

    let archive = scheduler.payload::<Archive>(id).unwrap();
    assert_eq!(archive.data, b"level data level data");
    assert!(scheduler.payload::<str>(id).is_none());
}

#[test]
fn test_decode_failure_fails_request() {
    let (dir, transport) = setup();
    transport.serve("http://h/broken.png", b"not a png".to_vec());
    let mut scheduler = scheduler(&dir, &transport);

    let id = scheduler
        .enqueue(FetchRequest::of::<ImageData>("http://h/broken.png").retain())
        .unwrap();
    scheduler.tick();
    scheduler.tick();

    let request = scheduler.get(id).unwrap();
    assert!(request.is_failed());
    assert!(matches!(request.error(), Some(LoaderError::Decode(_))));
    assert!(scheduler.version_store().is_empty());
}

struct ReadOnlyStore;

impl FileStore for ReadOnlyStore {
    fn read(&self, path: &Path) -> io::Result<Vec<u8>> {
        std::fs::read(path)
    }

    fn write(&self, _path: &Path, _data: &[u8]) -> io::Result<()> {
        Err(io::Error::new(io::ErrorKind::PermissionDenied, "read-only"))
    }

    fn size(&self, path: &Path) -> io::Result<u64> {
        Ok(std::fs::metadata(path)?.len())
    }

    fn remove(&self, _path: &Path) -> io::Result<()> {
        Err(io::Error::new(io::ErrorKind::PermissionDenied, "read-only"))
    }
}

#[test]
fn test_persist_failure_does_not_fail_request() {
    let (dir, transport) = setup();
    transport.serve("http://h/a.txt", "still delivered");
    let mut scheduler = scheduler(&dir, &transport).with_store(ReadOnlyStore);

    let id = scheduler
        .enqueue(FetchRequest::of::<str>("http://h/a.txt").retain())
        .unwrap();
    scheduler.tick();
    scheduler.tick();

    assert_eq!(scheduler.payload::<str>(id), Some("still delivered"));
    assert!(scheduler.version_store().is_empty());
}

#[test]
fn test_config_from_toml_drives_budget() {
    let (dir, transport) = setup();
    let toml = format!(
        "cache_root = {:?}\nmax_concurrent_network = 1\n",
        dir.path().to_string_lossy()
    );
    let config = LoaderConfig::from_toml_str(&toml).unwrap();
    let mut scheduler = RequestScheduler::new(config, transport.clone()).unwrap();

    for name in ["a", "b", "c"] {
        scheduler
            .enqueue(FetchRequest::new(format!("http://h/{}", name), PayloadKind::Bytes))
            .unwrap();
    }
    scheduler.tick();
    assert_eq!(scheduler.in_flight(), 1);
    assert_eq!(transport.fetched(), vec!["http://h/a".to_string()]);
}

#[test]
fn test_disk_budget_limits_cache_reads() {
    let (dir, transport) = setup();
    let entries: Vec<(String, Vec<u8>)> = (0..12)
        .map(|i| (format!("blob{}", i), vec![i as u8; 16]))
        .collect();
    seed_cache(dir.path(), &entries);
    let mut scheduler = scheduler(&dir, &transport);

    let ids: Vec<RequestId> = entries
        .iter()
        .map(|(id, _)| {
            scheduler
                .enqueue(
                    FetchRequest::new(format!("http://h/{}", id), PayloadKind::Bytes)
                        .local_cache_id(id.as_str())
                        .expected_version(1)
                        .retain(),
                )
                .unwrap()
        })
        .collect();

    scheduler.tick();
    let phases: Vec<Phase> = ids
        .iter()
        .map(|id| scheduler.get(*id).unwrap().local_phase())
        .collect();
    assert_eq!(&phases[..10], &[Phase::Succeeded; 10]);
    assert_eq!(&phases[10..], &[Phase::CacheHit; 2]);
    assert_eq!(scheduler.stats().cache_hits, 12);

    scheduler.tick();
    for id in &ids[10..] {
        assert_eq!(scheduler.get(*id).unwrap().local_phase(), Phase::Succeeded);
    }

    scheduler.tick();
    assert_eq!(scheduler.pending_count(), 0);
    for (id, (_, data)) in ids.iter().zip(&entries) {
        assert_eq!(scheduler.payload::<[u8]>(*id), Some(&data[..]));
    }
    assert!(transport.fetched().is_empty());
}

#[test]
fn test_vanished_cache_file_falls_back_same_tick() {
    let (dir, transport) = setup();
    seed_cache(
        dir.path(),
        &[
            ("first".to_string(), b"one".to_vec()),
            ("second".to_string(), b"two".to_vec()),
        ],
    );
    transport.serve("http://h/second", "two from the network");
    let config = LoaderConfig {
        max_disk_ops_per_tick: 1,
        ..LoaderConfig::testing(dir.path())
    };
    let mut scheduler = RequestScheduler::new(config, transport.clone()).unwrap();

    let first = scheduler
        .enqueue(FetchRequest::of::<str>("http://h/first").local_cache_id("first").retain())
        .unwrap();
    let second = scheduler
        .enqueue(FetchRequest::of::<str>("http://h/second").local_cache_id("second").retain())
        .unwrap();

    scheduler.tick();
    assert_eq!(scheduler.get(first).unwrap().local_phase(), Phase::Succeeded);
    assert_eq!(scheduler.get(second).unwrap().local_phase(), Phase::CacheHit);

    // Checked as a hit, gone before the read
    std::fs::remove_file(scheduler.layout().data_path("second")).unwrap();

    scheduler.tick();
    let request = scheduler.get(second).unwrap();
    assert_eq!(request.local_phase(), Phase::Failed);
    assert_eq!(request.network_phase(), Phase::Running);
    assert_eq!(transport.fetched(), vec!["http://h/second".to_string()]);

    scheduler.tick();
    assert_eq!(scheduler.payload::<str>(second), Some("two from the network"));
    assert_eq!(scheduler.payload::<str>(first), Some("one"));
}

#[test]
fn test_escaping_cache_id_stays_inside_root() {
    let (dir, transport) = setup();
    let root = dir.path().join("root");
    transport.serve("http://h/x.txt", "payload");
    let mut scheduler =
        RequestScheduler::new(LoaderConfig::testing(&root), transport.clone()).unwrap();

    let id = scheduler
        .enqueue(
            FetchRequest::of::<str>("http://h/x.txt")
                .local_cache_id("../../escaped.txt")
                .expected_version(1)
                .retain(),
        )
        .unwrap();
    for _ in 0..3 {
        scheduler.tick();
    }

    assert_eq!(scheduler.payload::<str>(id), Some("payload"));
    assert!(!dir.path().join("escaped.txt").exists());
    assert!(!root.join("escaped.txt").exists());
    assert!(scheduler.version_store().is_empty());
}

#[test]
fn test_load_frees_payload_after_delivery() {
    let (dir, transport) = setup();
    transport.serve("http://h/once.txt", "once");
    let mut scheduler = scheduler(&dir, &transport);

    let seen = Rc::new(RefCell::new(String::new()));
    let sink = seen.clone();
    let id = scheduler
        .load::<str>("http://h/once.txt", move |text| sink.borrow_mut().push_str(text))
        .unwrap();
    scheduler.tick();
    scheduler.tick();

    assert_eq!(seen.borrow().as_str(), "once");
    assert!(scheduler.get(id).is_none());
    assert!(scheduler.payload::<str>(id).is_none());
    assert!(!scheduler.release(id));
}

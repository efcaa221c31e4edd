use bytes::Bytes;
use quorum_kv_store::{LsmConfig, LsmEngine, Record};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::collections::BTreeMap;
use std::path::Path;
use tempfile::tempdir;

fn open(dir: &Path, memtable_max: usize) -> LsmEngine {
    let config = LsmConfig::builder()
        .dir_path(dir.to_path_buf())
        .memtable_max_size(memtable_max)
        .build();
    LsmEngine::open(config).unwrap()
}

fn put(engine: &LsmEngine, key: &str, value: &str, ts: u64) {
    engine
        .upsert(Record::present(
            Bytes::copy_from_slice(key.as_bytes()),
            Bytes::copy_from_slice(value.as_bytes()),
            ts,
        ))
        .unwrap();
}

fn del(engine: &LsmEngine, key: &str, ts: u64) {
    engine
        .upsert(Record::tombstone(Bytes::copy_from_slice(key.as_bytes()), ts))
        .unwrap();
}

/// Live `(key, value)` pairs from a full range scan.
fn live(engine: &LsmEngine) -> Vec<(String, String)> {
    engine
        .range(None, None)
        .unwrap()
        .map(|r| {
            let r = r.unwrap();
            (
                String::from_utf8(r.key.to_vec()).unwrap(),
                String::from_utf8(r.value.unwrap().to_vec()).unwrap(),
            )
        })
        .collect()
}

fn sst_bytes(dir: &Path) -> u64 {
    std::fs::read_dir(dir)
        .unwrap()
        .map(|e| e.unwrap())
        .filter(|e| e.file_name().to_string_lossy().starts_with("sst_"))
        .map(|e| e.metadata().unwrap().len())
        .sum()
}

#[test]
fn durability_across_restart() {
    let dir = tempdir().unwrap();
    {
        let engine = open(dir.path(), 1024 * 1024);
        put(&engine, "k1", "v1", 1);
        put(&engine, "k2", "v2", 2);
        engine.close().unwrap();
    }

    let engine = open(dir.path(), 1024 * 1024);
    assert_eq!(
        live(&engine),
        vec![
            ("k1".to_string(), "v1".to_string()),
            ("k2".to_string(), "v2".to_string()),
        ]
    );
}

#[test]
fn tombstone_persists_across_restart() {
    let dir = tempdir().unwrap();
    {
        let engine = open(dir.path(), 1024 * 1024);
        put(&engine, "k", "v", 1);
        del(&engine, "k", 2);
        engine.close().unwrap();
    }

    let engine = open(dir.path(), 1024 * 1024);
    assert!(engine.get_record(b"k").unwrap().unwrap().is_tombstone());
    assert!(live(&engine).is_empty());
}

#[test]
fn restart_resumes_segment_numbering() {
    let dir = tempdir().unwrap();
    {
        let engine = open(dir.path(), 1024 * 1024);
        put(&engine, "a", "1", 1);
        engine.flush().unwrap();
        put(&engine, "b", "2", 2);
        engine.close().unwrap();
    }
    assert!(dir.path().join("sst_0").exists());
    assert!(dir.path().join("sst_1").exists());

    let engine = open(dir.path(), 1024 * 1024);
    put(&engine, "c", "3", 3);
    engine.flush().unwrap();
    assert!(dir.path().join("sst_2").exists());
    assert_eq!(live(&engine).len(), 3);
}

#[test]
fn small_memtable_flushes_while_serving_reads() {
    let dir = tempdir().unwrap();
    let engine = open(dir.path(), 2048);
    for i in 0..100u64 {
        put(&engine, &format!("key{i:03}"), &"x".repeat(40), i);
    }

    // Multiple segments plus a live memtable, every key readable once.
    assert!(sst_bytes(dir.path()) > 0);
    let all = live(&engine);
    assert_eq!(all.len(), 100);
    assert!(all.windows(2).all(|w| w[0].0 < w[1].0));
}

#[test]
fn overwrite_latest_value_wins_after_restart() {
    let dir = tempdir().unwrap();
    {
        let engine = open(dir.path(), 1024 * 1024);
        put(&engine, "k", "old", 1);
        engine.flush().unwrap();
        put(&engine, "k", "new", 2);
        engine.close().unwrap();
    }

    let engine = open(dir.path(), 1024 * 1024);
    assert_eq!(live(&engine), vec![("k".to_string(), "new".to_string())]);
}

#[test]
fn compaction_preserves_live_set_and_shrinks_disk() {
    let dir = tempdir().unwrap();
    let engine = open(dir.path(), 1024 * 1024);

    for i in 0..50u64 {
        put(&engine, &format!("key{i:02}"), &format!("v{i}"), i);
    }
    engine.flush().unwrap();
    // Overwrite half, delete a quarter, spread over two more segments.
    for i in 0..25u64 {
        put(&engine, &format!("key{i:02}"), &format!("w{i}"), 100 + i);
    }
    engine.flush().unwrap();
    for i in 25..38u64 {
        del(&engine, &format!("key{i:02}"), 200 + i);
    }
    engine.flush().unwrap();

    let before = live(&engine);
    let disk_before = sst_bytes(dir.path());

    engine.compact().unwrap();
    assert_eq!(live(&engine), before);
    let disk_after = sst_bytes(dir.path());
    assert!(disk_after <= disk_before);

    // Idempotent: a second compaction changes nothing observable.
    engine.compact().unwrap();
    assert_eq!(live(&engine), before);
    assert!(sst_bytes(dir.path()) <= disk_after);
}

#[test]
fn compacted_state_survives_restart() {
    let dir = tempdir().unwrap();
    {
        let engine = open(dir.path(), 1024 * 1024);
        put(&engine, "keep", "v", 1);
        put(&engine, "drop", "v", 1);
        engine.flush().unwrap();
        del(&engine, "drop", 2);
        engine.compact().unwrap();
        engine.close().unwrap();
    }

    let engine = open(dir.path(), 1024 * 1024);
    assert_eq!(live(&engine), vec![("keep".to_string(), "v".to_string())]);
    assert!(engine.get_record(b"drop").unwrap().is_none());
}

#[test]
fn leftover_temp_files_removed_at_open() {
    let dir = tempdir().unwrap();
    std::fs::write(dir.path().join("tmp_5"), b"half-written segment").unwrap();

    let engine = open(dir.path(), 1024 * 1024);
    assert!(!dir.path().join("tmp_5").exists());
    assert!(live(&engine).is_empty());
}

/// The model's entry for one key: last applied timestamp and live value
/// (`None` = deleted).
type ModelEntry = (u64, Option<String>);

/// Last-write-wins, mirroring the store: higher timestamp wins, a
/// tombstone wins a timestamp tie, everything else is dropped.
fn model_apply(model: &mut BTreeMap<String, ModelEntry>, key: String, ts: u64, value: Option<String>) {
    if let Some((old_ts, old_value)) = model.get(&key) {
        let wins = ts > *old_ts || (ts == *old_ts && value.is_none() && old_value.is_some());
        if !wins {
            return;
        }
    }
    model.insert(key, (ts, value));
}

/// Randomized run against a model map: upserts, deletes, flushes and one
/// compaction must agree with the model on every range query, before and
/// after a restart. Timestamps are drawn at random, so arrival order and
/// timestamp order disagree constantly; stale writes must lose.
#[test]
fn random_ops_match_model() {
    let dir = tempdir().unwrap();
    let mut rng = StdRng::seed_from_u64(0xdb_cafe);
    let mut model: BTreeMap<String, ModelEntry> = BTreeMap::new();

    {
        let engine = open(dir.path(), 8 * 1024);
        for round in 0..600u32 {
            let key = format!("key{:02}", rng.gen_range(0..40));
            let ts = rng.gen_range(0..400u64);
            if rng.gen_bool(0.8) {
                let value = format!("v{}", rng.gen_range(0..1000));
                put(&engine, &key, &value, ts);
                model_apply(&mut model, key, ts, Some(value));
            } else {
                del(&engine, &key, ts);
                model_apply(&mut model, key, ts, None);
            }

            if round == 300 {
                engine.compact().unwrap();
            }
        }

        assert_model_matches(&engine, &model, None, None);
        assert_model_matches(&engine, &model, Some("key10"), Some("key30"));
        assert_model_matches(&engine, &model, Some("key35"), None);
        assert_model_matches(&engine, &model, None, Some("key05"));
        engine.close().unwrap();
    }

    let engine = open(dir.path(), 8 * 1024);
    assert_model_matches(&engine, &model, None, None);
    assert_model_matches(&engine, &model, Some("key07"), Some("key33"));
}

fn assert_model_matches(
    engine: &LsmEngine,
    model: &BTreeMap<String, ModelEntry>,
    from: Option<&str>,
    to: Option<&str>,
) {
    let expected: Vec<(String, String)> = model
        .iter()
        .filter(|(k, _)| from.map_or(true, |f| k.as_str() >= f))
        .filter(|(k, _)| to.map_or(true, |t| k.as_str() < t))
        .filter_map(|(k, (_, v))| v.as_ref().map(|v| (k.clone(), v.clone())))
        .collect();

    let actual: Vec<(String, String)> = engine
        .range(from.map(str::as_bytes), to.map(str::as_bytes))
        .unwrap()
        .map(|r| {
            let r = r.unwrap();
            (
                String::from_utf8(r.key.to_vec()).unwrap(),
                String::from_utf8(r.value.unwrap().to_vec()).unwrap(),
            )
        })
        .collect();

    assert_eq!(actual, expected);
}

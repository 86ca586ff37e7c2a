use criterion::{criterion_group, criterion_main, Criterion};
use codesync_collab::broadcast::BroadcastGroup;
use codesync_collab::model::{now_millis, Cursor, File, FileKind, NewFile};
use codesync_collab::presence::color_for;
use codesync_collab::protocol::{Envelope, Notification, Request};
use codesync_collab::storage::{MemoryStore, RocksStore, StoreConfig, VersionStore};
use std::hint::black_box;
use std::sync::Arc;
use uuid::Uuid;

fn sample_file(content: &str) -> File {
    let now = now_millis();
    File {
        id: Uuid::new_v4(),
        project_id: Uuid::new_v4(),
        parent_id: None,
        name: "main.move".into(),
        kind: FileKind::File,
        content: Some(content.into()),
        language: Some("move".into()),
        version: 1,
        created_at: now,
        last_synced: now,
    }
}

fn source_text(len: usize) -> String {
    let line = "    public fun transfer(from: &signer, to: address, amount: u64) {}\n";
    let mut text = String::with_capacity(len + line.len());
    while text.len() < len {
        text.push_str(line);
    }
    text.truncate(len);
    text
}

// ─── Protocol benchmarks ────────────────────────────────────

fn bench_update_encode(c: &mut Criterion) {
    let content = source_text(4096);

    c.bench_function("update_encode_4KB", |b| {
        b.iter(|| {
            let msg = Envelope::request(
                black_box(1),
                Request::UpdateFile {
                    id: black_box(Uuid::nil()),
                    content: black_box(content.clone()),
                    version: 7,
                },
            );
            black_box(msg.encode().unwrap());
        })
    });
}

fn bench_update_decode(c: &mut Criterion) {
    let msg = Envelope::request(
        1,
        Request::UpdateFile {
            id: Uuid::new_v4(),
            content: source_text(4096),
            version: 7,
        },
    );
    let encoded = msg.encode().unwrap();

    c.bench_function("update_decode_4KB", |b| {
        b.iter(|| {
            black_box(Envelope::decode(black_box(&encoded)).unwrap());
        })
    });
}

fn bench_cursor_encode(c: &mut Criterion) {
    let file_id = Uuid::new_v4();

    c.bench_function("cursor_encode", |b| {
        b.iter(|| {
            let msg = Envelope::request(
                1,
                Request::UpdateCursor {
                    file_id: black_box(file_id),
                    cursor: black_box(Cursor::new(120, 14)),
                },
            );
            black_box(msg.encode().unwrap());
        })
    });
}

fn bench_color_for(c: &mut Criterion) {
    let user = Uuid::new_v4();

    c.bench_function("color_for_user", |b| {
        b.iter(|| {
            black_box(color_for(black_box(user)));
        })
    });
}

// ─── Broadcast benchmarks ───────────────────────────────────

fn bench_broadcast_file_saved(c: &mut Criterion) {
    let rt = tokio::runtime::Runtime::new().unwrap();
    let group = BroadcastGroup::new(1024);
    let _receivers: Vec<_> = rt.block_on(async {
        let mut rxs = Vec::new();
        for _ in 0..100 {
            rxs.push(group.add_member(Uuid::new_v4()).await);
        }
        rxs
    });

    c.bench_function("broadcast_file_saved_100_members", |b| {
        b.iter(|| {
            let notification = Notification::FileSaved {
                file_id: Uuid::nil(),
                version: 2,
                session_id: Uuid::nil(),
            };
            black_box(group.broadcast(black_box(notification)).unwrap());
        })
    });
}

fn bench_broadcast_raw(c: &mut Criterion) {
    let group = BroadcastGroup::new(1024);
    let data = Arc::new(vec![0u8; 128]);

    c.bench_function("broadcast_raw_128B", |b| {
        b.iter(|| {
            black_box(group.broadcast_raw(Arc::clone(&data)));
        })
    });
}

// ─── Storage benchmarks ─────────────────────────────────────

fn bench_memory_cas(c: &mut Criterion) {
    let store = MemoryStore::with_revision_limit(50);
    let file = sample_file("");
    store.create(&file).unwrap();
    let content = source_text(4096);

    c.bench_function("memory_update_if_version_4KB", |b| {
        let mut version = 1u64;
        b.iter(|| {
            store
                .update_if_version(black_box(file.id), black_box(&content), version)
                .unwrap();
            version += 1;
        })
    });
}

fn bench_rocks_cas(c: &mut Criterion) {
    let dir = std::env::temp_dir().join(format!("codesync_bench_cas_{}", Uuid::new_v4()));
    let store = RocksStore::open(StoreConfig {
        revision_limit: 50,
        ..StoreConfig::for_testing(dir.clone())
    })
    .unwrap();
    let file = sample_file("");
    store.create(&file).unwrap();
    let content = source_text(4096);

    c.bench_function("rocks_update_if_version_4KB", |b| {
        let mut version = 1u64;
        b.iter(|| {
            store
                .update_if_version(black_box(file.id), black_box(&content), version)
                .unwrap();
            version += 1;
        })
    });

    drop(store);
    let _ = std::fs::remove_dir_all(&dir);
}

fn bench_rocks_stale_update(c: &mut Criterion) {
    let dir = std::env::temp_dir().join(format!("codesync_bench_stale_{}", Uuid::new_v4()));
    let store = RocksStore::open(StoreConfig::for_testing(dir.clone())).unwrap();
    let file = sample_file("v1");
    store.create(&file).unwrap();
    store.update_if_version(file.id, "v2", 1).unwrap();

    c.bench_function("rocks_stale_update_conflict", |b| {
        b.iter(|| {
            black_box(store.update_if_version(black_box(file.id), "stale", 1).unwrap());
        })
    });

    drop(store);
    let _ = std::fs::remove_dir_all(&dir);
}

fn bench_rocks_get(c: &mut Criterion) {
    let dir = std::env::temp_dir().join(format!("codesync_bench_get_{}", Uuid::new_v4()));
    let store = RocksStore::open(StoreConfig::for_testing(dir.clone())).unwrap();
    let file = sample_file(&source_text(4096));
    store.create(&file).unwrap();

    c.bench_function("rocks_get_4KB", |b| {
        b.iter(|| {
            black_box(store.get(black_box(file.id)).unwrap());
        })
    });

    drop(store);
    let _ = std::fs::remove_dir_all(&dir);
}

fn bench_rocks_list_project(c: &mut Criterion) {
    let dir = std::env::temp_dir().join(format!("codesync_bench_list_{}", Uuid::new_v4()));
    let store = RocksStore::open(StoreConfig::for_testing(dir.clone())).unwrap();
    let project = Uuid::new_v4();

    // Pre-populate with 200 files
    for i in 0..200 {
        let new = NewFile::file(project, None, format!("module_{i}.move"), "module 0x1::M {}");
        let now = now_millis();
        let file = File {
            id: Uuid::new_v4(),
            project_id: new.project_id,
            parent_id: new.parent_id,
            name: new.name,
            kind: new.kind,
            content: new.content,
            language: new.language,
            version: 1,
            created_at: now,
            last_synced: now,
        };
        store.create(&file).unwrap();
    }

    c.bench_function("rocks_list_200_files", |b| {
        b.iter(|| {
            black_box(store.list(black_box(Some(project)), None).unwrap());
        })
    });

    drop(store);
    let _ = std::fs::remove_dir_all(&dir);
}

criterion_group!(
    protocol_benches,
    bench_update_encode,
    bench_update_decode,
    bench_cursor_encode,
    bench_color_for,
);

criterion_group!(
    broadcast_benches,
    bench_broadcast_file_saved,
    bench_broadcast_raw,
);

criterion_group!(
    storage_benches,
    bench_memory_cas,
    bench_rocks_cas,
    bench_rocks_stale_update,
    bench_rocks_get,
    bench_rocks_list_project,
);

criterion_main!(protocol_benches, broadcast_benches, storage_benches);

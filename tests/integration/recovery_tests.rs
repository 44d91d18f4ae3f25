//! Session lifecycle: clean and unclean shutdowns, damaged records and
//! background checkpoints.

use std::sync::Arc;
use std::time::Duration;

use ovfs::config::MountConfig;
use ovfs::diff::FileStatus;
use ovfs::mount::Mount;
use ovfs::overlay::Overlay;
use ovfs::store::MemoryObjectStore;
use ovfs::{Error, NodeId, ObjectHash, Result, ROOT_NODE_ID};
use tempfile::{tempdir, TempDir};

struct Env {
    dir: TempDir,
    store: Arc<MemoryObjectStore>,
    snapshot: ObjectHash,
}

impl Env {
    fn new() -> Self {
        let store = Arc::new(MemoryObjectStore::new());
        let snapshot = store.put_snapshot(&[("a.txt", b"A"), ("dir/b.txt", b"B")]);
        Self {
            dir: tempdir().unwrap(),
            store,
            snapshot,
        }
    }

    fn config(&self) -> MountConfig {
        MountConfig {
            checkpoint_interval_secs: 0,
            ..MountConfig::new(self.dir.path().join("overlay"))
        }
    }

    fn mount(&self) -> Result<Mount> {
        self.mount_with(self.config())
    }

    fn mount_with(&self, config: MountConfig) -> Result<Mount> {
        Mount::open(config, self.store.clone(), self.snapshot)
    }

    fn inspect(&self) -> Result<ovfs::overlay::InfoState> {
        Overlay::inspect(&self.dir.path().join("overlay"))
    }
}

fn read(mount: &Mount, path: &str) -> Result<Vec<u8>> {
    let node = mount.graph().lookup_path(path)?.expect(path);
    mount.graph().read_file(node.id)
}

#[test]
fn changes_survive_clean_shutdown() -> Result<()> {
    let env = Env::new();
    let mount = env.mount()?;
    let graph = mount.graph();
    let notes = graph.create(ROOT_NODE_ID, "notes.txt", 0o644)?;
    graph.write_file(notes.id, b"hello")?;
    graph.mkdir(ROOT_NODE_ID, "empty", 0o755)?;
    let summary = mount.shutdown()?;
    assert!(summary.records_written > 0);
    assert!(env.inspect()?.clean);

    let mount = env.mount()?;
    assert_eq!(read(&mount, "notes.txt")?, b"hello");
    assert_eq!(read(&mount, "dir/b.txt")?, b"B");
    assert_eq!(summary.next_node_id, Some(mount.graph().allocator().peek()));
    let status = mount.status(false)?;
    assert_eq!(status.get("notes.txt"), Some(FileStatus::Added));
    assert_eq!(status.entries.len(), 1);
    mount.shutdown()?;
    Ok(())
}

#[test]
fn unclean_shutdown_never_reuses_ids() -> Result<()> {
    let env = Env::new();
    let mut issued = Vec::new();
    {
        let mount = env.mount()?;
        for i in 0..20 {
            let node = mount.graph().create(ROOT_NODE_ID, &format!("f{i}"), 0o644)?;
            mount.graph().write_file(node.id, format!("{i}").as_bytes())?;
            issued.push(node.id);
        }
        // Dropped without shutdown.
    }
    assert!(!env.inspect()?.clean);

    let mount = env.mount()?;
    let fresh = mount.graph().create(ROOT_NODE_ID, "after-crash", 0o644)?;
    assert!(issued.iter().all(|id| fresh.id > *id));
    assert_eq!(read(&mount, "f7")?, b"7");
    mount.shutdown()?;
    Ok(())
}

#[test]
fn damaged_directory_record_is_reported_then_repaired_on_access() -> Result<()> {
    let env = Env::new();
    let dir_id;
    {
        let mount = env.mount()?;
        let b = mount.graph().lookup_path("dir/b.txt")?.expect("dir/b.txt");
        mount.graph().write_file(b.id, b"edited")?;
        dir_id = mount.graph().lookup_path("dir")?.expect("dir").id;
        assert!(mount.overlay().has_record(dir_id));
        mount.shutdown()?;
    }
    let record = env
        .dir
        .path()
        .join("overlay")
        .join(ovfs::overlay::RecordPath::new(dir_id).as_path());
    std::fs::write(&record, b"OVDR garbage")?;

    let mount = env.mount()?;
    // Status only reports the damage.
    let status = mount.status(false)?;
    assert!(status.errors.contains_key("dir"), "errors: {:?}", status.errors);
    assert!(mount.overlay().has_record(dir_id));

    // Filesystem access repairs it from the snapshot, losing the edit.
    assert_eq!(read(&mount, "dir/b.txt")?, b"B");
    assert!(!mount.overlay().has_record(dir_id));
    assert!(mount.status(false)?.is_clean());
    mount.shutdown()?;
    Ok(())
}

#[test]
fn damaged_file_record_is_repaired_only_by_filesystem_reads() -> Result<()> {
    let env = Env::new();
    let b_id;
    {
        let mount = env.mount()?;
        let b = mount.graph().lookup_path("dir/b.txt")?.expect("dir/b.txt");
        mount.graph().write_file(b.id, b"edited")?;
        b_id = b.id;
        mount.shutdown()?;
    }
    let record = env
        .dir
        .path()
        .join("overlay")
        .join(ovfs::overlay::RecordPath::new(b_id).as_path());
    let mut bytes = std::fs::read(&record)?;
    bytes[4..8].copy_from_slice(&9u32.to_le_bytes());
    std::fs::write(&record, bytes)?;

    let mount = env.mount()?;
    let status = mount.status(false)?;
    assert!(status.errors.contains_key("dir/b.txt"), "errors: {:?}", status.errors);
    assert!(mount.overlay().has_record(b_id));

    assert_eq!(read(&mount, "dir/b.txt")?, b"B");
    assert!(!mount.overlay().has_record(b_id));
    assert!(mount.status(false)?.is_clean());
    mount.shutdown()?;
    Ok(())
}

#[test]
fn damaged_root_record_restarts_from_snapshot() -> Result<()> {
    let env = Env::new();
    {
        let mount = env.mount()?;
        mount.graph().create(ROOT_NODE_ID, "lost.txt", 0o644)?;
        mount.shutdown()?;
    }
    let record = env
        .dir
        .path()
        .join("overlay")
        .join(ovfs::overlay::RecordPath::new(ROOT_NODE_ID).as_path());
    std::fs::write(&record, b"nonsense")?;

    let mount = env.mount()?;
    assert!(mount.graph().lookup_path("lost.txt")?.is_none());
    assert_eq!(read(&mount, "a.txt")?, b"A");
    mount.shutdown()?;
    Ok(())
}

#[test]
fn shutdown_prunes_orphaned_records() -> Result<()> {
    let env = Env::new();
    let mount = env.mount()?;
    mount.graph().create(ROOT_NODE_ID, "kept", 0o644)?;
    let orphan = NodeId::new(5_000);
    mount.overlay().create_file(orphan, b"left behind")?;
    let summary = mount.shutdown()?;
    assert_eq!(summary.pruned_records, 1);

    let mount = env.mount()?;
    assert!(!mount.overlay().has_record(orphan));
    assert!(mount.graph().lookup_path("kept")?.is_some());
    mount.shutdown()?;
    Ok(())
}

#[test]
fn checkpointer_persists_allocator_position() -> Result<()> {
    let env = Env::new();
    let config = MountConfig {
        checkpoint_interval_secs: 1,
        ..env.config()
    };
    {
        let mount = env.mount_with(config)?;
        for i in 0..5 {
            mount.graph().create(ROOT_NODE_ID, &format!("n{i}"), 0o644)?;
        }
        let next = mount.graph().allocator().peek();
        mount.start_checkpointer();
        std::thread::sleep(Duration::from_millis(2_500));

        let state = env.inspect()?;
        assert!(!state.clean);
        assert_eq!(state.next_id, Some(next));
    }

    let overlay = Overlay::new(env.dir.path().join("overlay"));
    assert_eq!(overlay.open(false)?, None);
    assert!(overlay.checkpoint_hint().is_some());
    overlay.close(None)?;
    Ok(())
}

#[test]
fn second_mount_of_same_overlay_is_refused() -> Result<()> {
    let env = Env::new();
    let first = env.mount()?;
    let err = env.mount().unwrap_err();
    assert!(matches!(err.downcast_ref::<Error>(), Some(Error::OverlayLocked(_))));
    first.shutdown()?;
    env.mount()?.shutdown()?;
    Ok(())
}

#[test]
fn missing_overlay_without_create_is_refused() {
    let env = Env::new();
    let config = MountConfig {
        create_if_missing: false,
        ..env.config()
    };
    let err = env.mount_with(config).unwrap_err();
    assert!(matches!(err.downcast_ref::<Error>(), Some(Error::Storage(_))));
}

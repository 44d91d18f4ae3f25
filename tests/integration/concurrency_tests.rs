//! Races between mutations on a shared node graph.

use std::collections::HashSet;
use std::sync::{Arc, Barrier};
use std::thread;

use ovfs::diff::{diff_for_status, DiffOptions};
use ovfs::graph::{NodeGraph, NodeIdAllocator};
use ovfs::ignore::NoIgnore;
use ovfs::overlay::Overlay;
use ovfs::store::MemoryObjectStore;
use ovfs::{Error, NodeId, ObjectHash, Result, ROOT_NODE_ID};
use tempfile::{tempdir, TempDir};

struct Shared {
    _dir: TempDir,
    store: Arc<MemoryObjectStore>,
    overlay: Arc<Overlay>,
    ids: Arc<NodeIdAllocator>,
    graph: NodeGraph,
    snapshot: ObjectHash,
}

fn shared(files: &[(&str, &[u8])]) -> Shared {
    let dir = tempdir().unwrap();
    let store = Arc::new(MemoryObjectStore::new());
    let snapshot = store.put_snapshot(files);
    let overlay = Arc::new(Overlay::new(dir.path()));
    let ids = Arc::new(NodeIdAllocator::recover(&overlay, overlay.open(true).unwrap()).unwrap());
    let graph =
        NodeGraph::from_snapshot(overlay.clone(), store.clone(), ids.clone(), snapshot).unwrap();
    Shared {
        _dir: dir,
        store,
        overlay,
        ids,
        graph,
        snapshot,
    }
}

fn names(graph: &NodeGraph, dir: NodeId) -> Vec<String> {
    graph.readdir(dir).unwrap().into_iter().map(|e| e.name).collect()
}

fn lookup(graph: &NodeGraph, path: &str) -> NodeId {
    graph.lookup_path(path).unwrap().expect(path).id
}

#[test]
fn opposite_cross_directory_renames_lose_nothing() -> Result<()> {
    let mut files = Vec::new();
    for i in 0..32 {
        files.push((format!("left/l{i:02}"), format!("left {i}").into_bytes()));
        files.push((format!("right/r{i:02}"), format!("right {i}").into_bytes()));
    }
    let borrowed: Vec<(&str, &[u8])> = files
        .iter()
        .map(|(p, c)| (p.as_str(), c.as_slice()))
        .collect();
    let env = shared(&borrowed);
    let left = lookup(&env.graph, "left");
    let right = lookup(&env.graph, "right");

    let barrier = Barrier::new(2);
    thread::scope(|s| {
        s.spawn(|| {
            barrier.wait();
            for i in 0..32 {
                let name = format!("l{i:02}");
                env.graph.rename(left, &name, right, &name).unwrap();
            }
        });
        s.spawn(|| {
            barrier.wait();
            for i in 0..32 {
                let name = format!("r{i:02}");
                env.graph.rename(right, &name, left, &name).unwrap();
            }
        });
    });

    let in_left: HashSet<String> = names(&env.graph, left).into_iter().collect();
    let in_right: HashSet<String> = names(&env.graph, right).into_iter().collect();
    assert_eq!(in_left.len(), 32);
    assert_eq!(in_right.len(), 32);
    assert!(in_left.iter().all(|n| n.starts_with('r')));
    assert!(in_right.iter().all(|n| n.starts_with('l')));
    assert_eq!(env.graph.read_file(lookup(&env.graph, "left/r05"))?, b"right 5");

    // The persisted records agree with memory.
    let reloaded =
        NodeGraph::from_overlay(env.overlay.clone(), env.store.clone(), env.ids.clone())?;
    let left = lookup(&reloaded, "left");
    let right = lookup(&reloaded, "right");
    assert_eq!(names(&reloaded, left).len(), 32);
    assert_eq!(names(&reloaded, right).len(), 32);
    assert!(names(&reloaded, right).iter().all(|n| n.starts_with('l')));
    env.overlay.close(Some(env.ids.peek()))?;
    Ok(())
}

#[test]
fn concurrent_creates_get_unique_ids() -> Result<()> {
    let env = shared(&[("seed", b"s")]);
    let threads = 8;
    let per_thread = 50;
    let barrier = Barrier::new(threads);

    let ids: Vec<NodeId> = thread::scope(|s| {
        let handles: Vec<_> = (0..threads)
            .map(|t| {
                let graph = &env.graph;
                let barrier = &barrier;
                s.spawn(move || {
                    barrier.wait();
                    (0..per_thread)
                        .map(|i| {
                            let name = format!("t{t}-{i}");
                            graph.create(ROOT_NODE_ID, &name, 0o644).unwrap().id
                        })
                        .collect::<Vec<_>>()
                })
            })
            .collect();
        handles.into_iter().flat_map(|h| h.join().unwrap()).collect()
    });

    let unique: HashSet<NodeId> = ids.iter().copied().collect();
    assert_eq!(unique.len(), threads * per_thread);
    assert_eq!(names(&env.graph, ROOT_NODE_ID).len(), threads * per_thread + 1);
    assert!(ids.iter().all(|id| env.overlay.has_record(*id)));
    env.overlay.close(Some(env.ids.peek()))?;
    Ok(())
}

#[test]
fn racing_creates_of_one_name_have_one_winner() -> Result<()> {
    let env = shared(&[("seed", b"s")]);
    let barrier = Barrier::new(8);
    let results: Vec<Result<NodeId>> = thread::scope(|s| {
        let handles: Vec<_> = (0..8)
            .map(|_| {
                s.spawn(|| {
                    barrier.wait();
                    env.graph.create(ROOT_NODE_ID, "same", 0o644).map(|n| n.id)
                })
            })
            .collect();
        handles.into_iter().map(|h| h.join().unwrap()).collect()
    });

    assert_eq!(results.iter().filter(|r| r.is_ok()).count(), 1);
    for err in results.iter().filter_map(|r| r.as_ref().err()) {
        assert!(matches!(err.downcast_ref::<Error>(), Some(Error::AlreadyExists(_))));
    }
    env.overlay.close(Some(env.ids.peek()))?;
    Ok(())
}

#[test]
fn crossing_directory_moves_cannot_form_a_cycle() -> Result<()> {
    let env = shared(&[("a/x", b"x"), ("b/y", b"y")]);
    let a = lookup(&env.graph, "a");
    let b = lookup(&env.graph, "b");
    let barrier = Barrier::new(2);

    let (first, second) = thread::scope(|s| {
        let one = s.spawn(|| {
            barrier.wait();
            env.graph.rename(ROOT_NODE_ID, "a", b, "a")
        });
        let two = s.spawn(|| {
            barrier.wait();
            env.graph.rename(ROOT_NODE_ID, "b", a, "b")
        });
        (one.join().unwrap(), two.join().unwrap())
    });

    assert!(first.is_ok() != second.is_ok(), "exactly one move may win");
    let loser = first.err().or(second.err()).expect("one move failed");
    assert!(matches!(
        loser.downcast_ref::<Error>(),
        Some(Error::InvalidRename(_)) | Some(Error::NotFound(_))
    ));

    // Whichever won, both directories are still reachable from the root.
    let a_path = env.graph.path_of(a).expect("a linked");
    let b_path = env.graph.path_of(b).expect("b linked");
    assert!(a_path == "b/a" || b_path == "a/b", "{a_path} {b_path}");
    env.overlay.close(Some(env.ids.peek()))?;
    Ok(())
}

#[test]
fn parallel_materialization_of_shared_ancestors() -> Result<()> {
    let mut files = Vec::new();
    for t in 0..8 {
        for f in 0..4 {
            files.push((format!("top/mid/t{t}/f{f}"), vec![t as u8, f as u8]));
        }
    }
    let borrowed: Vec<(&str, &[u8])> = files
        .iter()
        .map(|(p, c)| (p.as_str(), c.as_slice()))
        .collect();
    let env = shared(&borrowed);
    let barrier = Barrier::new(8);

    thread::scope(|s| {
        for t in 0..8 {
            let graph = &env.graph;
            let barrier = &barrier;
            s.spawn(move || {
                barrier.wait();
                for f in 0..4 {
                    let id = lookup(graph, &format!("top/mid/t{t}/f{f}"));
                    graph.write_file(id, format!("edited {t}/{f}").as_bytes()).unwrap();
                }
            });
        }
    });

    for t in 0..8 {
        for f in 0..4 {
            let id = lookup(&env.graph, &format!("top/mid/t{t}/f{f}"));
            assert_eq!(env.graph.read_file(id)?, format!("edited {t}/{f}").into_bytes());
        }
    }
    let status = diff_for_status(
        &env.graph,
        env.snapshot,
        &DiffOptions {
            workers: 4,
            ..DiffOptions::default()
        },
        &NoIgnore,
    )?;
    assert_eq!(status.entries.len(), 32);

    // Every edited file and its ancestors have records reachable from root.
    let reachable = env.graph.reachable_records()?;
    assert!(reachable.contains(&ROOT_NODE_ID));
    assert!(reachable.contains(&lookup(&env.graph, "top/mid")));
    assert_eq!(env.graph.prune_unreachable_records()?, 0);
    env.overlay.close(Some(env.ids.peek()))?;
    Ok(())
}

#[test]
fn diff_runs_alongside_writers() -> Result<()> {
    let env = shared(&[("base/a", b"a"), ("base/b", b"b")]);
    let base = lookup(&env.graph, "base");
    thread::scope(|s| {
        s.spawn(|| {
            for i in 0..100 {
                env.graph.create(base, &format!("n{i}"), 0o644).unwrap();
            }
        });
        s.spawn(|| {
            for _ in 0..20 {
                let status =
                    diff_for_status(&env.graph, env.snapshot, &DiffOptions::default(), &NoIgnore)
                        .unwrap();
                assert!(status.errors.is_empty());
            }
        });
    });
    let status = diff_for_status(&env.graph, env.snapshot, &DiffOptions::default(), &NoIgnore)?;
    assert_eq!(status.entries.len(), 100);
    env.overlay.close(Some(env.ids.peek()))?;
    Ok(())
}

use ovfs::graph::NodeIdAllocator;
use ovfs::overlay::{Overlay, OverlayDir};
use ovfs::{NodeId, Result, ROOT_NODE_ID};
use tempfile::tempdir;

/// Allocate `count` ids and write a record for each, like a session that
/// materialized that many nodes.
fn materialize(overlay: &Overlay, ids: &NodeIdAllocator, count: usize) -> Result<Vec<NodeId>> {
    let mut out = Vec::new();
    for i in 0..count {
        let id = ids.next();
        if i % 2 == 0 {
            overlay.create_file(id, format!("file {i}").as_bytes())?;
        } else {
            overlay.save_dir(id, &OverlayDir::default())?;
        }
        out.push(id);
    }
    Ok(out)
}

#[test]
fn clean_shutdown_trusts_persisted_value() -> Result<()> {
    let dir = tempdir()?;
    let overlay = Overlay::new(dir.path());
    let ids = NodeIdAllocator::recover(&overlay, overlay.open(true)?)?;
    let allocated = materialize(&overlay, &ids, 5)?;
    // Ids handed out without a record still count after a clean close.
    let skipped = ids.next();
    overlay.close(Some(ids.peek()))?;

    let persisted = overlay.open(false)?;
    assert_eq!(persisted, Some(skipped.next()));
    let ids = NodeIdAllocator::recover(&overlay, persisted)?;
    let fresh = ids.next();
    assert!(allocated.iter().all(|id| fresh > *id));
    assert!(fresh > skipped);
    overlay.close(Some(ids.peek()))?;
    Ok(())
}

#[test]
fn unclean_shutdown_rescans_records() -> Result<()> {
    let dir = tempdir()?;
    {
        let overlay = Overlay::new(dir.path());
        let ids = NodeIdAllocator::recover(&overlay, overlay.open(true)?)?;
        materialize(&overlay, &ids, 300)?;
        // Dropped without close: the clean marker is never written.
    }

    let overlay = Overlay::new(dir.path());
    let persisted = overlay.open(false)?;
    assert_eq!(persisted, None);

    let max_on_disk = overlay.record_ids()?.into_iter().max().expect("records exist");
    let ids = NodeIdAllocator::recover(&overlay, persisted)?;
    let fresh = ids.next();
    assert!(fresh > max_on_disk, "{fresh} must exceed {max_on_disk}");
    assert_eq!(fresh, max_on_disk.next());
    overlay.close(Some(ids.peek()))?;
    Ok(())
}

#[test]
fn unclean_shutdown_honours_checkpoint_ahead_of_records() -> Result<()> {
    let dir = tempdir()?;
    {
        let overlay = Overlay::new(dir.path());
        let ids = NodeIdAllocator::recover(&overlay, overlay.open(true)?)?;
        materialize(&overlay, &ids, 3)?;
        for _ in 0..50 {
            ids.next();
        }
        overlay.checkpoint(ids.peek())?;
    }

    let overlay = Overlay::new(dir.path());
    let persisted = overlay.open(false)?;
    assert_eq!(persisted, None);
    assert_eq!(overlay.checkpoint_hint(), Some(NodeId::new(55)));
    let ids = NodeIdAllocator::recover(&overlay, persisted)?;
    assert_eq!(ids.next(), NodeId::new(55));
    overlay.close(None)?;
    Ok(())
}

#[test]
fn empty_unclean_overlay_starts_after_root() -> Result<()> {
    let dir = tempdir()?;
    {
        let overlay = Overlay::new(dir.path());
        overlay.open(true)?;
    }
    let overlay = Overlay::new(dir.path());
    let persisted = overlay.open(false)?;
    assert_eq!(persisted, None);
    assert_eq!(overlay.scan_for_next_node_id()?, ROOT_NODE_ID.next());
    let ids = NodeIdAllocator::recover(&overlay, persisted)?;
    assert_eq!(ids.next(), ROOT_NODE_ID.next());
    overlay.close(None)?;
    Ok(())
}

#[test]
fn stray_files_do_not_confuse_the_scan() -> Result<()> {
    let dir = tempdir()?;
    let overlay = Overlay::new(dir.path());
    overlay.open(true)?;
    overlay.create_file(NodeId::new(9), b"x")?;
    std::fs::write(dir.path().join("09/not-a-number"), b"junk")?;
    // Decimal name in the wrong shard.
    std::fs::write(dir.path().join("00/999"), b"junk")?;
    assert_eq!(overlay.record_ids()?, vec![NodeId::new(9)]);
    assert_eq!(overlay.scan_for_next_node_id()?, NodeId::new(10));
    overlay.close(None)?;
    Ok(())
}

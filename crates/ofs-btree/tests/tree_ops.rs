use ofs_btree::{BTree, Node, Path, Traversal};
use ofs_error::OfsError;
use ofs_journal::{Journal, Transaction};
use ofs_ondisk::{HEADER_SIZE, ItemHeader, KeyPtr, NodeHeader};
use ofs_types::{BlockNumber, Key, key_type};
use ofs_volume::{Volume, VolumeConfig};
use std::sync::Arc;

const NODE_SIZE: u32 = 4096;

fn journal(blocks: usize) -> Arc<Journal> {
    let config = VolumeConfig {
        node_size: NODE_SIZE,
        ..VolumeConfig::default()
    };
    Arc::new(Journal::new(Arc::new(
        Volume::in_memory(config, blocks).expect("volume"),
    )))
}

fn key(offset: u64) -> Key {
    Key::new(256, key_type::DIR_INDEX, offset)
}

fn payload(offset: u64, len: usize) -> Vec<u8> {
    let mut data = offset.to_le_bytes().to_vec();
    data.resize(len, 0xA5);
    data
}

/// Keys of every leaf, left to right.
fn leaves(tree: &BTree) -> Vec<Vec<Key>> {
    let mut path = tree.path();
    tree.locate(&mut path, &Key::MIN, Traversal::Forward)
        .expect("locate");
    let mut out = Vec::new();
    loop {
        out.push(leaf_keys(&path));
        match tree.next_leaf(&mut path) {
            Ok(()) => {}
            Err(err) if err.is_not_found() => break,
            Err(err) => panic!("next_leaf: {err}"),
        }
    }
    out
}

fn leaf_keys(path: &Path) -> Vec<Key> {
    let leaf = path.node(0).expect("leaf");
    (0..leaf.item_count().expect("count"))
        .map(|slot| leaf.key(slot).expect("key"))
        .collect()
}

fn root_node(tree: &BTree) -> Node {
    let mut node = Node::new(tree.volume());
    node.set_to(tree.root().block).expect("root");
    node
}

#[test]
fn insert_then_find_round_trip() {
    let journal = journal(256);
    let txn = Transaction::begin(&journal).expect("txn");
    let tree = BTree::create(&txn, Arc::clone(journal.volume()), 5).expect("create");
    for offset in (0..400).rev() {
        tree.insert(&txn, key(offset), &payload(offset, 24))
            .expect("insert");
    }
    txn.done().expect("commit");

    assert!(tree.root().level >= 1);
    for offset in 0..400 {
        let mut probe = key(offset);
        assert_eq!(
            tree.find_exact(&mut probe).expect("find"),
            payload(offset, 24)
        );
        assert_eq!(probe, key(offset));
    }
    let flat: Vec<Key> = leaves(&tree).into_iter().flatten().collect();
    assert_eq!(flat, (0..400).map(key).collect::<Vec<_>>());
}

#[test]
fn split_moves_upper_half_into_new_leaf() {
    let journal = journal(64);
    let txn = Transaction::begin(&journal).expect("txn");
    let tree = BTree::create(&txn, Arc::clone(journal.volume()), 5).expect("create");

    // 53 items of 50 bytes leave 20 bytes in a 4096-byte leaf.
    let mut expected: Vec<Key> = (0..53).map(|i| key(i * 2)).collect();
    for k in &expected {
        tree.insert(&txn, *k, &payload(k.offset, 50)).expect("fill");
    }
    assert_eq!(tree.root().level, 0);
    assert_eq!(root_node(&tree).space_left().expect("left"), 20);

    tree.insert(&txn, key(51), &payload(51, 50)).expect("split insert");
    expected.push(key(51));
    expected.sort();

    let root = root_node(&tree);
    assert_eq!(root.level().expect("level"), 1);
    assert_eq!(root.item_count().expect("count"), 2);

    let halves = leaves(&tree);
    assert_eq!(halves.len(), 2);
    assert_eq!(halves.concat(), expected);
    assert_eq!(root.index(0).expect("left").key, halves[0][0]);
    assert_eq!(root.index(1).expect("right").key, halves[1][0]);

    let right_block = tree
        .volume()
        .find_block(root.index(1).expect("right").blockptr)
        .expect("map");
    let mut right = Node::new(tree.volume());
    right.set_to(right_block).expect("bind");
    assert_eq!(
        right.space_used().expect("used") + right.space_left().expect("left"),
        NODE_SIZE as usize
    );
    assert!(right.space_used().expect("used") > HEADER_SIZE);
}

#[test]
fn remove_leaves_neighbours_intact() {
    let journal = journal(256);
    let txn = Transaction::begin(&journal).expect("txn");
    let tree = BTree::create(&txn, Arc::clone(journal.volume()), 5).expect("create");
    for offset in 0..300 {
        tree.insert(&txn, key(offset), &payload(offset, 16))
            .expect("insert");
    }
    for offset in (0..300).step_by(2) {
        assert_eq!(
            tree.remove(&txn, &key(offset)).expect("remove"),
            payload(offset, 16)
        );
    }
    txn.done().expect("commit");

    for offset in 0..300 {
        let result = tree.find_exact(&mut key(offset));
        if offset % 2 == 0 {
            assert!(result.expect_err("removed").is_not_found());
        } else {
            assert_eq!(result.expect("kept"), payload(offset, 16));
        }
    }
    let flat: Vec<Key> = leaves(&tree).into_iter().flatten().collect();
    assert_eq!(flat, (1..300).step_by(2).map(key).collect::<Vec<_>>());
}

#[test]
fn removing_everything_collapses_root() {
    let journal = journal(256);
    let txn = Transaction::begin(&journal).expect("txn");
    let tree = BTree::create(&txn, Arc::clone(journal.volume()), 5).expect("create");
    for offset in 0..200 {
        tree.insert(&txn, key(offset), &payload(offset, 30))
            .expect("insert");
    }
    assert!(tree.root().level >= 1);
    for offset in 0..200 {
        tree.remove(&txn, &key(offset)).expect("remove");
    }
    assert_eq!(tree.root().level, 0);
    assert_eq!(root_node(&tree).item_count().expect("count"), 0);
    assert!(tree.find_next(&mut key(0)).expect_err("empty").is_not_found());
    assert!(tree.remove(&txn, &key(0)).expect_err("gone").is_not_found());
}

#[test]
fn remove_entries_returns_run_and_rejects_overrun() {
    let journal = journal(32);
    let txn = Transaction::begin(&journal).expect("txn");
    let tree = BTree::create(&txn, Arc::clone(journal.volume()), 5).expect("create");
    let entries: Vec<(Key, Vec<u8>)> = (0..6).map(|i| (key(i), payload(i, 8))).collect();
    let borrowed: Vec<(Key, &[u8])> = entries.iter().map(|(k, d)| (*k, d.as_slice())).collect();
    let mut path = tree.path();
    assert_eq!(tree.insert_entries(&txn, &mut path, &borrowed).expect("insert"), 0);

    assert!(matches!(
        tree.remove_entries(&txn, &mut path, &key(4), 3),
        Err(OfsError::BadValue(_))
    ));
    let removed = tree
        .remove_entries(&txn, &mut path, &key(1), 2)
        .expect("remove");
    assert_eq!(removed.len(), 2);
    assert_eq!(removed[0].key, key(1));
    assert_eq!(removed[1].data, payload(2, 8));
    assert_eq!(leaves(&tree), vec![vec![key(0), key(3), key(4), key(5)]]);
}

#[test]
fn copy_on_write_replaces_root_and_keeps_old_image() {
    let journal = journal(64);
    let cache = Arc::clone(journal.volume().cache());
    let setup = Transaction::begin(&journal).expect("txn");
    let tree = BTree::create(&setup, Arc::clone(journal.volume()), 5).expect("create");
    for offset in 0..10 {
        tree.insert(&setup, key(offset), &payload(offset, 12))
            .expect("insert");
    }
    setup.done().expect("commit");

    let old_root = tree.root();
    let before = cache.get(old_root.block).expect("get").to_vec();
    let mut reader = tree.path();
    tree.locate(&mut reader, &key(4), Traversal::Exact)
        .expect("locate");

    let txn = Transaction::begin(&journal).expect("txn");
    tree.insert(&txn, key(100), b"new").expect("insert");
    let new_root = tree.root();
    assert_ne!(new_root.logical, old_root.logical);
    assert_ne!(new_root.block, old_root.block);
    assert_eq!(cache.get(old_root.block).expect("get").as_slice(), &before[..]);
    assert_eq!(reader.current_entry().expect("entry").data, payload(4, 12));

    // A second change in the same transaction rewrites the new root in place.
    tree.insert(&txn, key(101), b"again").expect("insert");
    assert_eq!(tree.root(), new_root);
    txn.done().expect("commit");

    let old = BTree::open(Arc::clone(journal.volume()), old_root.logical).expect("open");
    assert!(old.find_exact(&mut key(100)).expect_err("absent").is_not_found());
    assert_eq!(old.find_exact(&mut key(4)).expect("old"), payload(4, 12));
    assert_eq!(tree.find_exact(&mut key(101)).expect("new"), b"again");
}

#[test]
fn aborted_transaction_restores_root() {
    let journal = journal(64);
    let setup = Transaction::begin(&journal).expect("txn");
    let tree = BTree::create(&setup, Arc::clone(journal.volume()), 5).expect("create");
    tree.insert(&setup, key(1), b"one").expect("insert");
    setup.done().expect("commit");
    let committed = tree.root();

    {
        let txn = Transaction::begin(&journal).expect("txn");
        tree.insert(&txn, key(2), b"two").expect("insert");
        assert_ne!(tree.root(), committed);
    }
    assert_eq!(tree.root(), committed);
    assert!(tree.find_exact(&mut key(2)).expect_err("aborted").is_not_found());
    assert_eq!(tree.find_exact(&mut key(1)).expect("kept"), b"one");
}

#[test]
fn move_slot_crosses_leaves_and_stops_at_edges() {
    let journal = journal(128);
    let txn = Transaction::begin(&journal).expect("txn");
    let tree = BTree::create(&txn, Arc::clone(journal.volume()), 5).expect("create");
    for offset in 0..150 {
        tree.insert(&txn, key(offset), &payload(offset, 40))
            .expect("insert");
    }
    assert!(leaves(&tree).len() > 1);

    let mut path = tree.path();
    let slot = tree
        .locate(&mut path, &key(0), Traversal::Exact)
        .expect("locate");
    assert_eq!(slot, 0);
    assert!(path.move_slot(0, false).expect_err("left edge").is_not_found());
    assert_eq!(path.current_entry().expect("still first").key, key(0));

    let mut seen = vec![path.current_entry().expect("first").key];
    while path.move_slot(0, true).is_ok() {
        seen.push(path.current_entry().expect("entry").key);
    }
    assert_eq!(seen, (0..150).map(key).collect::<Vec<_>>());

    assert!(tree.previous_leaf(&mut path).is_ok());
    let last_of_previous = path.current_entry().expect("entry").key;
    assert!(last_of_previous < key(149));
}

#[test]
fn forward_locate_continues_into_next_leaf() {
    let journal = journal(128);
    let txn = Transaction::begin(&journal).expect("txn");
    let tree = BTree::create(&txn, Arc::clone(journal.volume()), 5).expect("create");
    for offset in (0..300).step_by(3) {
        tree.insert(&txn, key(offset), &payload(offset, 40))
            .expect("insert");
    }
    let layout = leaves(&tree);
    assert!(layout.len() > 1);
    let boundary = layout[1][0];

    let mut probe = boundary.with_offset(boundary.offset - 1);
    assert_eq!(tree.find_next(&mut probe).expect("next"), payload(boundary.offset, 40));
    assert_eq!(probe, boundary);

    let mut probe = key(1000);
    assert!(tree.find_next(&mut probe).expect_err("past end").is_not_found());
    let mut probe = key(1000);
    assert_eq!(tree.find_previous(&mut probe).expect("last"), payload(297, 40));
    assert_eq!(probe, key(297));
}

#[test]
fn backward_iteration_crosses_leaves_in_decreasing_order() {
    let journal = journal(256);
    let txn = Transaction::begin(&journal).expect("txn");
    let tree = BTree::create(&txn, Arc::clone(journal.volume()), 5).expect("create");
    for offset in (0..600).map(|i| i * 3) {
        tree.insert(&txn, key(offset), &payload(offset, 20))
            .expect("insert");
    }
    txn.done().expect("commit");
    let layout = leaves(&tree);
    assert!(layout.len() > 2);

    let mut iter = tree.iter(key(0));
    iter.rewind(true).expect("rewind");
    let mut seen = Vec::new();
    while let Ok((k, data)) = iter.get_previous_entry() {
        assert_eq!(data, payload(k.offset, 20));
        seen.push(k.offset);
    }
    assert_eq!(seen, (0..600).rev().map(|i| i * 3).collect::<Vec<_>>());

    // Queries between the last key of one leaf and the first of the next.
    for pair in layout.windows(2) {
        let last = *pair[0].last().expect("last");
        let first = pair[1][0];
        for offset in last.offset..first.offset {
            let mut query = key(offset);
            tree.find_previous(&mut query).expect("previous");
            assert_eq!(query, last);
        }
        let mut query = first;
        tree.find_previous(&mut query).expect("exact");
        assert_eq!(query, first);
    }
}

#[test]
fn split_at_depth_ceiling_is_rejected() {
    let journal = journal(16);
    let volume = Arc::clone(journal.volume());
    let cache = Arc::clone(volume.cache());
    let txn = cache.begin_transaction().expect("txn");
    let node_size = u64::from(NODE_SIZE);

    // Levels 0..=7 at blocks 1..=8; every internal node has two entries.
    for level in 0..8_u8 {
        let block = u64::from(level) + 1;
        let mut bytes = vec![0_u8; NODE_SIZE as usize];
        NodeHeader {
            bytenr: block * node_size,
            level,
            nritems: if level == 0 { 1 } else { 2 },
            owner: 5,
            ..NodeHeader::default()
        }
        .write_to_block(&mut bytes)
        .expect("header");
        if level == 0 {
            ItemHeader {
                key: key(1),
                data_offset: NODE_SIZE - u32::try_from(HEADER_SIZE).expect("header") - 4,
                data_size: 4,
            }
            .write(&mut bytes, 0)
            .expect("item");
        } else {
            for (slot, k) in [Key::MIN, key(1)].into_iter().enumerate() {
                KeyPtr {
                    key: k,
                    blockptr: block.saturating_sub(1) * node_size,
                    generation: 0,
                }
                .write(&mut bytes, slot)
                .expect("ptr");
            }
        }
        cache
            .get_empty(BlockNumber(block), txn)
            .expect("bind")
            .lock()
            .copy_from_slice(&bytes);
    }
    cache.end_transaction(txn, None).expect("commit");

    let tree = BTree::open(Arc::clone(&volume), 8 * node_size).expect("open");
    assert_eq!(tree.root().level, 7);
    let mut path = tree.path();
    tree.locate(&mut path, &key(1), Traversal::Exact)
        .expect("locate");
    assert_eq!(path.depth(), 8);

    let txn = Transaction::begin(&journal).expect("txn");
    assert!(matches!(
        tree.split_node(&txn, &mut path, 7),
        Err(OfsError::TreeTooDeep { depth: 9 })
    ));
    assert_eq!(tree.root().level, 7);
}

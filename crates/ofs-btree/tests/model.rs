use ofs_btree::BTree;
use ofs_error::OfsError;
use ofs_journal::{Journal, Transaction};
use ofs_types::{Key, key_type};
use ofs_volume::{Volume, VolumeConfig};
use proptest::prelude::*;
use std::collections::BTreeMap;
use std::sync::Arc;

#[derive(Debug, Clone)]
enum Op {
    Insert(u16, usize),
    Remove(u16),
    Commit,
}

fn op() -> impl Strategy<Value = Op> {
    prop_oneof![
        6 => (0_u16..512, 0_usize..120).prop_map(|(offset, len)| Op::Insert(offset, len)),
        3 => (0_u16..512).prop_map(Op::Remove),
        1 => Just(Op::Commit),
    ]
}

fn key(offset: u16) -> Key {
    Key::new(256, key_type::DIR_INDEX, u64::from(offset))
}

#[expect(clippy::cast_possible_truncation)]
fn payload(offset: u16, len: usize) -> Vec<u8> {
    (0..len)
        .map(|index| (usize::from(offset) + index) as u8)
        .collect()
}

fn walk(tree: &BTree, forward: bool) -> Vec<(Key, Vec<u8>)> {
    let mut iter = tree.iter(key(0));
    iter.rewind(!forward).expect("rewind");
    let mut out = Vec::new();
    loop {
        let step = if forward {
            iter.get_next_entry()
        } else {
            iter.get_previous_entry()
        };
        match step {
            Ok(entry) => out.push(entry),
            Err(err) if err.is_not_found() => return out,
            Err(err) => panic!("iterator failed: {err}"),
        }
    }
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(32))]

    #[test]
    fn tree_matches_ordered_map(ops in proptest::collection::vec(op(), 1..300)) {
        let config = VolumeConfig { node_size: 4096, ..VolumeConfig::default() };
        let journal = Arc::new(Journal::new(Arc::new(
            Volume::in_memory(config, 2048).expect("volume"),
        )));
        let mut txn = Transaction::begin(&journal).expect("txn");
        let tree = BTree::create(&txn, Arc::clone(journal.volume()), 5).expect("create");
        let mut model: BTreeMap<Key, Vec<u8>> = BTreeMap::new();

        for op in ops {
            match op {
                Op::Insert(offset, len) => {
                    let data = payload(offset, len);
                    let result = tree.insert(&txn, key(offset), &data);
                    if model.contains_key(&key(offset)) {
                        prop_assert!(matches!(result, Err(OfsError::BadValue(_))));
                    } else {
                        prop_assert!(result.is_ok());
                        model.insert(key(offset), data);
                    }
                }
                Op::Remove(offset) => {
                    let result = tree.remove(&txn, &key(offset));
                    match model.remove(&key(offset)) {
                        Some(expected) => prop_assert_eq!(result.expect("remove"), expected),
                        None => prop_assert!(result.expect_err("absent").is_not_found()),
                    }
                }
                Op::Commit => {
                    txn.done().expect("commit");
                    txn = Transaction::begin(&journal).expect("txn");
                }
            }
        }
        txn.done().expect("commit");

        let expected: Vec<(Key, Vec<u8>)> = model.into_iter().collect();
        prop_assert_eq!(walk(&tree, true), expected.clone());
        let mut backward = walk(&tree, false);
        backward.reverse();
        prop_assert_eq!(backward, expected.clone());
        let reopened = tree.reopen().expect("reopen");
        for (k, data) in &expected {
            let mut probe = *k;
            prop_assert_eq!(&reopened.find_exact(&mut probe).expect("find"), data);
        }
    }
}

//! Distributed garbage collection between two engines.

mod common;

use captp::{Bootstrap, CapTpOptions, Invocation, Message, MessageKind, Slot, SlotKind, Value, call};
use common::{loopback, quiesce, settle};
use tokio::task::LocalSet;

fn greeter() -> Value {
    Value::far("Greeter", |inv: &Invocation| -> Result<Value, Value> {
        Ok(Value::from(format!("hello {}", inv.name().unwrap_or("?"))))
    })
}

#[tokio::test]
async fn dropped_import_releases_the_export() {
    common::init_tracing();
    LocalSet::new()
        .run_until(async {
            let (left, right) = loopback(
                (Bootstrap::default(), CapTpOptions::default().gc_imports(true)),
                (greeter().into(), CapTpOptions::default()),
            );
            let export = Slot::local(SlotKind::Object, 1);
            let import = Slot::remote(SlotKind::Object, 1);

            let root = settle(&left.conn.get_bootstrap()).await.unwrap();
            assert_eq!(
                settle(&call(&root, "wave", [])).await,
                Ok(Value::from("hello wave"))
            );
            assert_eq!(right.conn.ref_count(export), 1);
            assert_eq!(left.conn.ref_count(import), 1);

            // The answered questions are garbage already; the root is not.
            left.conn.collect_garbage();
            quiesce().await;
            assert_eq!(left.conn.collect_garbage(), 0);
            assert_eq!(right.conn.export_count(), 1);

            drop(root);
            assert!(left.conn.collect_garbage() >= 1);
            quiesce().await;

            let drops: Vec<(Slot, u64)> = left
                .wire
                .borrow()
                .iter()
                .filter_map(|msg| match msg {
                    Message::Drop {
                        slot_id, dec_refs, ..
                    } => Some((*slot_id, *dec_refs)),
                    _ => None,
                })
                .collect();
            assert!(drops.contains(&(import, 1)), "drops sent: {drops:?}");

            assert_eq!(right.conn.export_count(), 0);
            assert_eq!(right.conn.ref_count(export), 0);
            assert_eq!(left.conn.ref_count(import), 0);
            assert!(right.conn.stats().gc_dropped >= 1);
            assert!(left.conn.stats().sent(MessageKind::Drop) >= 1);
        })
        .await;
}

#[tokio::test]
async fn export_survives_until_every_reference_is_dropped() {
    LocalSet::new()
        .run_until(async {
            let (left, right) = loopback(
                (Bootstrap::default(), CapTpOptions::default().gc_imports(true)),
                (greeter().into(), CapTpOptions::default()),
            );
            let export = Slot::local(SlotKind::Object, 1);

            // Two answers carry the same export.
            let first = settle(&left.conn.get_bootstrap()).await.unwrap();
            let second = settle(&left.conn.get_bootstrap()).await.unwrap();
            assert_eq!(first, second);
            assert_eq!(right.conn.ref_count(export), 2);
            left.conn.collect_garbage();
            quiesce().await;

            drop(first);
            assert_eq!(left.conn.collect_garbage(), 0);
            assert_eq!(right.conn.export_count(), 1);

            drop(second);
            left.conn.collect_garbage();
            quiesce().await;
            assert_eq!(right.conn.export_count(), 0);
        })
        .await;
}

#[tokio::test]
async fn imports_are_kept_without_gc() {
    LocalSet::new()
        .run_until(async {
            let (left, right) = loopback(
                (Bootstrap::default(), CapTpOptions::default()),
                (greeter().into(), CapTpOptions::default()),
            );
            let root = settle(&left.conn.get_bootstrap()).await.unwrap();
            drop(root);
            assert_eq!(left.conn.collect_garbage(), 0);
            quiesce().await;
            assert_eq!(right.conn.export_count(), 1);
            assert_eq!(left.conn.stats().sent(MessageKind::Drop), 0);
        })
        .await;
}

//! Property-based tests for the copy-on-write listener list.
//!
//! These generate random sequences of attach/detach against one function
//! context and check invariants that must hold no matter the order: slot
//! indices never shift under a live snapshot, and the set of "currently
//! attached" listeners observed through a snapshot always matches what a
//! plain model of the same operations would say.

use interceptor_core::context::{ContextKind, FunctionContext};
use interceptor_core::{InvocationContext, InvocationListener};
use proptest::prelude::*;
use std::collections::BTreeSet;
use std::sync::Arc;

struct TaggedListener(u32);

impl InvocationListener for TaggedListener {
    fn on_enter(&self, _ctx: &mut InvocationContext) {}
    fn on_leave(&self, _ctx: &mut InvocationContext) {}
}

fn new_ctx() -> FunctionContext {
    FunctionContext::new(0x5000, ContextKind::Default, Box::new(()), 0x6000, 0x7000, 8)
}

#[derive(Debug, Clone, Copy)]
enum Op {
    Attach(u32),
    Detach(u32),
}

fn op_strategy() -> impl Strategy<Value = Op> {
    prop_oneof![
        (0u32..8).prop_map(Op::Attach),
        (0u32..8).prop_map(Op::Detach),
    ]
}

proptest! {
    /// Replaying any sequence of attach/detach against one context leaves
    /// its listener snapshot containing exactly the ids that a plain set
    /// model says should still be attached, and slot indices for ids that
    /// stay attached the whole time never change.
    #[test]
    fn snapshot_matches_set_model(ops in prop::collection::vec(op_strategy(), 0..40)) {
        let ctx = new_ctx();
        let mut model: BTreeSet<u32> = BTreeSet::new();
        let mut handles: std::collections::HashMap<u32, Arc<dyn InvocationListener>> = std::collections::HashMap::new();

        for op in ops {
            match op {
                Op::Attach(id) => {
                    let listener: Arc<dyn InvocationListener> = Arc::new(TaggedListener(id));
                    if ctx.add_listener(listener.clone(), None).is_ok() {
                        model.insert(id);
                        handles.insert(id, listener);
                    }
                }
                Op::Detach(id) => {
                    if let Some(listener) = handles.remove(&id) {
                        if ctx.remove_listener(&listener).is_some() {
                            model.remove(&id);
                        }
                    }
                }
            }
        }

        let snapshot = ctx.listener_snapshot();
        let live_count = snapshot.iter().filter(|s| s.is_some()).count();
        prop_assert_eq!(live_count, model.len());
    }

    /// A slot index assigned to a listener that is never removed stays
    /// fixed across any number of unrelated attach/detach operations on
    /// other ids.
    #[test]
    fn surviving_slot_index_is_stable(other_ops in prop::collection::vec(op_strategy(), 0..30)) {
        let ctx = new_ctx();
        let anchor: Arc<dyn InvocationListener> = Arc::new(TaggedListener(999));
        ctx.add_listener(anchor.clone(), None).unwrap();
        let anchor_index = ctx
            .listener_snapshot()
            .iter()
            .position(|slot| matches!(slot, Some(e) if Arc::ptr_eq(&e.listener, &anchor)))
            .unwrap();

        let mut handles: std::collections::HashMap<u32, Arc<dyn InvocationListener>> = std::collections::HashMap::new();
        for op in other_ops {
            match op {
                Op::Attach(id) => {
                    let listener: Arc<dyn InvocationListener> = Arc::new(TaggedListener(id));
                    if ctx.add_listener(listener.clone(), None).is_ok() {
                        handles.insert(id, listener);
                    }
                }
                Op::Detach(id) => {
                    if let Some(listener) = handles.remove(&id) {
                        ctx.remove_listener(&listener);
                    }
                }
            }

            let snapshot = ctx.listener_snapshot();
            prop_assert!(matches!(&snapshot[anchor_index], Some(e) if Arc::ptr_eq(&e.listener, &anchor)));
        }
    }
}

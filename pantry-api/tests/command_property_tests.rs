//! Property-based tests for command application.
//!
//! - Ordering: whatever order update deliveries are processed in, the stored
//!   entity ends at the last submitted update.
//! - Idempotence: any number of creates for one id store exactly one entity,
//!   the first one applied.
//! - Validation: invalid fields are rejected before anything is published.

mod support;

use pantry_broker::Broker;
use pantry_core::{new_entity_id, EntityFields, RoutingKey};
use pantry_test_utils::generators::{arb_entity_fields, arb_invalid_entity_fields};
use proptest::prelude::*;
use support::TestHarness;
use tokio::runtime::Runtime;

fn test_runtime() -> Result<Runtime, TestCaseError> {
    Runtime::new().map_err(|e| TestCaseError::fail(format!("Failed to create runtime: {}", e)))
}

fn updates_with_order() -> impl Strategy<Value = (Vec<EntityFields>, Vec<usize>)> {
    prop::collection::vec(arb_entity_fields(), 1..6).prop_flat_map(|updates| {
        let order: Vec<usize> = (0..updates.len()).collect();
        (Just(updates), Just(order).prop_shuffle())
    })
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(24))]

    #[test]
    fn prop_last_update_wins_in_any_processing_order(
        initial in arb_entity_fields(),
        (updates, order) in updates_with_order(),
    ) {
        let rt = test_runtime()?;
        rt.block_on(async {
            let harness = TestHarness::idle(3);
            let publisher = harness.runtime.state.publisher.clone();
            let processor = harness.runtime.processor.clone();
            let id = new_entity_id();

            publisher
                .create(Some(id), initial)
                .await
                .map_err(|e| TestCaseError::fail(e.to_string()))?;
            processor
                .process_next(RoutingKey::EntityCreate)
                .await
                .map_err(|e| TestCaseError::fail(e.to_string()))?;

            for fields in &updates {
                publisher
                    .update(id, fields.clone())
                    .await
                    .map_err(|e| TestCaseError::fail(e.to_string()))?;
            }

            let mut deliveries = Vec::with_capacity(updates.len());
            for _ in 0..updates.len() {
                let delivery = harness
                    .memory
                    .broker
                    .consume(RoutingKey::EntityUpdate)
                    .await
                    .map_err(|e| TestCaseError::fail(e.to_string()))?;
                deliveries.push(delivery);
            }
            for index in &order {
                processor.process(&deliveries[*index]).await;
            }

            let stored = harness.stored(id).await.map(|entity| entity.fields());
            prop_assert_eq!(stored.as_ref(), updates.last());

            let metrics = processor.metrics().snapshot();
            prop_assert_eq!(metrics.applied + metrics.stale_skipped, updates.len() as u64 + 1);
            Ok(())
        })?;
    }

    #[test]
    fn prop_repeated_create_stores_first(
        creates in prop::collection::vec(arb_entity_fields(), 1..5),
    ) {
        let rt = test_runtime()?;
        rt.block_on(async {
            let harness = TestHarness::idle(3);
            let publisher = harness.runtime.state.publisher.clone();
            let processor = harness.runtime.processor.clone();
            let id = new_entity_id();

            for fields in &creates {
                publisher
                    .create(Some(id), fields.clone())
                    .await
                    .map_err(|e| TestCaseError::fail(e.to_string()))?;
            }
            for _ in &creates {
                processor
                    .process_next(RoutingKey::EntityCreate)
                    .await
                    .map_err(|e| TestCaseError::fail(e.to_string()))?;
            }

            prop_assert_eq!(harness.memory.store.len(), 1);
            let stored = harness.stored(id).await.map(|entity| entity.fields());
            prop_assert_eq!(stored.as_ref(), creates.first());
            prop_assert_eq!(processor.metrics().snapshot().duplicates, creates.len() as u64 - 1);
            Ok(())
        })?;
    }

    #[test]
    fn prop_invalid_fields_never_published(fields in arb_invalid_entity_fields()) {
        let rt = test_runtime()?;
        rt.block_on(async {
            let harness = TestHarness::idle(3);
            let publisher = harness.runtime.state.publisher.clone();

            prop_assert!(publisher.create(None, fields.clone()).await.is_err());
            prop_assert!(publisher.update(new_entity_id(), fields).await.is_err());

            for key in RoutingKey::ALL {
                let depth = harness
                    .memory
                    .broker
                    .depth(key)
                    .await
                    .map_err(|e| TestCaseError::fail(e.to_string()))?;
                prop_assert_eq!(depth.ready, 0);
            }
            Ok(())
        })?;
    }
}

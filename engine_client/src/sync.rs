//! Applies server-authoritative state to local entities.

use std::collections::HashMap;

use engine_shared::net::{EntityId, InputMessage, StateMessage};
use tracing::{debug, warn};

use crate::entity::{lock, EntityHandle};

pub type EntityTable = HashMap<EntityId, EntityHandle>;

/// Writes every snapshot in `state` onto the matching entity. Remote
/// entities also take the authoritative action vector; the local entity
/// keeps its own input. Returns the number of entities updated.
pub fn apply_state(entities: &EntityTable, local: Option<EntityId>, state: &StateMessage) -> usize {
    let mut applied = 0;
    for update in &state.entities {
        let Some(handle) = entities.get(&update.entity) else {
            debug!(entity = ?update.entity, tick = state.tick, "State for unknown entity");
            continue;
        };
        let mut entity = lock(handle);
        if let Err(e) = entity.apply_snapshot(update.physics.as_ref()) {
            warn!(entity = ?update.entity, error = %e, "Rejected snapshot");
            continue;
        }
        if Some(update.entity) != local {
            entity.apply_remote_input(&update.input);
        }
        applied += 1;
    }
    applied
}

/// Applies a peer's relayed input. Echoes of our own input are ignored.
pub fn apply_remote_input(entities: &EntityTable, local: Option<EntityId>, msg: &InputMessage) -> bool {
    if Some(msg.entity) == local {
        return false;
    }
    let Some(handle) = entities.get(&msg.entity) else {
        debug!(entity = ?msg.entity, "Input for unknown entity");
        return false;
    };
    let mut entity = lock(handle);
    if let Some(device) = msg.device {
        entity.set_device(device);
    }
    if let Err(e) = entity.apply_snapshot(msg.physics.as_ref()) {
        warn!(entity = ?msg.entity, error = %e, "Rejected snapshot");
    }
    entity.apply_remote_input(&msg.frame)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entity::{tests::RecordingSink, GameEntity};
    use engine_shared::{
        actions::ActionFrame,
        bindings::Device,
        net::EntityStateMessage,
        physics::{PhysicsBody, PhysicsSnapshot},
    };

    fn table(ids: &[u64], sink: &RecordingSink) -> EntityTable {
        ids.iter()
            .map(|&id| {
                let handle = GameEntity::new(EntityId(id), "ship")
                    .with_sink(sink.clone())
                    .into_handle();
                (EntityId(id), handle)
            })
            .collect()
    }

    fn update(id: u64, x: f64, actions: Vec<(u16, f32)>) -> EntityStateMessage {
        let body = PhysicsBody {
            position: [x, 0.0],
            ..Default::default()
        };
        EntityStateMessage {
            entity: EntityId(id),
            kind: "ship".into(),
            physics: Some(body.snapshot()),
            input: ActionFrame {
                actions,
                mouse: [0.0, 0.0],
            },
        }
    }

    #[test]
    fn state_updates_bodies_and_remote_input_only() {
        let sink = RecordingSink::default();
        let entities = table(&[1, 2], &sink);
        lock(&entities[&EntityId(1)]).set_action(5, 1.0);

        let state = StateMessage {
            tick: 3,
            entities: vec![
                update(1, 1.0, vec![]),
                update(2, 2.0, vec![(1, 1.0)]),
                update(9, 0.0, vec![]),
            ],
        };
        assert_eq!(apply_state(&entities, Some(EntityId(1)), &state), 2);

        let local = lock(&entities[&EntityId(1)]);
        assert_eq!(local.body().unwrap().position, [1.0, 0.0]);
        assert_eq!(local.get_action_value(5), 1.0);
        drop(local);

        let remote = lock(&entities[&EntityId(2)]);
        assert_eq!(remote.body().unwrap().position, [2.0, 0.0]);
        assert_eq!(remote.get_action_value(1), 1.0);
        // Only the local keypress reached the sink.
        assert_eq!(sink.calls().len(), 1);
    }

    #[test]
    fn malformed_snapshot_skips_entity() {
        let entities = table(&[2], &RecordingSink::default());
        let mut bad = update(2, 0.0, vec![(1, 1.0)]);
        bad.physics = Some(PhysicsSnapshot(
            ["x".into()],
            ["0".into(), "0".into()],
            ["0".into(), "0".into()],
            ["0".into()],
        ));
        let state = StateMessage {
            tick: 1,
            entities: vec![bad],
        };
        assert_eq!(apply_state(&entities, None, &state), 0);
        assert_eq!(lock(&entities[&EntityId(2)]).get_action_value(1), 0.0);
    }

    #[test]
    fn own_input_echo_is_ignored() {
        let entities = table(&[1, 2], &RecordingSink::default());
        let msg = |id| InputMessage {
            entity: EntityId(id),
            device: Some(Device::Controller),
            frame: ActionFrame {
                actions: vec![(8, 0.5)],
                mouse: [0.0, 0.0],
            },
            physics: None,
        };
        assert!(!apply_remote_input(&entities, Some(EntityId(1)), &msg(1)));
        assert!(apply_remote_input(&entities, Some(EntityId(1)), &msg(2)));

        let remote = lock(&entities[&EntityId(2)]);
        assert_eq!(remote.get_action_value(8), 0.5);
        assert_eq!(remote.actions().unwrap().device(), Some(Device::Controller));
    }
}

//! Wire format of commands on the broker.
//!
//! The message body is JSON:
//!
//! ```json
//! {
//!   "command_id": "0190...",
//!   "kind": "update",
//!   "entity_id": "0190...",
//!   "sequence": 1718000000000001,
//!   "submitted_at": "2024-06-10T08:00:00Z",
//!   "attempt": 1,
//!   "payload": { "name": "Soup", "ingredients": "water,salt", "duration": 10 }
//! }
//! ```
//!
//! `payload` is omitted for deletes. Mapping between [`Command`] and the
//! message is spelled out field by field in both directions.

use chrono::{DateTime, Utc};
use pantry_core::{Command, CommandKind, EntityFields, PantryError, PantryResult, RoutingKey};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
struct CommandMessage {
    command_id: String,
    kind: String,
    entity_id: String,
    sequence: u64,
    submitted_at: DateTime<Utc>,
    attempt: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    payload: Option<PayloadMessage>,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
struct PayloadMessage {
    name: String,
    ingredients: String,
    duration: i64,
}

/// Serialize a command into a message body.
pub fn encode_command(command: &Command) -> PantryResult<Vec<u8>> {
    let message = CommandMessage {
        command_id: command.command_id.to_string(),
        kind: command.kind.as_str().to_string(),
        entity_id: command.entity_id.to_string(),
        sequence: command.sequence,
        submitted_at: command.submitted_at,
        attempt: command.attempt,
        payload: command.payload.as_ref().map(|fields| PayloadMessage {
            name: fields.name.clone(),
            ingredients: fields.ingredients.clone(),
            duration: fields.duration,
        }),
    };
    Ok(serde_json::to_vec(&message)?)
}

/// Parse a message body received on the queue bound to `routing_key`.
///
/// Any deviation from the schema is a `Serialization` error: unparseable
/// JSON, bad ids, a kind that does not match the routing key, a missing or
/// unexpected payload, or payload fields that violate the entity invariants.
pub fn decode_command(routing_key: RoutingKey, body: &[u8]) -> PantryResult<Command> {
    let message: CommandMessage = serde_json::from_slice(body)?;

    let kind: CommandKind = message.kind.parse().map_err(PantryError::serialization)?;
    if kind != routing_key.kind() {
        return Err(PantryError::serialization(format!(
            "{} command received under routing key {}",
            kind, routing_key
        )));
    }

    let command_id = Uuid::parse_str(&message.command_id)
        .map_err(|e| PantryError::serialization(format!("command_id: {}", e)))?;
    let entity_id = Uuid::parse_str(&message.entity_id)
        .map_err(|e| PantryError::serialization(format!("entity_id: {}", e)))?;

    if message.attempt == 0 {
        return Err(PantryError::serialization("attempt must start at 1"));
    }

    let payload = match (kind.requires_payload(), message.payload) {
        (true, Some(payload)) => {
            let fields = EntityFields {
                name: payload.name,
                ingredients: payload.ingredients,
                duration: payload.duration,
            };
            fields
                .validate()
                .map_err(|e| PantryError::serialization(format!("payload: {}", e)))?;
            Some(fields)
        }
        (true, None) => {
            return Err(PantryError::serialization(format!("{} command without payload", kind)))
        }
        (false, Some(_)) => {
            return Err(PantryError::serialization(format!("{} command with payload", kind)))
        }
        (false, None) => None,
    };

    Ok(Command {
        command_id,
        kind,
        entity_id,
        payload,
        submitted_at: message.submitted_at,
        sequence: message.sequence,
        attempt: message.attempt,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use pantry_core::new_entity_id;

    fn assert_serialization_error(result: PantryResult<Command>) {
        assert!(
            matches!(result, Err(PantryError::Serialization { .. })),
            "expected serialization error, got {:?}",
            result
        );
    }

    #[test]
    fn test_encode_decode_update() {
        let command = Command::update(new_entity_id(), EntityFields::new("Soup", "water,salt", 10), 42)
            .next_attempt();
        let body = encode_command(&command).unwrap();
        let decoded = decode_command(RoutingKey::EntityUpdate, &body).unwrap();
        assert_eq!(decoded, command);
    }

    #[test]
    fn test_delete_omits_payload() {
        let command = Command::delete(new_entity_id(), 1);
        let body = encode_command(&command).unwrap();
        let json: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert!(json.get("payload").is_none());
        assert_eq!(json["kind"], "delete");
        assert_eq!(decode_command(RoutingKey::EntityDelete, &body).unwrap(), command);
    }

    #[test]
    fn test_garbage_is_serialization_error() {
        assert_serialization_error(decode_command(RoutingKey::EntityCreate, b"not json"));
        assert_serialization_error(decode_command(RoutingKey::EntityCreate, b"{}"));
    }

    #[test]
    fn test_kind_must_match_routing_key() {
        let command = Command::create(new_entity_id(), EntityFields::new("a", "b", 1), 1);
        let body = encode_command(&command).unwrap();
        assert_serialization_error(decode_command(RoutingKey::EntityUpdate, &body));
    }

    #[test]
    fn test_payload_rules() {
        let id = new_entity_id();
        let missing = serde_json::json!({
            "command_id": Uuid::now_v7().to_string(),
            "kind": "create",
            "entity_id": id.to_string(),
            "sequence": 1,
            "submitted_at": "2024-06-10T08:00:00Z",
            "attempt": 1
        });
        assert_serialization_error(decode_command(
            RoutingKey::EntityCreate,
            &serde_json::to_vec(&missing).unwrap(),
        ));

        let invalid = serde_json::json!({
            "command_id": Uuid::now_v7().to_string(),
            "kind": "create",
            "entity_id": id.to_string(),
            "sequence": 1,
            "submitted_at": "2024-06-10T08:00:00Z",
            "attempt": 1,
            "payload": { "name": "", "ingredients": "x", "duration": 5 }
        });
        assert_serialization_error(decode_command(
            RoutingKey::EntityCreate,
            &serde_json::to_vec(&invalid).unwrap(),
        ));

        let delete_with_payload = serde_json::json!({
            "command_id": Uuid::now_v7().to_string(),
            "kind": "delete",
            "entity_id": id.to_string(),
            "sequence": 1,
            "submitted_at": "2024-06-10T08:00:00Z",
            "attempt": 1,
            "payload": { "name": "a", "ingredients": "x", "duration": 5 }
        });
        assert_serialization_error(decode_command(
            RoutingKey::EntityDelete,
            &serde_json::to_vec(&delete_with_payload).unwrap(),
        ));
    }

    #[test]
    fn test_bad_entity_id() {
        let json = serde_json::json!({
            "command_id": Uuid::now_v7().to_string(),
            "kind": "delete",
            "entity_id": "recipe-1",
            "sequence": 1,
            "submitted_at": "2024-06-10T08:00:00Z",
            "attempt": 1
        });
        assert_serialization_error(decode_command(
            RoutingKey::EntityDelete,
            &serde_json::to_vec(&json).unwrap(),
        ));
    }

    mod properties {
        use super::*;
        use pantry_core::EntityFields;
        use proptest::prelude::*;

        fn fields_strategy() -> impl Strategy<Value = EntityFields> {
            ("[A-Za-z][A-Za-z ]{0,20}", "[a-z]{1,8}(,[a-z]{1,8}){0,4}", 1i64..10_000)
                .prop_map(|(name, ingredients, duration)| EntityFields::new(name, ingredients, duration))
        }

        fn command_strategy() -> impl Strategy<Value = Command> {
            let id = any::<[u8; 16]>().prop_map(Uuid::from_bytes);
            (id, fields_strategy(), 1u64..u64::MAX, 0usize..3, 1u32..10).prop_map(
                |(entity_id, fields, sequence, kind, attempt)| {
                    let command = match kind {
                        0 => Command::create(entity_id, fields, sequence),
                        1 => Command::update(entity_id, fields, sequence),
                        _ => Command::delete(entity_id, sequence),
                    };
                    Command { attempt, ..command }
                },
            )
        }

        proptest! {
            #![proptest_config(ProptestConfig::with_cases(256))]

            /// A body decodes under its own routing key only, and there it
            /// yields the command that was encoded.
            #[test]
            fn prop_decodes_only_under_own_routing_key(command in command_strategy()) {
                let body = encode_command(&command).expect("encode should succeed");
                for key in RoutingKey::ALL {
                    let decoded = decode_command(key, &body);
                    if key == command.routing_key() {
                        prop_assert_eq!(decoded.expect("own key should decode"), command.clone());
                    } else {
                        prop_assert!(
                            matches!(decoded, Err(PantryError::Serialization { .. })),
                            "decoded under foreign key {}",
                            key
                        );
                    }
                }
            }

            /// A truncated body never decodes.
            #[test]
            fn prop_truncated_body_is_rejected(command in command_strategy(), cut in any::<prop::sample::Index>()) {
                let body = encode_command(&command).expect("encode should succeed");
                let truncated = &body[..cut.index(body.len())];
                prop_assert!(decode_command(command.routing_key(), truncated).is_err());
            }
        }
    }
}

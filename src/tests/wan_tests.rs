// WAN connection tests - bounded enumeration and snapshot updates

use super::support::*;
use crate::upnp::types::{GET_EXTERNAL_IP_ADDRESS, GET_GENERIC_PORT_MAPPING_ENTRY, GET_STATUS_INFO};
use crate::upnp::{
    ACTION_CONCURRENCY, ActionError, ConnectionStatus, MAX_MAPPING_ENTRIES, PortMapping, Protocol,
    WanConnection,
};

fn table(count: u16) -> Vec<PortMapping> {
    (0..count).map(|i| foreign_mapping(10_000 + i)).collect()
}

#[tokio::test]
async fn test_create_reads_status_and_table() {
    let router = ScriptedRouter::new()
        .with_table(PPP_SERVICE_ID, vec![foreign_mapping(7144), local_mapping(8080)]);

    let connection = WanConnection::create(&router, ppp_service()).await;

    assert_eq!(connection.external_ip(), Some(EXTERNAL_IP));
    assert_eq!(connection.status(), ConnectionStatus::Connected);
    assert!(connection.is_online());
    assert_eq!(connection.mapping_count(), 2);
    assert_eq!(connection.generation(), 0);

    let mappings: Vec<&PortMapping> = connection.mappings().collect();
    assert_eq!(mappings[0], &foreign_mapping(7144));
    assert_eq!(mappings[1], &local_mapping(8080));

    // Two entries, then index 2 reports the end of the table
    assert_eq!(router.count(GET_EXTERNAL_IP_ADDRESS), 1);
    assert_eq!(router.count(GET_STATUS_INFO), 1);
    assert!(router.count(GET_GENERIC_PORT_MAPPING_ENTRY) >= 3);
    assert!(router.count(GET_GENERIC_PORT_MAPPING_ENTRY) <= 4);
}

#[tokio::test]
async fn test_enumeration_capped_at_sixteen_entries() {
    let router = ScriptedRouter::new().with_table(PPP_SERVICE_ID, table(20));

    let connection = WanConnection::create(&router, ppp_service()).await;

    assert_eq!(connection.mapping_count(), MAX_MAPPING_ENTRIES as usize);
    assert_eq!(
        router.count(GET_GENERIC_PORT_MAPPING_ENTRY),
        MAX_MAPPING_ENTRIES as usize
    );
}

#[tokio::test]
async fn test_enumeration_stops_at_first_failure() {
    let router = ScriptedRouter::new()
        .with_table(PPP_SERVICE_ID, table(10))
        .with_entry_failure(3, ActionError::Transport("connection reset".to_string()));

    let connection = WanConnection::create(&router, ppp_service()).await;

    // Entries 0 to 2 survive; nothing at or after the failing index is kept
    let indices: Vec<u32> = connection.indexed_mappings().map(|(i, _)| i).collect();
    assert_eq!(indices, vec![0, 1, 2]);

    // At most the failing index plus the one already in flight were requested
    assert!(router.count(GET_GENERIC_PORT_MAPPING_ENTRY) <= 3 + 2);
}

#[tokio::test]
async fn test_fault_at_index_zero_is_empty_table() {
    let router = ScriptedRouter::new();

    let connection = WanConnection::create(&router, ppp_service()).await;

    assert_eq!(connection.mapping_count(), 0);
    assert!(connection.is_online());
    assert!(router.count(GET_GENERIC_PORT_MAPPING_ENTRY) <= 2);
}

#[tokio::test]
async fn test_at_most_two_actions_in_flight() {
    let router = ScriptedRouter::new().with_table(PPP_SERVICE_ID, table(16));

    WanConnection::create(&router, ppp_service()).await;

    assert!(router.max_in_flight() >= 1);
    assert!(router.max_in_flight() <= ACTION_CONCURRENCY);
}

#[tokio::test]
async fn test_failed_status_actions_keep_defaults() {
    let router = ScriptedRouter::new()
        .without_external_ip()
        .with_action_failure(
            GET_STATUS_INFO,
            ActionError::Transport("timed out".to_string()),
        )
        .with_table(PPP_SERVICE_ID, vec![foreign_mapping(7144)]);

    let connection = WanConnection::create(&router, ppp_service()).await;

    assert_eq!(connection.external_ip(), None);
    assert_eq!(connection.status(), ConnectionStatus::Disconnected);
    assert!(!connection.is_online());
    // The table is still read
    assert_eq!(connection.mapping_count(), 1);
}

#[tokio::test]
async fn test_table_skipped_when_not_advertised() {
    let router = ScriptedRouter::new().with_table(PPP_SERVICE_ID, table(4));
    let mut service = ppp_service();
    service.actions = Some(vec![
        GET_EXTERNAL_IP_ADDRESS.to_string(),
        GET_STATUS_INFO.to_string(),
    ]);

    let connection = WanConnection::create(&router, service).await;

    assert_eq!(connection.mapping_count(), 0);
    assert_eq!(router.count(GET_GENERIC_PORT_MAPPING_ENTRY), 0);
}

#[test]
fn test_snapshot_add_and_remove() {
    let connection = WanConnection::from_parts(
        ppp_service(),
        Some(EXTERNAL_IP.to_string()),
        ConnectionStatus::Connected,
        vec![foreign_mapping(7144), foreign_mapping(8080)],
    );

    let removed = connection.with_mapping_removed(7144, Protocol::TCP);
    assert_eq!(removed.generation(), 1);
    assert_eq!(removed.mapping_count(), 1);
    assert!(removed.find_mapping(7144, Protocol::TCP).is_none());

    let added = removed.with_mapping_added(local_mapping(7144));
    assert_eq!(added.generation(), 2);
    assert_eq!(added.find_mapping(7144, Protocol::TCP), Some(&local_mapping(7144)));

    // The first snapshot is untouched
    assert_eq!(connection.mapping_count(), 2);
    assert_eq!(connection.generation(), 0);
}

#[test]
fn test_add_replaces_existing_entry() {
    let connection = WanConnection::from_parts(
        ppp_service(),
        Some(EXTERNAL_IP.to_string()),
        ConnectionStatus::Connected,
        vec![foreign_mapping(7144)],
    );

    let added = connection.with_mapping_added(local_mapping(7144));

    assert_eq!(added.mapping_count(), 1);
    assert!(added.find_mapping(7144, Protocol::TCP).unwrap().is_owned_by(LOCAL_IP));
}

#[tokio::test]
async fn test_apply_ignores_failed_notice() {
    let router = ScriptedRouter::new();
    let connection = WanConnection::create(&router, ppp_service()).await;

    let failed = connection
        .manipulator(&router)
        .delete_port(&PortMapping::key(7144, Protocol::TCP))
        .await;
    assert!(!failed.is_success());
    assert_eq!(connection.apply(&failed), connection);

    let added = connection
        .manipulator(&router)
        .add_port(&local_mapping(7144))
        .await;
    let next = connection.apply(&added);
    assert_eq!(next.generation(), 1);
    assert_eq!(next.find_mapping(7144, Protocol::TCP), Some(&local_mapping(7144)));
}

#[tokio::test]
async fn test_manual_mapping_added_and_removed() {
    let router = ScriptedRouter::new().with_table(PPP_SERVICE_ID, vec![foreign_mapping(7144)]);
    let connection = WanConnection::create(&router, ppp_service()).await;
    let mapping = PortMapping::new(8000, 7144, Protocol::UDP, OTHER_IP, "PecaPort(manual)");

    let added = connection.manipulator(&router).add_port(&mapping).await;
    assert!(added.is_success());
    let connection = connection.apply(&added);
    assert_eq!(connection.find_mapping(8000, Protocol::UDP), Some(&mapping));
    assert_eq!(
        router.table(PPP_SERVICE_ID),
        vec![foreign_mapping(7144), mapping.clone()]
    );

    // An entry read from the table can be deleted as is
    let entry = connection.find_mapping(7144, Protocol::TCP).unwrap();
    let removed = connection.manipulator(&router).delete_port(entry).await;
    assert!(removed.is_success());
    assert_eq!(connection.apply(&removed).mapping_count(), 1);
    assert_eq!(router.table(PPP_SERVICE_ID), vec![mapping]);
}

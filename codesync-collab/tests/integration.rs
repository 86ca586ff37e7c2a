//! Integration tests for end-to-end file sync over WebSocket.
//!
//! These tests start a real server and connect real clients,
//! verifying the full request/reply and notification pipeline.

use codesync_collab::agent::{AgentConfig, AgentEvent, ClientSyncAgent, SaveTransport, SyncState};
use codesync_collab::client::{
    ClientConfig, ClientEvent, ClientIdentity, ConnectionState, SyncClient,
};
use codesync_collab::model::{File, NewFile};
use codesync_collab::protocol::{Envelope, Request, Response, STATUS_BAD_REQUEST};
use codesync_collab::server::{ServerConfig, SyncServer};
use codesync_collab::service::SyncError;
use futures_util::{SinkExt, StreamExt};
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio::time::{timeout, Duration};
use tokio_tungstenite::tungstenite::Message;
use uuid::Uuid;

/// Start a server on a free port, return its URL.
async fn start_test_server() -> (String, Arc<SyncServer>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let server = Arc::new(SyncServer::new(ServerConfig::for_testing()));
    let running = Arc::clone(&server);
    tokio::spawn(async move {
        running.serve(listener).await.unwrap();
    });
    (format!("ws://{addr}"), server)
}

async fn connected_client(url: &str, project_id: Uuid, name: &str) -> SyncClient {
    let client = SyncClient::new(ClientIdentity::new(project_id, name), url, ClientConfig::for_testing());
    client.connect().await.unwrap();
    client
}

/// Wait for the first event matching `pred`.
async fn wait_for<F>(rx: &mut mpsc::UnboundedReceiver<ClientEvent>, mut pred: F) -> ClientEvent
where
    F: FnMut(&ClientEvent) -> bool,
{
    timeout(Duration::from_secs(3), async {
        loop {
            let event = rx.recv().await.expect("event channel closed");
            if pred(&event) {
                return event;
            }
        }
    })
    .await
    .expect("timed out waiting for event")
}

#[tokio::test]
async fn test_client_connects_and_gets_session() {
    let (url, server) = start_test_server().await;
    let project = Uuid::new_v4();

    let client = SyncClient::new(ClientIdentity::new(project, "Alice"), &url, ClientConfig::for_testing());
    let mut events = client.take_event_rx().unwrap();
    let session = client.connect().await.unwrap();

    assert_eq!(session.project_id, project);
    assert_eq!(session.name, "Alice");
    assert!(session.open_files.is_empty());
    assert_eq!(client.connection_state().await, ConnectionState::Connected);
    assert!(matches!(
        wait_for(&mut events, |e| matches!(e, ClientEvent::Connected { .. })).await,
        ClientEvent::Connected { session: s } if s.id == session.id
    ));

    client.ping().await.unwrap();
    assert!(server.stats().await.total_connections >= 1);
}

#[tokio::test]
async fn test_requests_before_hello_are_rejected() {
    let (url, _server) = start_test_server().await;
    let (mut ws, _) = tokio_tungstenite::connect_async(url.as_str()).await.unwrap();

    let frame = Envelope::request(1, Request::GetFile { id: Uuid::new_v4() }).encode().unwrap();
    ws.send(Message::Binary(frame.into())).await.unwrap();

    let reply = timeout(Duration::from_secs(2), async {
        loop {
            if let Some(Ok(Message::Binary(data))) = ws.next().await {
                return Envelope::decode(&data).unwrap();
            }
        }
    })
    .await
    .unwrap();

    match reply {
        Envelope::Reply { id, status, response } => {
            assert_eq!(id, 1);
            assert_eq!(status, STATUS_BAD_REQUEST);
            assert!(matches!(response, Response::Error { .. }));
        }
        other => panic!("Expected reply, got {other:?}"),
    }
}

#[tokio::test]
async fn test_create_then_update_scenario() {
    let (url, _server) = start_test_server().await;
    let project = Uuid::new_v4();
    let client = connected_client(&url, project, "Alice").await;

    let file = client
        .create_file(NewFile::file(project, None, "main.move", "module 0x1::M {}").with_language("move"))
        .await
        .unwrap();
    assert_eq!(file.version, 1);
    assert_eq!(file.language.as_deref(), Some("move"));

    let updated = client.update_file(file.id, "module 0x1::N {}", 1).await.unwrap();
    assert_eq!(updated.version, 2);

    let fetched = client.get_file(file.id).await.unwrap();
    assert_eq!(fetched.version, 2);
    assert_eq!(fetched.text(), "module 0x1::N {}");

    let history = client.history(file.id).await.unwrap();
    assert_eq!(history.iter().map(|r| r.version).collect::<Vec<_>>(), vec![1, 2]);
}

#[tokio::test]
async fn test_two_clients_conflict() {
    let (url, server) = start_test_server().await;
    let project = Uuid::new_v4();
    let alice = connected_client(&url, project, "Alice").await;
    let bob = connected_client(&url, project, "Bob").await;

    let file = alice.create_file(NewFile::file(project, None, "a.move", "v1")).await.unwrap();
    let seen_by_bob = bob.get_file(file.id).await.unwrap();
    assert_eq!(seen_by_bob.version, 1);

    alice.update_file(file.id, "alice", 1).await.unwrap();
    let err = bob.update_file(file.id, "bob", 1).await.unwrap_err();

    match err {
        SyncError::VersionConflict { conflict, server_file } => {
            assert_eq!(conflict.file_id, file.id);
            assert_eq!(conflict.attempted_version, 1);
            assert_eq!(conflict.attempted_content, "bob");
            assert_eq!(conflict.server_version, 2);
            assert_eq!(conflict.server_content, "alice");
            assert_eq!(server_file.version, 2);
        }
        other => panic!("Expected conflict, got {other:?}"),
    }

    // The losing write changed nothing
    assert_eq!(alice.get_file(file.id).await.unwrap().text(), "alice");
    assert_eq!(server.stats().await.conflicts, 1);
}

#[tokio::test]
async fn test_concurrent_updates_exactly_one_winner() {
    let (url, _server) = start_test_server().await;
    let project = Uuid::new_v4();
    let owner = connected_client(&url, project, "Owner").await;
    let file = owner.create_file(NewFile::file(project, None, "race.move", "")).await.unwrap();

    let mut clients = Vec::new();
    for i in 0..6 {
        clients.push(Arc::new(connected_client(&url, project, &format!("Writer{i}")).await));
    }

    let mut handles = Vec::new();
    for (i, client) in clients.iter().enumerate() {
        let client = Arc::clone(client);
        let id = file.id;
        handles.push(tokio::spawn(async move {
            client.update_file(id, &format!("writer {i}"), 1).await
        }));
    }

    let mut winners = 0;
    let mut conflicts = 0;
    for handle in handles {
        match handle.await.unwrap() {
            Ok(f) => {
                assert_eq!(f.version, 2);
                winners += 1;
            }
            Err(SyncError::VersionConflict { conflict, .. }) => {
                assert_eq!(conflict.server_version, 2);
                conflicts += 1;
            }
            Err(other) => panic!("Unexpected error {other:?}"),
        }
    }
    assert_eq!(winners, 1);
    assert_eq!(conflicts, 5);
    assert_eq!(owner.get_file(file.id).await.unwrap().version, 2);
}

#[tokio::test]
async fn test_folder_cascade_delete() {
    let (url, _server) = start_test_server().await;
    let project = Uuid::new_v4();
    let client = connected_client(&url, project, "Alice").await;

    let src = client.create_file(NewFile::folder(project, None, "src")).await.unwrap();
    let nested = client.create_file(NewFile::folder(project, Some(src.id), "util")).await.unwrap();
    let a = client.create_file(NewFile::file(project, Some(src.id), "a.move", "a")).await.unwrap();
    let b = client.create_file(NewFile::file(project, Some(nested.id), "b.move", "b")).await.unwrap();
    let keep = client.create_file(NewFile::file(project, None, "Move.toml", "")).await.unwrap();

    let removed = client.delete_file(src.id).await.unwrap();
    assert_eq!(removed.len(), 4);
    assert_eq!(removed.last(), Some(&src.id));

    for id in [src.id, nested.id, a.id, b.id] {
        assert!(matches!(client.get_file(id).await, Err(SyncError::NotFound(_))));
    }
    let remaining = client.list_files(Some(project), None).await.unwrap();
    assert_eq!(remaining.len(), 1);
    assert_eq!(remaining[0].id, keep.id);
    assert!(remaining[0].content.is_none(), "Listings omit content");

    assert!(matches!(client.delete_file(src.id).await, Err(SyncError::NotFound(_))));
}

#[tokio::test]
async fn test_validation_errors() {
    let (url, _server) = start_test_server().await;
    let project = Uuid::new_v4();
    let client = connected_client(&url, project, "Alice").await;

    let err = client.create_file(NewFile::file(project, None, "  ", "x")).await.unwrap_err();
    assert!(matches!(err, SyncError::Validation(_)));

    let err = client
        .create_file(NewFile::file(project, Some(Uuid::new_v4()), "orphan.move", "x"))
        .await
        .unwrap_err();
    assert!(matches!(err, SyncError::NotFound(_)));

    let folder = client.create_file(NewFile::folder(project, None, "src")).await.unwrap();
    let err = client.update_file(folder.id, "text", 1).await.unwrap_err();
    assert!(matches!(err, SyncError::Validation(_)));
}

#[tokio::test]
async fn test_file_saved_notifies_other_sessions() {
    let (url, _server) = start_test_server().await;
    let project = Uuid::new_v4();
    let alice = connected_client(&url, project, "Alice").await;
    let bob = SyncClient::new(ClientIdentity::new(project, "Bob"), &url, ClientConfig::for_testing());
    let mut bob_events = bob.take_event_rx().unwrap();
    bob.connect().await.unwrap();
    let mut alice_events = alice.take_event_rx().unwrap();

    let file = alice.create_file(NewFile::file(project, None, "a.move", "v1")).await.unwrap();
    alice.update_file(file.id, "v2", 1).await.unwrap();

    let alice_session = alice.session().await.unwrap().id;
    match wait_for(&mut bob_events, |e| matches!(e, ClientEvent::FileSaved { .. })).await {
        ClientEvent::FileSaved { file_id, version, session_id } => {
            assert_eq!(file_id, file.id);
            assert_eq!(version, 2);
            assert_eq!(session_id, alice_session);
        }
        other => panic!("Unexpected event {other:?}"),
    }

    // The saver does not get its own save echoed
    alice.ping().await.unwrap();
    while let Ok(event) = alice_events.try_recv() {
        assert!(!matches!(event, ClientEvent::FileSaved { .. }), "Own save echoed: {event:?}");
    }
}

#[tokio::test]
async fn test_agent_saves_through_client() {
    let (url, _server) = start_test_server().await;
    let project = Uuid::new_v4();
    let alice = Arc::new(connected_client(&url, project, "Alice").await);
    let bob = connected_client(&url, project, "Bob").await;

    let file: File = alice.create_file(NewFile::file(project, None, "lib.move", "v1")).await.unwrap();
    let (events_tx, mut events) = mpsc::unbounded_channel();
    let transport: Arc<dyn SaveTransport> = alice.clone();
    let agent = ClientSyncAgent::new(&file, transport, AgentConfig::for_testing(), events_tx);

    agent.update_content("v");
    agent.update_content("v2");
    agent.update_content("v2 edited");
    assert_eq!(agent.flush().await, SyncState::Clean);
    assert_eq!(agent.known_version(), 2);
    assert_eq!(bob.get_file(file.id).await.unwrap().text(), "v2 edited");
    assert!(matches!(
        events.recv().await,
        Some(AgentEvent::Saved { version: 2, .. })
    ));

    // Someone else saves; the agent's next save conflicts and keeps its buffer
    bob.update_file(file.id, "bob wins", 2).await.unwrap();
    agent.update_content("alice again");
    assert_eq!(agent.flush().await, SyncState::Conflict);
    assert_eq!(agent.content(), "alice again");
    let conflict = agent.error().unwrap();
    assert_eq!(conflict.server_version, 3);
    assert_eq!(conflict.server_content, "bob wins");
}

#[tokio::test]
async fn test_disconnect_makes_calls_transient() {
    let (url, _server) = start_test_server().await;
    let client = connected_client(&url, Uuid::new_v4(), "Alice").await;

    client.disconnect().await;
    assert_eq!(client.connection_state().await, ConnectionState::Disconnected);
    let err = client.ping().await.unwrap_err();
    assert!(err.is_transient());
}

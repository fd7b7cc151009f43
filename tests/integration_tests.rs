//! Integration tests for the session relay
//!
//! These tests run a real server on a loopback UDP socket and drive it with
//! real clients.

use client::network::{Client, ClientError};
use client::state::ViewChange;
use server::config::ServerConfig;
use server::network::{Server, ShutdownHandle};
use server::relay::Relay;
use shared::{Packet, Pose, Quaternion, SceneObject, SessionId, Vector3, MAX_DATAGRAM_LEN};
use std::net::SocketAddr;
use std::time::Duration;
use tokio::net::UdpSocket;
use tokio::time::{sleep, timeout, Instant};

const CONNECT_WAIT: Duration = Duration::from_secs(2);

struct TestServer {
    addr: SocketAddr,
    relay: Relay<UdpSocket>,
    shutdown: ShutdownHandle,
}

impl Drop for TestServer {
    fn drop(&mut self) {
        self.shutdown.shutdown();
    }
}

async fn start_server(config: ServerConfig) -> TestServer {
    let config = config.with_bind_addr("127.0.0.1:0");
    let mut server = Server::bind(&config).await.unwrap();
    let test_server = TestServer {
        addr: server.local_addr().unwrap(),
        relay: server.relay(),
        shutdown: server.shutdown_handle(),
    };
    tokio::spawn(async move {
        let _ = server.run().await;
    });
    test_server
}

/// Heartbeats slow enough to stay out of the way
fn quiet_config() -> ServerConfig {
    ServerConfig::default().with_heartbeat(Duration::from_secs(30), 3)
}

async fn connect(server: &TestServer) -> Client {
    let mut client = Client::new(&server.addr.to_string()).await.unwrap();
    client.connect(CONNECT_WAIT).await.unwrap();
    client
}

/// Polls until `done` holds for the client's view or `wait` runs out
async fn poll_until(
    client: &mut Client,
    wait: Duration,
    mut done: impl FnMut(&Client) -> bool,
) -> bool {
    let deadline = Instant::now() + wait;
    while Instant::now() < deadline {
        client.poll(Duration::from_millis(20)).await.unwrap();
        if done(client) {
            return true;
        }
    }
    done(client)
}

fn object_at(id: &str, x: f32) -> SceneObject {
    SceneObject::new(id).with_transform(
        Vector3::new(x, 0.0, 0.0),
        Vector3::ONE,
        Quaternion::IDENTITY,
    )
}

/// SESSION LIFECYCLE TESTS
mod session_tests {
    use super::*;

    #[tokio::test]
    async fn handshake_assigns_distinct_ids() {
        let server = start_server(quiet_config()).await;

        let first = connect(&server).await;
        let second = connect(&server).await;

        assert!(first.session().is_assigned());
        assert!(second.session().is_assigned());
        assert_ne!(first.session(), second.session());
        assert_eq!(server.relay.session_count().await, 2);
    }

    #[tokio::test]
    async fn reconnect_keeps_session() {
        let server = start_server(quiet_config()).await;
        let mut client = connect(&server).await;
        let id = client.session();

        let again = client.connect(CONNECT_WAIT).await.unwrap();
        assert_eq!(again, id);
        assert_eq!(server.relay.session_count().await, 1);
    }

    #[tokio::test]
    async fn server_full_gets_no_session() {
        let config = ServerConfig {
            max_sessions: 1,
            ..quiet_config()
        };
        let server = start_server(config).await;
        let _first = connect(&server).await;

        let mut second = Client::new(&server.addr.to_string()).await.unwrap();
        let result = second.connect(Duration::from_millis(400)).await;
        assert!(matches!(result, Err(ClientError::ConnectTimeout(_))));
        assert_eq!(server.relay.session_count().await, 1);
    }

    #[tokio::test]
    async fn disconnect_notifies_others() {
        let server = start_server(quiet_config()).await;
        let mut leaving = connect(&server).await;
        let mut staying = connect(&server).await;
        let id = leaving.session();

        leaving.send_head_pose(Pose::default()).await.unwrap();
        assert!(
            poll_until(&mut staying, Duration::from_secs(1), |c| c
                .view()
                .participant(id)
                .is_some())
            .await
        );

        leaving.disconnect().await.unwrap();
        assert!(
            poll_until(&mut staying, Duration::from_secs(1), |c| c
                .view()
                .participant(id)
                .is_none())
            .await
        );
        assert!(!server.relay.is_live(id).await);
    }

    #[tokio::test]
    async fn silent_session_times_out_once() {
        let config = ServerConfig::default().with_heartbeat(Duration::from_millis(100), 3);
        let server = start_server(config).await;
        let mut watcher = connect(&server).await;

        // A raw socket that asks for a session and then never answers
        let silent = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let request = Packet::SessionAssign {
            session: SessionId::NONE,
        };
        silent
            .send_to(&request.encode().unwrap(), server.addr)
            .await
            .unwrap();
        let mut buf = [0u8; MAX_DATAGRAM_LEN];
        let (len, _) = timeout(CONNECT_WAIT, silent.recv_from(&mut buf))
            .await
            .unwrap()
            .unwrap();
        let silent_id = match Packet::decode(&buf[..len]).unwrap() {
            Packet::SessionAssign { session } => session,
            other => panic!("Unexpected packet: {:?}", other),
        };

        let mut left = Vec::new();
        let deadline = Instant::now() + Duration::from_millis(1200);
        while Instant::now() < deadline {
            for change in watcher.poll(Duration::from_millis(20)).await.unwrap() {
                if let ViewChange::ParticipantLeft(session) = change {
                    left.push(session);
                }
            }
        }

        assert_eq!(left, vec![silent_id], "exactly one SessionEnded expected");
        assert!(!server.relay.is_live(silent_id).await);
        assert!(server.relay.is_live(watcher.session()).await);
        assert!(watcher.view().heartbeats_received > 0);
    }
}

/// RELAY TESTS
mod relay_tests {
    use super::*;

    #[tokio::test]
    async fn head_pose_reaches_everyone_but_sender() {
        let server = start_server(quiet_config()).await;
        let mut sender = connect(&server).await;
        let mut second = connect(&server).await;
        let mut third = connect(&server).await;
        let id = sender.session();

        let pose = Pose::new(Vector3::new(0.25, 1.7, 0.0), Quaternion::from_yaw(0.5));
        sender.send_head_pose(pose).await.unwrap();

        for receiver in [&mut second, &mut third] {
            assert!(
                poll_until(receiver, Duration::from_secs(1), |c| c
                    .view()
                    .participant(id)
                    .and_then(|p| p.head)
                    == Some(pose))
                .await
            );
        }

        let changes = sender.poll(Duration::from_millis(200)).await.unwrap();
        assert!(!changes
            .iter()
            .any(|change| matches!(change, ViewChange::ParticipantUpdated(s) if *s == id)));
        assert!(sender.view().participants.is_empty());
    }

    #[tokio::test]
    async fn voice_and_echo_are_relayed() {
        let server = start_server(quiet_config()).await;
        let mut speaker = connect(&server).await;
        let mut listener = connect(&server).await;
        let id = speaker.session();

        speaker
            .send_voice_frames(&[&[7u8; 38][..], &[9u8; 5][..]])
            .await
            .unwrap();
        speaker.send_echo("hello").await.unwrap();

        assert!(
            poll_until(&mut listener, Duration::from_secs(1), |c| {
                c.view().echoes.contains(&"hello".to_string())
                    && c.view().participant(id).map_or(0, |p| p.voice.len()) == 2
            })
            .await
        );
        let frames = listener.view_mut().take_voice(id);
        assert_eq!(frames, vec![vec![7u8; 38], vec![9u8; 5]]);
    }

    #[tokio::test]
    async fn malformed_datagram_is_dropped() {
        let server = start_server(quiet_config()).await;
        let mut first = connect(&server).await;
        let mut second = connect(&server).await;

        let raw = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        raw.send_to(&[0x00, 0x01, 0x02], server.addr).await.unwrap();

        first.send_echo("still here").await.unwrap();
        assert!(
            poll_until(&mut second, Duration::from_secs(1), |c| !c
                .view()
                .echoes
                .is_empty())
            .await
        );
        assert_eq!(server.relay.session_count().await, 2);
    }
}

/// OWNERSHIP TESTS
mod ownership_tests {
    use super::*;

    #[tokio::test]
    async fn first_claim_wins_over_the_wire() {
        let server = start_server(quiet_config()).await;
        let mut owner = connect(&server).await;
        let mut rival = connect(&server).await;
        let owner_id = owner.session();

        owner.claim_object(&object_at("chair1", 1.0)).await.unwrap();
        assert!(
            poll_until(&mut rival, Duration::from_secs(1), |c| c
                .view()
                .owner_of("chair1")
                == owner_id)
            .await
        );

        // The rival's optimistic claim is corrected by the server
        rival.claim_object(&object_at("chair1", 5.0)).await.unwrap();
        assert_eq!(rival.view().owner_of("chair1"), rival.session());
        assert!(
            poll_until(&mut rival, Duration::from_secs(1), |c| c
                .view()
                .owner_of("chair1")
                == owner_id)
            .await
        );

        assert_eq!(server.relay.owner_of("chair1").await, owner_id);
        let chair = server.relay.object("chair1").await.unwrap();
        assert_eq!(chair.position.x, 1.0);
    }

    #[tokio::test]
    async fn owner_leaving_releases_object() {
        let server = start_server(quiet_config()).await;
        let mut owner = connect(&server).await;
        let mut other = connect(&server).await;
        let owner_id = owner.session();

        owner.claim_object(&object_at("lamp", 2.0)).await.unwrap();
        assert!(
            poll_until(&mut other, Duration::from_secs(1), |c| c
                .view()
                .owner_of("lamp")
                == owner_id)
            .await
        );

        owner.disconnect().await.unwrap();
        assert!(
            poll_until(&mut other, Duration::from_secs(1), |c| c
                .view()
                .owner_of("lamp")
                == SessionId::NONE)
            .await
        );

        other.claim_object(&object_at("lamp", 3.0)).await.unwrap();
        sleep(Duration::from_millis(100)).await;
        assert_eq!(server.relay.owner_of("lamp").await, other.session());
    }

    #[tokio::test]
    async fn late_joiner_sees_existing_objects() {
        let server = start_server(quiet_config()).await;
        let mut owner = connect(&server).await;
        owner.claim_object(&object_at("table", 0.5)).await.unwrap();
        sleep(Duration::from_millis(100)).await;

        let mut late = connect(&server).await;
        assert!(
            poll_until(&mut late, Duration::from_secs(1), |c| c
                .view()
                .owner_of("table")
                == owner.session())
            .await
        );
        assert_eq!(late.view().objects["table"].position.x, 0.5);
    }
}

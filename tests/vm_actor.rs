//! Guest actor: command serialization and stop-event delivery.

mod common;

use std::time::Duration;

use common::Harness;
use inertia_guests::vm::{
    ActorHandle, DisplaySize, GuestHandle, GuestKind, LifecycleError, LifecycleState,
    spawn_guest_actor,
};

async fn wait_for_state(guest: &ActorHandle, want: LifecycleState) {
    let reached = tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            if guest.state().await.unwrap() == want {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await;
    assert!(reached.is_ok(), "guest never reached {want:?}");
}

#[tokio::test]
async fn concurrent_provisions_share_one_machine() {
    let h = Harness::new();
    let guest = spawn_guest_actor(h.controller(GuestKind::Linux));
    let other = guest.clone();

    let (a, b) = tokio::join!(guest.provision(), other.provision());
    assert_eq!(a.unwrap(), b.unwrap());
    assert_eq!(h.backend.count("instantiate"), 1);
    assert_eq!(h.backend.count("install"), 1);
    assert_eq!(guest.state().await.unwrap(), LifecycleState::Running);
}

#[tokio::test]
async fn actor_forwards_every_operation() {
    let h = Harness::new();
    let guest = spawn_guest_actor(h.controller(GuestKind::MacOs));
    assert_eq!(guest.kind(), GuestKind::MacOs);

    guest.provision().await.unwrap();
    guest
        .reconfigure_display(DisplaySize::new(1600, 1000))
        .await
        .unwrap();
    guest.suspend_and_persist().await.unwrap();
    assert_eq!(guest.state().await.unwrap(), LifecycleState::Paused);
    guest.resume().await.unwrap();
    guest.terminate().await.unwrap();

    let history = guest.history().await.unwrap();
    assert_eq!(history.first(), Some(&LifecycleState::NotProvisioned));
    assert_eq!(history.last(), Some(&LifecycleState::Terminated));
    assert_eq!(h.backend.displays(), vec![DisplaySize::new(1600, 1000)]);
}

#[tokio::test]
async fn progress_receiver_sees_completed_install() {
    let h = Harness::new();
    let guest = spawn_guest_actor(h.controller(GuestKind::Linux));
    let progress = guest.progress();

    guest.provision().await.unwrap();
    assert!(progress.borrow().is_complete());
}

#[tokio::test]
async fn errors_are_returned_to_the_caller() {
    let h = Harness::new();
    let guest = spawn_guest_actor(h.controller_with_iso(GuestKind::Linux, None));

    let err = guest.provision().await.unwrap_err();
    assert!(matches!(err, LifecycleError::Acquire { .. }));
    assert_eq!(guest.state().await.unwrap(), LifecycleState::NotProvisioned);
}

#[tokio::test]
async fn backend_stop_halts_and_reprovision_restores() {
    let h = Harness::new();
    let guest = spawn_guest_actor(h.controller(GuestKind::Linux));
    let handle = guest.provision().await.unwrap();

    h.backend.emit_stop(&handle, Some("guest crashed"));
    wait_for_state(&guest, LifecycleState::Halted).await;

    let restored = guest.provision().await.unwrap();
    assert_ne!(restored, handle);
    assert_eq!(guest.state().await.unwrap(), LifecycleState::Running);
    assert_eq!(h.backend.count("restore_state"), 1);
}

#[tokio::test]
async fn stops_for_the_other_kind_are_ignored() {
    let h = Harness::new();
    let linux = spawn_guest_actor(h.controller(GuestKind::Linux));
    let handle = linux.provision().await.unwrap();

    h.backend
        .emit_stop(&GuestHandle::new(handle.id(), GuestKind::MacOs), None);
    tokio::time::sleep(Duration::from_millis(50)).await;

    assert_eq!(linux.state().await.unwrap(), LifecycleState::Running);
    assert_eq!(h.backend.count("pause"), 0);
}
